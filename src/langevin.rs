//! Short-run Langevin sampling of latent codes under an energy prior.

use crate::config::LangevinConfig;
use crate::model::EnergyFunction;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

/// Refines Gaussian latent codes with a fixed number of Langevin steps.
///
/// Each step computes `dE/dz` through the energy model, so inference cost grows
/// linearly with `steps`.
pub struct LangevinSampler<B: AutodiffBackend, E> {
    energy: E,
    config: LangevinConfig,
    latent_dim: usize,
    _backend: std::marker::PhantomData<B>,
}

impl<B: AutodiffBackend, E: EnergyFunction<B>> LangevinSampler<B, E> {
    pub fn new(energy: E, config: LangevinConfig, latent_dim: usize) -> Self {
        Self {
            energy,
            config,
            latent_dim,
            _backend: std::marker::PhantomData,
        }
    }

    pub fn config(&self) -> &LangevinConfig {
        &self.config
    }

    /// Draw `z_0 ~ N(0, init_sigma^2)` for a batch.
    pub fn initial_latent(&self, batch_size: usize, device: &B::Device) -> Tensor<B, 2> {
        Tensor::random(
            [batch_size, self.latent_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        )
        .mul_scalar(self.config.init_sigma)
    }

    /// Sample a fresh latent and refine it.
    pub fn sample(&self, batch_size: usize, device: &B::Device) -> Tensor<B, 2> {
        self.refine(self.initial_latent(batch_size, device))
    }

    /// Run exactly `steps` Langevin updates starting from `initial`.
    pub fn refine(&self, initial: Tensor<B, 2>) -> Tensor<B, 2> {
        (0..self.config.steps).fold(initial.detach(), |latent, _| self.step(latent))
    }

    /// `z' = z - s^2 / 2 * (dE/dz + z / prior_sigma^2) + s * eps`
    pub fn step(&self, latent: Tensor<B, 2>) -> Tensor<B, 2> {
        let step_size = self.config.step_size;
        let prior_precision = 1.0 / (self.config.prior_sigma * self.config.prior_sigma);

        let latent = latent.detach().require_grad();
        let energy = self.energy.energy(latent.clone()).sum();
        let grads = energy.backward();
        let grad = latent
            .grad(&grads)
            .map(Tensor::<B, 2>::from_inner)
            .unwrap_or_else(|| latent.zeros_like());

        let latent = latent.detach();
        let drift = grad
            .add(latent.clone().mul_scalar(prior_precision))
            .mul_scalar(0.5 * step_size * step_size);
        let noise = Tensor::<B, 2>::random(latent.shape(), Distribution::Normal(0.0, 1.0), &latent.device())
            .mul_scalar(step_size);
        latent.sub(drift).add(noise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    /// `E(z) = 0.5 * |z|^2` per row, so `dE/dz = z`.
    struct Quadratic;

    impl EnergyFunction<TestBackend> for Quadratic {
        fn energy(&self, latent: Tensor<TestBackend, 2>) -> Tensor<TestBackend, 2> {
            latent.powf_scalar(2.0).sum_dim(1).mul_scalar(0.5)
        }
    }

    fn sampler(config: LangevinConfig, latent_dim: usize) -> LangevinSampler<TestBackend, Quadratic> {
        LangevinSampler::new(Quadratic, config, latent_dim)
    }

    fn values(tensor: Tensor<TestBackend, 2>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn zero_steps_returns_initial_latent() {
        let device = Default::default();
        let sampler = sampler(LangevinConfig::new().with_steps(0), 6);
        let initial = sampler.initial_latent(3, &device);
        let refined = sampler.refine(initial.clone());
        assert_eq!(values(refined), values(initial));
    }

    #[test]
    fn zero_step_size_returns_initial_latent() {
        let device = Default::default();
        let sampler = sampler(LangevinConfig::new().with_steps(5).with_step_size(0.0), 6);
        let initial = sampler.initial_latent(2, &device);
        let refined = sampler.refine(initial.clone());
        assert_eq!(values(refined), values(initial));
    }

    #[test]
    fn small_step_stays_close_to_start() {
        let device = Default::default();
        let step_size = 1e-3;
        let sampler = sampler(LangevinConfig::new().with_steps(1).with_step_size(step_size), 4);
        let initial = Tensor::<TestBackend, 2>::ones([1, 4], &device).mul_scalar(10.0);
        let refined = values(sampler.refine(initial));
        // Drift moves z by 1e-5, noise by a few 1e-3.
        for value in refined {
            assert!((value - 10.0).abs() < 0.01, "{value}");
        }
    }

    #[test]
    fn initial_latent_has_configured_shape() {
        let device = Default::default();
        let sampler = sampler(LangevinConfig::new(), 32);
        assert_eq!(sampler.sample(3, &device).dims(), [3, 32]);
    }
}
