//! Inference strategies for each uncertainty method and the shared post-processing.

use crate::config::{LangevinConfig, UncertaintyMethod};
use crate::error::{Error, Result};
use crate::langevin::LangevinSampler;
use crate::model::layers::resize_bilinear;
use crate::model::{EnergyFunction, SaliencyModel};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;

/// Guards min-max normalization of constant maps.
pub const NORMALIZE_EPSILON: f64 = 1e-8;

/// One forward-inference policy, chosen once at start-up.
pub trait InferenceStrategy<B: Backend> {
    fn method(&self) -> UncertaintyMethod;

    /// Latent code fed to the generator, if the method uses one.
    fn latent(&self, batch_size: usize, device: &B::Device) -> Option<Tensor<B, 2>>;

    /// Predict a `[batch, height, width]` map normalized to `[0, 255]`.
    fn forward(
        &self,
        model: &dyn SaliencyModel<B>,
        image: Tensor<B, 4>,
        depth: Option<Tensor<B, 4>>,
        height: usize,
        width: usize,
    ) -> Result<Tensor<B, 3>> {
        let device = image.device();
        let latent = self.latent(image.dims()[0], &device);
        let logits = model
            .predict(image, depth, latent)
            .pop()
            .ok_or(Error::EmptyModelOutput)?;
        Ok(postprocess(logits, height, width))
    }
}

/// `basic`, `vae` and `abp`: a single pass without latent noise.
#[derive(Clone, Copy, Debug)]
pub struct DeterministicStrategy {
    method: UncertaintyMethod,
}

impl<B: Backend> InferenceStrategy<B> for DeterministicStrategy {
    fn method(&self) -> UncertaintyMethod {
        self.method
    }

    fn latent(&self, _batch_size: usize, _device: &B::Device) -> Option<Tensor<B, 2>> {
        None
    }
}

/// `gan`: a fresh standard-normal latent per forward pass.
#[derive(Clone, Copy, Debug)]
pub struct GanStrategy {
    latent_dim: usize,
}

impl<B: Backend> InferenceStrategy<B> for GanStrategy {
    fn method(&self) -> UncertaintyMethod {
        UncertaintyMethod::Gan
    }

    fn latent(&self, batch_size: usize, device: &B::Device) -> Option<Tensor<B, 2>> {
        Some(Tensor::random(
            [batch_size, self.latent_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        ))
    }
}

/// `ebm`: a latent refined by Langevin sampling under the energy prior.
///
/// Sampling needs gradients, so the sampler lives on the autodiff backend while
/// the generator runs on its inner backend.
pub struct EbmStrategy<A: AutodiffBackend, E> {
    sampler: LangevinSampler<A, E>,
}

impl<A: AutodiffBackend, E: EnergyFunction<A>> EbmStrategy<A, E> {
    pub fn new(sampler: LangevinSampler<A, E>) -> Self {
        Self { sampler }
    }
}

impl<A, E> InferenceStrategy<A::InnerBackend> for EbmStrategy<A, E>
where
    A: AutodiffBackend,
    E: EnergyFunction<A>,
{
    fn method(&self) -> UncertaintyMethod {
        UncertaintyMethod::Ebm
    }

    fn latent(
        &self,
        batch_size: usize,
        device: &<A::InnerBackend as Backend>::Device,
    ) -> Option<Tensor<A::InnerBackend, 2>> {
        Some(self.sampler.sample(batch_size, device).inner())
    }
}

/// Build the strategy for `method`. `energy` is required for `ebm` and ignored otherwise.
pub fn select_strategy<A, E>(
    method: UncertaintyMethod,
    latent_dim: usize,
    langevin: &LangevinConfig,
    energy: Option<E>,
) -> Result<Box<dyn InferenceStrategy<A::InnerBackend>>>
where
    A: AutodiffBackend,
    E: EnergyFunction<A> + 'static,
{
    if method.needs_latent() && latent_dim == 0 {
        return Err(Error::Configuration(format!(
            "uncertainty method `{method}` needs a latent dimension"
        )));
    }
    let strategy: Box<dyn InferenceStrategy<A::InnerBackend>> = match method {
        UncertaintyMethod::Basic | UncertaintyMethod::Vae | UncertaintyMethod::Abp => {
            Box::new(DeterministicStrategy { method })
        }
        UncertaintyMethod::Gan => Box::new(GanStrategy { latent_dim }),
        UncertaintyMethod::Ebm => {
            let energy = energy.ok_or_else(|| {
                Error::Configuration("the ebm method needs an energy model".into())
            })?;
            let sampler = LangevinSampler::<A, E>::new(energy, langevin.clone(), latent_dim);
            Box::new(EbmStrategy::new(sampler))
        }
    };
    Ok(strategy)
}

/// Resize logits to `(height, width)`, apply sigmoid and min-max normalize per sample.
pub fn postprocess<B: Backend>(logits: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 3> {
    let probs = sigmoid(resize_bilinear(logits, height, width));
    let [batch, _, h, w] = probs.dims();
    min_max_normalize(probs.reshape([batch, h, w]))
}

/// `255 * (x - min) / (max - min + eps)` per sample; constant maps become zero.
pub fn min_max_normalize<B: Backend>(map: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch, height, width] = map.dims();
    let flat = map.reshape([batch, height * width]);
    let min = flat.clone().min_dim(1);
    let max = flat.clone().max_dim(1);
    let range = max.sub(min.clone()).add_scalar(NORMALIZE_EPSILON);
    flat.sub(min)
        .div(range)
        .mul_scalar(255.0)
        .reshape([batch, height, width])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnergyPrior;
    use burn::backend::{Autodiff, NdArray};

    type Inner = NdArray<f32>;
    type TestBackend = Autodiff<Inner>;

    /// Records whether a latent was passed and returns two constant-gradient maps.
    struct StubModel {
        latent_dim: usize,
    }

    impl SaliencyModel<Inner> for StubModel {
        fn predict(
            &self,
            image: Tensor<Inner, 4>,
            _depth: Option<Tensor<Inner, 4>>,
            latent: Option<Tensor<Inner, 2>>,
        ) -> Vec<Tensor<Inner, 4>> {
            if let Some(latent) = &latent {
                assert_eq!(latent.dims()[1], self.latent_dim);
            }
            let [batch, _, h, w] = image.dims();
            let device = image.device();
            let ramp = Tensor::<Inner, 1, Int>::arange(0..(h * w) as i64, &device)
                .float()
                .reshape([1, 1, h, w])
                .repeat_dim(0, batch);
            vec![Tensor::zeros([batch, 1, h, w], &device), ramp]
        }
    }

    #[test]
    fn constant_map_normalizes_to_zero() {
        let device = Default::default();
        let map = Tensor::<Inner, 3>::full([1, 4, 4], 128.0, &device);
        let values = min_max_normalize(map).into_data().to_vec::<f32>().unwrap();
        assert_eq!(values.len(), 16);
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn normalization_spans_full_range_per_sample() {
        let device = Default::default();
        let map = Tensor::<Inner, 1>::from_floats([0.0, 1.0, 2.0, 3.0, 10.0, 10.0, 10.0, 20.0], &device)
            .reshape([2, 2, 2]);
        let values = min_max_normalize(map).into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 0.0).abs() < 1e-3);
        assert!((values[3] - 255.0).abs() < 1e-3);
        assert!((values[4] - 0.0).abs() < 1e-3);
        assert!((values[7] - 255.0).abs() < 1e-3);
    }

    #[test]
    fn unknown_method_string_never_reaches_selection() {
        assert!(matches!(
            "mc-dropout".parse::<UncertaintyMethod>(),
            Err(Error::UnknownUncertaintyMethod(_))
        ));
    }

    #[test]
    fn deterministic_methods_take_last_output_without_latent() {
        let device = Default::default();
        for method in [UncertaintyMethod::Basic, UncertaintyMethod::Vae, UncertaintyMethod::Abp] {
            let strategy = select_strategy::<TestBackend, EnergyPrior<TestBackend>>(
                method,
                8,
                &LangevinConfig::new(),
                None,
            )
            .unwrap();
            assert_eq!(strategy.method(), method);
            assert!(strategy.latent(2, &device).is_none());

            let image = Tensor::<Inner, 4>::zeros([1, 3, 4, 4], &device);
            let out = strategy
                .forward(&StubModel { latent_dim: 8 }, image, None, 4, 4)
                .unwrap();
            let values = out.into_data().to_vec::<f32>().unwrap();
            // The last output is a ramp, so the map spans [0, 255].
            assert!(values[0].abs() < 1e-3);
            assert!((values[15] - 255.0).abs() < 1e-3);
        }
    }

    #[test]
    fn gan_draws_latent_of_configured_size() {
        let device = Default::default();
        let strategy = select_strategy::<TestBackend, EnergyPrior<TestBackend>>(
            UncertaintyMethod::Gan,
            5,
            &LangevinConfig::new(),
            None,
        )
        .unwrap();
        let latent = strategy.latent(3, &device).unwrap();
        assert_eq!(latent.dims(), [3, 5]);

        let image = Tensor::<Inner, 4>::zeros([1, 3, 8, 8], &device);
        let out = strategy
            .forward(&StubModel { latent_dim: 5 }, image, None, 12, 10)
            .unwrap();
        assert_eq!(out.dims(), [1, 12, 10]);
    }

    #[test]
    fn ebm_requires_energy_model() {
        let result = select_strategy::<TestBackend, EnergyPrior<TestBackend>>(
            UncertaintyMethod::Ebm,
            4,
            &LangevinConfig::new(),
            None,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn ebm_samples_latent_through_energy_prior() {
        let device = Default::default();
        let energy = crate::model::ModelConfig::new()
            .with_latent_dim(4)
            .with_ebm_middle_dim(8)
            .init_energy::<TestBackend>(&device);
        let strategy = select_strategy::<TestBackend, _>(
            UncertaintyMethod::Ebm,
            4,
            &LangevinConfig::new(),
            Some(energy),
        )
        .unwrap();
        assert_eq!(strategy.method(), UncertaintyMethod::Ebm);
        let latent = strategy.latent(2, &device).unwrap();
        assert_eq!(latent.dims(), [2, 4]);
        let values = latent.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
