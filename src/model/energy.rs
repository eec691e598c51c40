use crate::model::EnergyFunction;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::gelu;

/// Configuration for the latent-space energy prior.
#[derive(Config, Debug)]
pub struct EnergyPriorConfig {
    pub latent_dim: usize,
    pub middle_dim: usize,
    pub out_dim: usize,
}

/// MLP energy over latent codes.
#[derive(Module, Debug)]
pub struct EnergyPrior<B: Backend> {
    layers: Vec<Linear<B>>,
}

impl EnergyPriorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EnergyPrior<B> {
        let layers = vec![
            LinearConfig::new(self.latent_dim, self.middle_dim).init(device),
            LinearConfig::new(self.middle_dim, self.middle_dim).init(device),
            LinearConfig::new(self.middle_dim, self.out_dim).init(device),
        ];
        EnergyPrior { layers }
    }
}

impl<B: Backend> EnergyPrior<B> {
    pub fn forward(&self, latent: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = gelu(self.layers[0].forward(latent));
        let x = gelu(self.layers[1].forward(x));
        self.layers[2].forward(x)
    }
}

impl<B: Backend> EnergyFunction<B> for EnergyPrior<B> {
    fn energy(&self, latent: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(latent)
    }
}
