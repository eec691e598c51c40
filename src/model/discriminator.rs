use crate::model::layers::{down_conv, head_conv};
use crate::model::ConfidenceModel;
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the fully convolutional confidence discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    /// Image channels; the saliency map adds one more.
    pub input_channels: usize,
    pub discriminator_dim: usize,
}

/// Per-pixel discriminator scoring `cat(image, saliency)` at quarter resolution.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    bn: BatchNorm<B>,
    classifier: Conv2d<B>,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let in_channels = self.input_channels + 1;
        let convs = vec![
            down_conv(in_channels, self.discriminator_dim, true, device),
            down_conv(self.discriminator_dim, self.discriminator_dim * 2, false, device),
        ];
        Discriminator {
            convs,
            bn: BatchNormConfig::new(self.discriminator_dim * 2).init(device),
            classifier: head_conv(self.discriminator_dim * 2, 1, device),
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning `[batch, 1, h / 4, w / 4]` logits.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = leaky_relu(self.convs[0].forward(input), 0.2);
        let x = leaky_relu(self.bn.forward(self.convs[1].forward(x)), 0.2);
        self.classifier.forward(x)
    }
}

impl<B: Backend> ConfidenceModel<B> for Discriminator<B> {
    fn confidence_logits(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(input)
    }
}
