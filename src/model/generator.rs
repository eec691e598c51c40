use crate::model::layers::{down_conv, head_conv, up_conv, upsample_nearest};
use crate::model::SaliencyModel;
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};

/// Configuration for the encoder/decoder saliency generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub input_channels: usize,
    pub generator_dim: usize,
    /// 0 disables latent injection.
    pub latent_dim: usize,
}

/// U-Net style generator with a coarse and a refined saliency head.
///
/// When built with a latent size, a projected latent code is added to the
/// bottleneck features, which is how the GAN and EBM variants condition the
/// prediction on noise.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    enc_convs: Vec<Conv2d<B>>,
    enc_bns: Vec<BatchNorm<B>>,
    latent_proj: Option<Linear<B>>,
    dec_convs: Vec<ConvTranspose2d<B>>,
    dec_bns: Vec<BatchNorm<B>>,
    coarse_head: Conv2d<B>,
    refined_head: Conv2d<B>,
    #[module(ignore)]
    bottleneck_channels: usize,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let dim = self.generator_dim;
        let enc_convs = vec![
            down_conv(self.input_channels, dim, true, device),
            down_conv(dim, dim * 2, false, device),
            down_conv(dim * 2, dim * 4, false, device),
        ];
        let enc_bns = vec![
            BatchNormConfig::new(dim * 2).init(device),
            BatchNormConfig::new(dim * 4).init(device),
        ];

        let latent_proj = (self.latent_dim > 0)
            .then(|| LinearConfig::new(self.latent_dim, dim * 4).init(device));

        // Skip connections double the decoder inputs after the first block.
        let dec_convs = vec![
            up_conv(dim * 4, dim * 2, device),
            up_conv(dim * 4, dim, device),
            up_conv(dim * 2, dim, device),
        ];
        let dec_bns = vec![
            BatchNormConfig::new(dim * 2).init(device),
            BatchNormConfig::new(dim).init(device),
        ];

        Generator {
            enc_convs,
            enc_bns,
            latent_proj,
            dec_convs,
            dec_bns,
            coarse_head: head_conv(dim * 4, 1, device),
            refined_head: head_conv(dim, 1, device),
            bottleneck_channels: dim * 4,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Forward pass returning `[coarse, refined]` logit maps at input resolution.
    pub fn forward(
        &self,
        image: Tensor<B, 4>,
        depth: Option<Tensor<B, 4>>,
        latent: Option<Tensor<B, 2>>,
    ) -> Vec<Tensor<B, 4>> {
        let input = match depth {
            Some(depth) => Tensor::cat(vec![image, depth], 1),
            None => image,
        };
        let [_, _, height, width] = input.dims();

        let (mut x, skips) = self.encode(input);
        if let (Some(proj), Some(latent)) = (&self.latent_proj, latent) {
            let dims = x.dims();
            x = x + self.project_latent(proj, latent, dims);
        }

        let x = relu(self.dec_bns[0].forward(self.dec_convs[0].forward(x)));
        let x = Tensor::cat(vec![x, skips[1].clone()], 1);
        let coarse = upsample_nearest(self.coarse_head.forward(x.clone()), height, width);

        let x = relu(self.dec_bns[1].forward(self.dec_convs[1].forward(x)));
        let x = Tensor::cat(vec![x, skips[0].clone()], 1);
        let x = relu(self.dec_convs[2].forward(x));
        let refined = self.refined_head.forward(x);

        vec![coarse, refined]
    }

    fn encode(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut skips = Vec::with_capacity(2);
        let mut x = leaky_relu(self.enc_convs[0].forward(input), 0.2);
        skips.push(x.clone());
        x = leaky_relu(self.enc_bns[0].forward(self.enc_convs[1].forward(x)), 0.2);
        skips.push(x.clone());
        x = leaky_relu(self.enc_bns[1].forward(self.enc_convs[2].forward(x)), 0.2);
        (x, skips)
    }

    fn project_latent(
        &self,
        proj: &Linear<B>,
        latent: Tensor<B, 2>,
        dims: [usize; 4],
    ) -> Tensor<B, 4> {
        let [batch, _, height, width] = dims;
        proj.forward(latent)
            .reshape([batch, self.bottleneck_channels, 1, 1])
            .expand([batch, self.bottleneck_channels, height, width])
    }
}

impl<B: Backend> SaliencyModel<B> for Generator<B> {
    fn predict(
        &self,
        image: Tensor<B, 4>,
        depth: Option<Tensor<B, 4>>,
        latent: Option<Tensor<B, 2>>,
    ) -> Vec<Tensor<B, 4>> {
        self.forward(image, depth, latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn outputs_match_input_resolution() {
        let device = Default::default();
        let generator = GeneratorConfig::new(3, 4, 0).init::<TestBackend>(&device);
        let image = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 24], &device);
        let outputs = generator.forward(image, None, None);
        assert_eq!(outputs.len(), 2);
        for output in outputs {
            assert_eq!(output.dims(), [2, 1, 32, 24]);
        }
    }

    #[test]
    fn depth_channel_is_concatenated() {
        let device = Default::default();
        let generator = GeneratorConfig::new(4, 4, 0).init::<TestBackend>(&device);
        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        let depth = Tensor::<TestBackend, 4>::zeros([1, 1, 16, 16], &device);
        let outputs = generator.forward(image, Some(depth), None);
        assert_eq!(outputs[1].dims(), [1, 1, 16, 16]);
    }

    #[test]
    fn latent_changes_the_prediction() {
        let device = Default::default();
        let generator = GeneratorConfig::new(3, 4, 8).init::<TestBackend>(&device);
        let image =
            Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Default, &device);
        let latent = Tensor::<TestBackend, 2>::ones([1, 8], &device).mul_scalar(3.0);

        let plain = generator.forward(image.clone(), None, None)[1].clone();
        let conditioned = generator.forward(image, None, Some(latent))[1].clone();
        let diff = plain.sub(conditioned).abs().sum().into_scalar().elem::<f32>();
        assert!(diff > 0.0);
    }

    #[test]
    fn both_outputs_backpropagate() {
        let device = Default::default();
        let generator = GeneratorConfig::new(3, 4, 0).init::<Autodiff<TestBackend>>(&device);
        let image = Tensor::<Autodiff<TestBackend>, 4>::random(
            [1, 3, 16, 16],
            Distribution::Default,
            &device,
        );
        let outputs = generator.forward(image, None, None);
        let loss = outputs[0].clone().sum().add(outputs[1].clone().sum());
        let grads = loss.backward();
        let grad = generator.coarse_head.weight.val().grad(&grads);
        assert!(grad.is_some());
    }
}
