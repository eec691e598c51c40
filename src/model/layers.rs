use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// 4x4 stride-2 convolution that halves the spatial size.
pub fn down_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}

/// 4x4 stride-2 transposed convolution that doubles the spatial size.
pub fn up_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .init(device)
}

/// 3x3 same-size convolution, used for the single-channel heads.
pub fn head_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// Nearest-neighbour resize of a BCHW tensor; a no-op when the size already matches.
///
/// Use this on tensors that take part in backpropagation: bilinear
/// interpolation has no backward pass on the ndarray and cubecl backends.
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if h == height && w == width {
        return x;
    }
    interpolate(
        x,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

/// Bilinear resize of a BCHW tensor; a no-op when the size already matches.
///
/// Only for data and inference outputs, never inside the autodiff graph.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if h == height && w == width {
        return x;
    }
    interpolate(
        x,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}
