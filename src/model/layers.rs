use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        LeakyRelu, LeakyReluConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{Error, Result};

/// Convolution followed by a leaky ReLU, padded so a stride of one keeps the
/// spatial size.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    lrelu: LeakyRelu,
}
impl<B: Backend> ConvBlock<B> {
    pub fn new(channels: [usize; 2], kernel: usize, stride: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_padding(PaddingConfig2d::Explicit(kernel / 2, kernel / 2))
            .with_stride([stride, stride])
            .init(device);
        let lrelu = LeakyReluConfig::new().init();

        Self { conv, lrelu }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        self.lrelu.forward(output)
    }
}

/// Two 3x3 convolutions around a leaky ReLU with an identity shortcut.
///
/// When `tied` is set the second filter bank (`conv1`) is applied on both
/// sides of the activation and `conv` is carried along untouched, which is
/// how the published cartoonization weights were trained. Clearing it runs
/// `conv` then `conv1`.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv: Conv2d<B>,
    conv1: Conv2d<B>,
    lrelu: LeakyRelu,
    tied: bool,
}
impl<B: Backend> ResidualBlock<B> {
    pub fn new(channels: [usize; 2], tied: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let conv1 = Conv2dConfig::new([channels[1], channels[1]], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let lrelu = LeakyReluConfig::new().init();

        Self {
            conv,
            conv1,
            lrelu,
            tied,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = match self.tied {
            true => self.conv1.forward(input.clone()),
            false => self.conv.forward(input.clone()),
        };
        let output = self.lrelu.forward(output);
        let output = self.conv1.forward(output);

        input.add(output)
    }
}

/// Corner-aligned bilinear resize of the two spatial dims by `factor`.
pub fn upsample_bilinear<B: Backend>(input: Tensor<B, 4>, factor: usize) -> Tensor<B, 4> {
    let [_, _, height, width] = input.dims();

    interpolate(
        input,
        [height * factor, width * factor],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}

/// Adds an encoder activation onto a decoder activation. Shapes must match
/// exactly; size-one dims are not broadcast.
pub fn add_skip<B: Backend>(
    input: Tensor<B, 4>,
    skip: Tensor<B, 4>,
    stage: &'static str,
) -> Result<Tensor<B, 4>> {
    let (left, right) = (input.dims(), skip.dims());
    if left != right {
        return Err(Error::ShapeMismatch {
            stage,
            left: left.to_vec(),
            right: right.to_vec(),
        });
    }

    Ok(input.add(skip))
}
