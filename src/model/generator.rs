use std::path::PathBuf;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
};

use crate::{
    error::Error,
    model::layers::{add_skip, upsample_bilinear, ConvBlock, ResidualBlock},
};

/// Encoder step: a stride-2 block halving the resolution, then a block
/// changing the channel count.
#[derive(Module, Debug)]
pub struct DownStage<B: Backend> {
    down: ConvBlock<B>,
    widen: ConvBlock<B>,
}
impl<B: Backend> DownStage<B> {
    pub fn new(channels: [usize; 2], device: &B::Device) -> Self {
        let down = ConvBlock::new([channels[0], channels[0]], 3, 2, device);
        let widen = ConvBlock::new(channels, 3, 1, device);

        Self { down, widen }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.down.forward(input);
        self.widen.forward(output)
    }
}

/// Decoder step: bilinear upsample, add the encoder activation of the same
/// resolution, then run the convolution blocks in order.
#[derive(Module, Debug)]
pub struct UpStage<B: Backend> {
    convs: Vec<ConvBlock<B>>,
}
impl<B: Backend> UpStage<B> {
    pub fn new(channels: &[usize], device: &B::Device) -> Self {
        let convs = channels
            .windows(2)
            .map(|pair| ConvBlock::new([pair[0], pair[1]], 3, 1, device))
            .collect();

        Self { convs }
    }

    pub fn forward(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> crate::error::Result<Tensor<B, 4>> {
        let output = upsample_bilinear(input, 2);
        let output = add_skip(output, skip, "generator skip connection")?;

        Ok(self
            .convs
            .iter()
            .fold(output, |output, conv| conv.forward(output)))
    }
}

/// Image-to-image U-Net: two encoder levels, a residual bottleneck at a
/// quarter of the input resolution and a mirrored decoder with additive skip
/// connections.
#[derive(Module, Debug)]
pub struct UnetGenerator<B: Backend> {
    stem: ConvBlock<B>,
    down: Vec<DownStage<B>>,
    bottleneck: Vec<ResidualBlock<B>>,
    reduce: ConvBlock<B>,
    up: Vec<UpStage<B>>,
    head: Conv2d<B>,
}
impl<B: Backend> UnetGenerator<B> {
    /// Translates a `[batch, 3, height, width]` image in `[-1, 1]` into one of
    /// the same shape. Height and width must be multiples of 4 for the skip
    /// connections to line up.
    pub fn try_forward(&self, input: Tensor<B, 4>) -> crate::error::Result<Tensor<B, 4>> {
        let [_, channels, _, _] = input.dims();
        if channels != 3 {
            return Err(Error::InvalidInput(format!(
                "generator expects 3 input channels, got {channels}"
            )));
        }

        let mut skips = Vec::with_capacity(self.down.len());
        let mut output = self.stem.forward(input);
        for stage in &self.down {
            skips.push(output.clone());
            output = stage.forward(output);
        }

        let output = self
            .bottleneck
            .iter()
            .fold(output, |output, block| block.forward(output));
        let mut output = self.reduce.forward(output);

        for (stage, skip) in self.up.iter().zip(skips.into_iter().rev()) {
            output = stage.forward(output, skip)?;
        }

        let output = self.head.forward(output);

        Ok(burn::tensor::activation::tanh(output))
    }

    /// # Panics
    ///
    /// On the conditions [`UnetGenerator::try_forward`] reports as errors.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.try_forward(input) {
            Ok(output) => output,
            Err(err) => panic!("{err}"),
        }
    }

    /// Replaces the parameters with a record saved by the named MessagePack
    /// file recorder at full precision.
    pub fn load_weights(self, path: impl Into<PathBuf>, device: &B::Device) -> crate::error::Result<Self> {
        let record = NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .load(path.into(), device)
            .map_err(|err| Error::Record(format!("{err:?}")))?;

        Ok(self.load_record(record))
    }
}

#[derive(Config, Debug)]
pub struct UnetGeneratorConfig {
    #[config(default = 32)]
    pub channel: usize,
    #[config(default = 4)]
    pub num_blocks: usize,
    /// Reuse the second filter bank on both sides of each residual block's
    /// activation. See [`ResidualBlock`].
    #[config(default = true)]
    pub tied_residual_convs: bool,
}
impl UnetGeneratorConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.channel == 0 {
            return Err(Error::InvalidConfig {
                name: "UnetGenerator",
                reason: "channel must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UnetGenerator<B> {
        let c = self.channel;
        log::debug!(
            "building UnetGenerator (channel: {c}, blocks: {}, tied: {})",
            self.num_blocks,
            self.tied_residual_convs
        );

        let stem = ConvBlock::new([3, c], 7, 1, device);
        let down = vec![
            DownStage::new([c, c * 2], device),
            DownStage::new([c * 2, c * 4], device),
        ];

        let bottleneck = (0..self.num_blocks)
            .map(|_| ResidualBlock::new([c * 4, c * 4], self.tied_residual_convs, device))
            .collect();
        let reduce = ConvBlock::new([c * 4, c * 2], 3, 1, device);

        let up = vec![
            UpStage::new(&[c * 2, c * 2, c], device),
            UpStage::new(&[c, c], device),
        ];
        let head = Conv2dConfig::new([c, 3], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .init(device);

        UnetGenerator {
            stem,
            down,
            bottleneck,
            reduce,
            up,
            head,
        }
    }
}
