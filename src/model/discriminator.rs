use burn::{
    module::Module,
    nn::{LeakyRelu, LeakyReluConfig, Linear, LinearConfig},
    prelude::*,
};

use crate::{
    error::Error,
    model::spectral_norm::{SnConv2d, SnConv2dConfig, SpectralNormConfig},
};

const NUM_STAGES: usize = 3;

/// One resolution level: a stride-2 convolution then a same-size one, both
/// spectrally normalized and followed by a leaky ReLU.
#[derive(Module, Debug)]
pub struct DiscStage<B: Backend> {
    down: SnConv2d<B>,
    conv: SnConv2d<B>,
    lrelu: LeakyRelu,
}
impl<B: Backend> DiscStage<B> {
    pub fn new(channels: [usize; 2], norm: &SpectralNormConfig, device: &B::Device) -> Self {
        let down = SnConv2dConfig::new(channels, 3)
            .with_stride(2)
            .with_spectral_norm(norm.clone())
            .init(device);
        let conv = SnConv2dConfig::new([channels[1], channels[1]], 3)
            .with_spectral_norm(norm.clone())
            .init(device);
        let lrelu = LeakyReluConfig::new().init();

        Self { down, conv, lrelu }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.lrelu.forward(self.down.forward(input));
        self.lrelu.forward(self.conv.forward(output))
    }
}

/// Raw realism logits.
#[derive(Clone, Debug)]
pub enum DiscriminatorOutput<B: Backend> {
    /// `[batch, 1, height / 8, width / 8]`, one score per receptive field.
    Patch(Tensor<B, 4>),
    /// `[batch, 1]`, one score per image.
    Score(Tensor<B, 2>),
}
impl<B: Backend> DiscriminatorOutput<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Patch(tensor) => tensor.dims().to_vec(),
            Self::Score(tensor) => tensor.dims().to_vec(),
        }
    }

    /// Flattens either mode into `[batch, scores]` for a loss.
    pub fn into_logits(self) -> Tensor<B, 2> {
        match self {
            Self::Patch(tensor) => tensor.flatten(1, 3),
            Self::Score(tensor) => tensor,
        }
    }
}

#[derive(Module, Debug)]
pub struct SpectNormDiscriminator<B: Backend> {
    stages: Vec<DiscStage<B>>,
    patch_head: Option<SnConv2d<B>>,
    score_head: Option<Linear<B>>,
}
impl<B: Backend> SpectNormDiscriminator<B> {
    /// Scores a `[batch, 3, height, width]` image batch.
    pub fn try_forward(&self, input: Tensor<B, 4>) -> crate::error::Result<DiscriminatorOutput<B>> {
        let [_, channels, _, _] = input.dims();
        if channels != 3 {
            return Err(Error::InvalidInput(format!(
                "discriminator expects 3 input channels, got {channels}"
            )));
        }

        let output = self
            .stages
            .iter()
            .fold(input, |output, stage| stage.forward(output));

        match (&self.patch_head, &self.score_head) {
            (Some(head), _) => Ok(DiscriminatorOutput::Patch(head.forward(output))),
            (None, Some(head)) => {
                let [batch, channels, _, _] = output.dims();
                let pooled = output.mean_dim(2).mean_dim(3).reshape([batch, channels]);
                Ok(DiscriminatorOutput::Score(head.forward(pooled)))
            }
            (None, None) => Err(Error::InvalidInput(
                "discriminator has no output head".to_string(),
            )),
        }
    }

    /// # Panics
    ///
    /// On the conditions [`SpectNormDiscriminator::try_forward`] reports as
    /// errors.
    pub fn forward(&self, input: Tensor<B, 4>) -> DiscriminatorOutput<B> {
        match self.try_forward(input) {
            Ok(output) => output,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn is_patch(&self) -> bool {
        self.patch_head.is_some()
    }

    /// Learned weights and biases. Unlike `num_params`, the spectral norm
    /// singular vector estimates are not counted.
    pub fn num_weights(&self) -> usize {
        let stages = self
            .stages
            .iter()
            .map(|stage| stage.down.num_weights() + stage.conv.num_weights())
            .sum::<usize>();
        let patch_head = self.patch_head.as_ref().map_or(0, SnConv2d::num_weights);
        let score_head = self.score_head.as_ref().map_or(0, |head| head.num_params());

        stages + patch_head + score_head
    }
}

#[derive(Config, Debug)]
pub struct SpectNormDiscriminatorConfig {
    #[config(default = 32)]
    pub channel: usize,
    #[config(default = true)]
    pub patch: bool,
    #[config(default = "SpectralNormConfig::new()")]
    pub spectral_norm: SpectralNormConfig,
}
impl SpectNormDiscriminatorConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.channel == 0 {
            return Err(Error::InvalidConfig {
                name: "SpectNormDiscriminator",
                reason: "channel must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SpectNormDiscriminator<B> {
        log::debug!(
            "building SpectNormDiscriminator (channel: {}, patch: {})",
            self.channel,
            self.patch
        );

        let mut in_channels = 3;
        let mut stages = Vec::with_capacity(NUM_STAGES);
        for idx in 0..NUM_STAGES {
            let width = self.channel * 2usize.pow(idx as u32);
            let stage = DiscStage::new([in_channels, width], &self.spectral_norm, device);
            stages.push(stage);
            in_channels = width;
        }

        let (patch_head, score_head) = match self.patch {
            true => {
                let head = SnConv2dConfig::new([in_channels, 1], 1)
                    .with_spectral_norm(self.spectral_norm.clone())
                    .init(device);
                (Some(head), None)
            }
            false => (None, Some(LinearConfig::new(in_channels, 1).init(device))),
        };

        SpectNormDiscriminator {
            stages,
            patch_head,
            score_head,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::spectral_norm::largest_singular_value, InferenceBackend as TestBackend};
    use burn::{backend::Autodiff, tensor::Distribution};

    type TrainBackend = Autodiff<TestBackend>;

    fn random<B: Backend>(shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
    }

    fn small<B: Backend>(device: &B::Device) -> SpectNormDiscriminator<B> {
        SpectNormDiscriminatorConfig::new()
            .with_channel(8)
            .init(device)
    }

    #[test]
    fn patch_map_is_an_eighth_of_the_input() {
        let device = Default::default();
        let discriminator = SpectNormDiscriminatorConfig::new()
            .init::<TestBackend>(&device);

        let output = discriminator.forward(random([1, 3, 256, 256], &device));
        assert!(matches!(output, DiscriminatorOutput::Patch(_)));
        assert_eq!(output.dims(), vec![1, 1, 32, 32]);
        assert_eq!(output.into_logits().dims(), [1, 32 * 32]);
    }

    #[test]
    fn scalar_mode_scores_each_image() {
        let device = Default::default();
        let discriminator = SpectNormDiscriminatorConfig::new()
            .with_patch(false)
            .init::<TestBackend>(&device);
        assert!(!discriminator.is_patch());

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 256, 256], &device);
        assert_eq!(discriminator.forward(input).dims(), vec![1, 1]);

        let input = Tensor::<TestBackend, 4>::zeros([3, 3, 40, 24], &device);
        assert_eq!(discriminator.forward(input).dims(), vec![3, 1]);
    }

    #[test]
    fn logits_are_not_squashed() {
        let device = Default::default();
        let discriminator = small::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            Distribution::Uniform(-50.0, 50.0),
            &device,
        );

        let values = discriminator
            .forward(input)
            .into_logits()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(values.iter().any(|v| !(0.0..=1.0).contains(v)));
    }

    #[test]
    fn repeated_passes_agree() {
        let device = Default::default();
        let discriminator = small::<TestBackend>(&device);
        let input = random::<TestBackend>([1, 3, 32, 32], &device);

        let first = discriminator.forward(input.clone()).into_logits();
        let second = discriminator.forward(input).into_logits();
        first.into_data().assert_eq(&second.into_data(), true);
    }

    #[test]
    fn wrong_channel_count_is_an_error() {
        let device = Default::default();

        for patch in [true, false] {
            let discriminator = SpectNormDiscriminatorConfig::new()
                .with_channel(4)
                .with_patch(patch)
                .init::<TestBackend>(&device);
            let input = Tensor::<TestBackend, 4>::zeros([1, 1, 16, 16], &device);
            assert!(matches!(
                discriminator.try_forward(input),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    #[test]
    #[should_panic(expected = "3 input channels")]
    fn forward_panics_on_wrong_channel_count() {
        let device = Default::default();
        small::<TestBackend>(&device).forward(Tensor::zeros([1, 4, 16, 16], &device));
    }

    #[test]
    fn default_weight_count() {
        let device = Default::default();
        let patch = SpectNormDiscriminatorConfig::new()
            .init::<TestBackend>(&device);
        assert_eq!(patch.num_weights(), 287_137);

        // 128 * 1 + 1 for the linear head, same as the 1x1 conv
        let score = SpectNormDiscriminatorConfig::new()
            .with_patch(false)
            .init::<TestBackend>(&device);
        assert_eq!(score.num_weights(), 287_137);
    }

    #[test]
    fn every_kernel_stays_normalized_while_training() {
        let device = Default::default();
        let discriminator = small::<TrainBackend>(&device);
        let input = random::<TrainBackend>([1, 3, 32, 32], &device);

        for _ in 0..5 {
            let logits = discriminator.forward(input.clone()).into_logits();
            let _ = logits.mean().backward();
        }

        let kernels = discriminator
            .stages
            .iter()
            .flat_map(|stage| [&stage.down, &stage.conv])
            .chain(discriminator.patch_head.as_ref());
        for conv in kernels {
            let sigma = largest_singular_value(conv.normalized_weight().inner());
            assert!(sigma <= 1.0 + 1e-2, "sigma = {sigma}");
        }
    }

    #[test]
    fn zero_channels_is_rejected() {
        let config = SpectNormDiscriminatorConfig::new().with_channel(0);
        assert!(config.validate().is_err());
    }
}
