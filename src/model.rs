pub mod discriminator;
pub mod generator;
mod layers;
pub mod spectral_norm;

use burn::{module::Module, prelude::*};

use crate::{
    model::{
        discriminator::{SpectNormDiscriminator, SpectNormDiscriminatorConfig},
        generator::{UnetGenerator, UnetGeneratorConfig},
    },
};

pub use layers::{ConvBlock, ResidualBlock};

/// The adversarial pair. The two networks never call each other; a training
/// loop alternates updates between them.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    pub generator: UnetGenerator<B>,
    pub discriminator: SpectNormDiscriminator<B>,
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "UnetGeneratorConfig::new()")]
    pub generator_config: UnetGeneratorConfig,
    #[config(default = "SpectNormDiscriminatorConfig::new()")]
    pub discriminator_config: SpectNormDiscriminatorConfig,
}
impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<Model<B>> {
        self.generator_config.validate()?;
        self.discriminator_config.validate()?;

        let generator = self.generator_config.init(device);
        let discriminator = self.discriminator_config.init(device);

        Ok(Model {
            generator,
            discriminator,
        })
    }
}
