//! Name-keyed architecture table used by configuration-driven instantiation.
//!
//! Every entry is a plain constructor function registered up front; looking a
//! name up never involves reflection.

use std::collections::BTreeMap;

use burn::{module::Module, prelude::*};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    model::{
        discriminator::{
            DiscriminatorOutput, SpectNormDiscriminator, SpectNormDiscriminatorConfig,
        },
        generator::{UnetGenerator, UnetGeneratorConfig},
    },
};

pub const UNET_GENERATOR: &str = "UnetGenerator";
pub const SPECT_NORM_DISCRIMINATOR: &str = "SpectNormDiscriminator";

/// Builds a network from its JSON arguments.
pub type Constructor<B> = fn(&Value, &<B as Backend>::Device) -> Result<Network<B>>;

#[derive(Debug)]
pub enum Network<B: Backend> {
    UnetGenerator(UnetGenerator<B>),
    SpectNormDiscriminator(SpectNormDiscriminator<B>),
}

#[derive(Debug)]
pub enum NetworkOutput<B: Backend> {
    Image(Tensor<B, 4>),
    Critic(DiscriminatorOutput<B>),
}
impl<B: Backend> NetworkOutput<B> {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Image(tensor) => tensor.dims().to_vec(),
            Self::Critic(output) => output.dims(),
        }
    }
}

impl<B: Backend> Network<B> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnetGenerator(_) => UNET_GENERATOR,
            Self::SpectNormDiscriminator(_) => SPECT_NORM_DISCRIMINATOR,
        }
    }

    pub fn num_params(&self) -> usize {
        match self {
            Self::UnetGenerator(network) => network.num_params(),
            Self::SpectNormDiscriminator(network) => network.num_weights(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Result<NetworkOutput<B>> {
        match self {
            Self::UnetGenerator(network) => network.try_forward(input).map(NetworkOutput::Image),
            Self::SpectNormDiscriminator(network) => {
                network.try_forward(input).map(NetworkOutput::Critic)
            }
        }
    }
}

/// A network named in a configuration file together with its arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}
impl NetworkSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Null,
        }
    }
}

pub struct Registry<B: Backend> {
    constructors: BTreeMap<String, Constructor<B>>,
}

impl<B: Backend> Registry<B> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// A registry holding every architecture this crate ships.
    pub fn with_builtin() -> Self {
        let mut constructors = BTreeMap::new();
        constructors.insert(
            UNET_GENERATOR.to_string(),
            build_generator::<B> as Constructor<B>,
        );
        constructors.insert(
            SPECT_NORM_DISCRIMINATOR.to_string(),
            build_discriminator::<B> as Constructor<B>,
        );

        Self { constructors }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: Constructor<B>,
    ) -> Result<()> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(Error::DuplicateArchitecture(name));
        }
        self.constructors.insert(name, constructor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Looks `name` up and constructs it from `args`, a JSON object of
    /// config fields. Fields left out (or `null` args) keep their defaults.
    pub fn build(&self, name: &str, args: &Value, device: &B::Device) -> Result<Network<B>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::UnknownArchitecture(name.to_string()))?;
        log::debug!("building {name} from {args}");

        constructor(args, device)
    }

    pub fn build_spec(&self, spec: &NetworkSpec, device: &B::Device) -> Result<Network<B>> {
        self.build(&spec.name, &spec.args, device)
    }
}

impl<B: Backend> Default for Registry<B> {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn build_generator<B: Backend>(args: &Value, device: &B::Device) -> Result<Network<B>> {
    let config: UnetGeneratorConfig = with_defaults(UnetGeneratorConfig::new(), args)?;
    config.validate()?;

    Ok(Network::UnetGenerator(config.init(device)))
}

fn build_discriminator<B: Backend>(args: &Value, device: &B::Device) -> Result<Network<B>> {
    let config: SpectNormDiscriminatorConfig =
        with_defaults(SpectNormDiscriminatorConfig::new(), args)?;
    config.validate()?;

    Ok(Network::SpectNormDiscriminator(config.init(device)))
}

// Overlays the given fields onto the serialized defaults, one level deep.
fn with_defaults<C: Serialize + DeserializeOwned>(defaults: C, args: &Value) -> Result<C> {
    let mut merged = serde_json::to_value(defaults)?;
    match (args, &mut merged) {
        (Value::Null, _) => {}
        (Value::Object(fields), Value::Object(target)) => {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => {
            return Err(Error::InvalidInput(format!(
                "architecture arguments must be a JSON object, got {args}"
            )))
        }
    }

    Ok(serde_json::from_value(merged)?)
}
