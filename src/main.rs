use burn::tensor::Tensor;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::{error::Error, fs, path::PathBuf};
use whitebox_gan::{
    model::{
        generator::UnetGeneratorConfig,
        ModelConfig,
    },
    registry::{Network, Registry},
    utils::{crop_to_multiple, image_to_tensor, load_image, tensor_to_image},
};

#[cfg(feature = "wgpu")]
type MyBackend = burn::backend::Wgpu<f32>;
#[cfg(not(feature = "wgpu"))]
type MyBackend = whitebox_gan::InferenceBackend;

#[derive(Parser)]
#[command(version, about = "Image-translation GAN networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the registered architectures
    List,
    /// Build networks and report parameter counts and output shapes
    Summary {
        /// Registered architecture name
        #[arg(long, conflicts_with = "config")]
        arch: Option<String>,
        /// JSON object of architecture arguments
        #[arg(long, requires = "arch")]
        args: Option<String>,
        /// JSON model configuration holding both networks
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        batch: usize,
        #[arg(long, default_value_t = 256)]
        height: usize,
        #[arg(long, default_value_t = 256)]
        width: usize,
    },
    /// Run the generator over an image file
    Translate {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// JSON generator configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Generator record saved with the named MessagePack recorder
        #[arg(long)]
        weights: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env).init();

    let cli = Cli::parse();
    let device = Default::default();

    match cli.command {
        Command::List => {
            for name in Registry::<MyBackend>::default().names() {
                println!("{name}");
            }
        }

        Command::Summary {
            arch,
            args,
            config,
            batch,
            height,
            width,
        } => {
            let shape = [batch, 3, height, width];
            let networks = match (arch, config) {
                (Some(arch), _) => {
                    let args = match args {
                        Some(args) => serde_json::from_str(&args)?,
                        None => Value::Null,
                    };
                    let registry = Registry::<MyBackend>::default();
                    vec![registry.build(&arch, &args, &device)?]
                }
                (None, config) => {
                    let config: ModelConfig = match config {
                        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
                        None => ModelConfig::new(),
                    };
                    let model = config.init::<MyBackend>(&device)?;
                    vec![
                        Network::UnetGenerator(model.generator),
                        Network::SpectNormDiscriminator(model.discriminator),
                    ]
                }
            };

            for network in networks {
                let output = network.forward(Tensor::zeros(shape, &device))?;
                println!(
                    "{:<24} params: {:>10}  {:?} -> {:?}",
                    network.name(),
                    network.num_params(),
                    shape,
                    output.dims()
                );
            }
        }

        Command::Translate {
            input,
            output,
            config,
            weights,
        } => {
            let config: UnetGeneratorConfig = match config {
                Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
                None => UnetGeneratorConfig::new(),
            };
            config.validate()?;
            let mut generator = config.init::<MyBackend>(&device);

            match weights {
                Some(path) => {
                    log::info!("loading generator weights from {}", path.display());
                    generator = generator.load_weights(path, &device)?;
                }
                None => log::warn!("no weights given, translating with random parameters"),
            }

            let image = crop_to_multiple(load_image(&input)?, 4)?;
            let image: Tensor<MyBackend, 4> = image_to_tensor(image, &device).unsqueeze();
            let translated: Tensor<MyBackend, 3> = generator.try_forward(image)?.squeeze(0);

            tensor_to_image(translated)?.save(&output)?;
            log::info!("wrote {}", output.display());
        }
    }

    Ok(())
}
