use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tch::Device;

#[derive(Debug, Parser)]
pub struct Args {
    /// The device networks are built on.
    #[clap(short = 'D', long = "device", value_enum, default_value = "auto")]
    pub device: DeviceArg,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeviceArg {
    Auto,
    Cpu,
    Cuda,
    Mps,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Device {
        match arg {
            DeviceArg::Auto => Device::cuda_if_available(),
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Cuda => Device::Cuda(0),
            DeviceArg::Mps => Device::Mps,
        }
    }
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Print the layers and shapes of the transformation network.
    Summary(Summary),
    /// Stylize images with a trained transformation network.
    Stylize(Stylize),
    /// Print the VGG16 feature maps of an image.
    Features(Features),
}

#[derive(Debug, Parser)]
pub struct Summary {
    /// Height of the input image.
    #[clap(long = "height", default_value_t = 256)]
    pub height: i64,
    /// Width of the input image.
    #[clap(long = "width", default_value_t = 256)]
    pub width: i64,
    /// Pretrained VGG16 weights; when given, the extractor is stitched on.
    #[clap(long = "vgg-weights")]
    pub vgg_weights: Option<PathBuf>,
    /// Emit JSON instead of a table.
    #[clap(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct Stylize {
    /// The trained transformation network.
    #[clap(short = 'm', long = "model")]
    pub model: PathBuf,
    /// The images to stylize; each is resized to the network's input size.
    #[clap(short = 'i', long = "image", required = true)]
    pub image: Vec<PathBuf>,
    /// Where stylized PNGs are written.
    #[clap(short = 'o', long = "output-dir", default_value = "stylized")]
    pub output_dir: PathBuf,
    #[clap(long = "height", default_value_t = 256)]
    pub height: i64,
    #[clap(long = "width", default_value_t = 256)]
    pub width: i64,
}

#[derive(Debug, Parser)]
pub struct Features {
    /// Pretrained VGG16 weights (`.ot` or `.safetensors`).
    #[clap(short = 'w', long = "weights")]
    pub weights: PathBuf,
    /// The image to extract features from.
    #[clap(short = 'i', long = "image")]
    pub image: PathBuf,
    #[clap(long = "height", default_value_t = 224)]
    pub height: i64,
    #[clap(long = "width", default_value_t = 224)]
    pub width: i64,
}
