use anyhow::Result;
use spinoff::{spinners, Color, Spinner};
use tch::{Device, Kind};
use tracing::info;

use style_transfer::networks::{
    vgg::{FeatureExtractor, Mode},
    weights::FileWeightStore,
};

use crate::{args::Features, image_io};

pub fn run(device: Device, args: Features) -> Result<()> {
    let spinner = Spinner::new(spinners::Aesthetic, "Loading VGG16 weights...", Color::Cyan);
    let store = FileWeightStore::open(&args.weights)?;
    let mode = Mode::Standalone {
        height: args.height,
        width: args.width,
    };
    let vgg = FeatureExtractor::new(&store, device, mode)?;
    spinner.stop_with_message("VGG16 weights loaded.");
    info!(weights = %store.path().display(), tensors = store.len(), "extracting features");

    let pixels = image_io::load_rgb(&args.image, args.height, args.width)?;
    let xs = image_io::to_tensor(pixels, vgg.weights().device())?;
    let features = tch::no_grad(|| vgg.features(&xs))?;
    for (name, value) in features.iter() {
        println!(
            "{:<14} {:?} mean {:.4}",
            name,
            value.size(),
            value.mean(Kind::Float).double_value(&[])
        );
    }
    Ok(())
}
