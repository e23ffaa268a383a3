use std::time::Instant;

use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use spinoff::{spinners, Color, Spinner};
use tch::Device;
use tracing::info;

use style_transfer::networks::transform::TransformNet;

use crate::{args::Stylize, image_io};

pub fn run(device: Device, args: Stylize) -> Result<()> {
    let spinner = Spinner::new(spinners::Aesthetic, "Loading transformation network...", Color::Cyan);
    let mut net = TransformNet::new(device, args.height, args.width)?;
    net.vs.load(&args.model)?;
    spinner.stop_with_message("Transformation network loaded.");

    std::fs::create_dir_all(&args.output_dir)?;
    let progress = ProgressBar::new(args.image.len() as u64);
    progress.set_style(ProgressStyle::with_template(
        "[{eta_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
    )?);

    for img_path in args.image.iter() {
        let timer = Instant::now();
        let mut array = image_io::load_rgb(img_path, args.height, args.width)?;
        array.par_mapv_inplace(|v| v / 127.5 - 1.);
        let xs = image_io::to_tensor(array, device)?;

        let out = tch::no_grad(|| net.graph.forward(&xs))?;

        let stem = img_path
            .file_stem()
            .ok_or_else(|| anyhow!("{} has no file name", img_path.display()))?;
        let out_path = args.output_dir.join(format!("{}.png", stem.to_string_lossy()));
        image_io::save_rgb(&out, &out_path)?;

        info!(
            input = %img_path.display(),
            output = %out_path.display(),
            seconds = timer.elapsed().as_secs_f32(),
            "stylized image"
        );
        progress.set_message(format!("{}", out_path.display()));
        progress.inc(1);
    }
    progress.finish();
    Ok(())
}
