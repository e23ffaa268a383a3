use anyhow::Result;
use args::Args;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod args;
mod features;
mod image_io;
mod stylize;
mod summary;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args: Args = Args::parse();
    let device = args.device.into();
    match args.command {
        args::Command::Summary(sub) => summary::run(device, sub),
        args::Command::Stylize(sub) => stylize::run(device, sub),
        args::Command::Features(sub) => features::run(device, sub),
    }
}
