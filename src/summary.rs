use anyhow::Result;
use serde::Serialize;
use spinoff::{spinners, Color, Spinner};
use tch::{nn::VarStore, Device};

use style_transfer::{
    graph::LayerSummary,
    networks::{
        transform::TransformNet,
        vgg::{FeatureExtractor, PretrainedVgg16},
        weights::FileWeightStore,
    },
};

use crate::args::Summary;

#[derive(Debug, Serialize)]
struct Report {
    trainable_parameters: usize,
    frozen_parameters: usize,
    layers: Vec<LayerSummary>,
}

fn parameter_count(vs: &VarStore) -> usize {
    vs.variables().values().map(|t| t.numel()).sum()
}

pub fn run(device: Device, args: Summary) -> Result<()> {
    let net = TransformNet::new(device, args.height, args.width)?;

    let extractor = match args.vgg_weights {
        Some(path) => {
            let spinner = Spinner::new(spinners::Aesthetic, "Loading VGG16 weights...", Color::Cyan);
            let store = FileWeightStore::open(path)?;
            let weights = PretrainedVgg16::load(&store, device)?;
            spinner.stop_with_message("VGG16 weights loaded.");
            Some(FeatureExtractor::stitched(weights, &net.graph)?)
        }
        None => None,
    };
    let graph = extractor.as_ref().map(|e| e.graph()).unwrap_or(&net.graph);

    let report = Report {
        trainable_parameters: parameter_count(&net.vs),
        frozen_parameters: extractor
            .as_ref()
            .map(|e| parameter_count(e.weights().var_store()))
            .unwrap_or(0),
        layers: graph.summary(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for layer in report.layers.iter() {
        println!(
            "{:<28} {:<18} {:>5} x {:>5} x {:>4}  {}",
            layer.name,
            layer.op,
            layer.shape.height,
            layer.shape.width,
            layer.shape.channels,
            layer.inputs.join(", ")
        );
    }
    println!("Trainable parameters: {}", report.trainable_parameters);
    if extractor.is_some() {
        println!("Frozen parameters: {}", report.frozen_parameters);
    }
    Ok(())
}
