//! The feed-forward image transformation network of Johnson et al., with zero
//! padding and instance normalisation.
//!
//! Convolutions inside the residual and upsampling blocks are unpadded. The
//! input is padded by [`INPUT_PADDING`] up front so that, after all the
//! interior shrinkage, the output lands back on the input's height and width.

use tch::{nn, Device};
use tracing::info;

use crate::{
    error::{Error, Result},
    graph::{conv_output, ComputationGraph, GraphBuilder, Padding, Shape},
    networks::{
        blocks::{conv_block, residual_block, upsample_block, BlockConfig},
        Scope,
    },
};

pub const IMAGE_CHANNELS: i64 = 3;
pub const INPUT_PADDING: i64 = 40;

/// `(filters, kernel_size, stride)` of the encoder convolutions.
const DOWNSAMPLE: [(i64, i64, i64); 3] = [(32, 9, 1), (64, 3, 2), (128, 3, 2)];
const RESIDUAL_BLOCKS: usize = 5;
const RESIDUAL_FILTERS: i64 = 128;
const RESIDUAL_KERNEL: i64 = 3;
/// `(filters, kernel_size)` of the decoder blocks.
const UPSAMPLE: [(i64, i64); 2] = [(64, 3), (32, 3)];
const OUTPUT_PADDING: i64 = 1;
const OUTPUT_KERNEL: i64 = 9;

/// Length of one spatial axis after the whole network, or `None` if some
/// layer does not fit.
pub fn planned_size(input: i64) -> Option<i64> {
    let mut n = input.checked_add(2 * INPUT_PADDING)?;
    for (_, kernel, stride) in DOWNSAMPLE {
        n = conv_output(n, kernel, stride, Padding::Same)?;
    }
    for _ in 0..RESIDUAL_BLOCKS {
        let shrink = 2 * (RESIDUAL_KERNEL - 1);
        if n <= shrink {
            return None;
        }
        n -= shrink;
    }
    for (_, kernel) in UPSAMPLE {
        n = conv_output(n.checked_mul(2)?.checked_add(4)?, kernel, 1, Padding::Valid)?;
    }
    conv_output(n.checked_add(2 * OUTPUT_PADDING)?, OUTPUT_KERNEL, 1, Padding::Valid)
}

/// Build the transformation network for `height`x`width` RGB images.
///
/// Every trainable parameter is registered under `vs`. The declared output
/// has the input's shape and holds pixel values in `[0, 255]`; the node
/// `output.tanh` holds the same image in `[-1, 1]`.
pub fn transform_net(vs: &nn::Path, height: i64, width: i64) -> Result<ComputationGraph> {
    let shape = Shape::new(height, width, IMAGE_CHANNELS)?;
    for (axis, n) in [("height", height), ("width", width)] {
        match planned_size(n) {
            Some(out) if out == n => {}
            Some(out) => {
                return Err(Error::shape(
                    "transform_net",
                    format!("{axis} {n} comes back as {out} after downsampling and upsampling"),
                ))
            }
            None => {
                return Err(Error::shape("transform_net", format!("{axis} {n} does not fit the network")));
            }
        }
    }

    let root = Scope::root(vs);
    let mut g = GraphBuilder::new();
    let x = g.input("input", shape)?;
    let mut out = g.zero_pad(
        "input_pad",
        x,
        (INPUT_PADDING, INPUT_PADDING),
        (INPUT_PADDING, INPUT_PADDING),
    )?;

    for (i, (filters, kernel, stride)) in DOWNSAMPLE.into_iter().enumerate() {
        let cfg = BlockConfig {
            stride,
            ..BlockConfig::new(filters, kernel)
        };
        out = conv_block(&mut g, &root.sub(&format!("down{}", i + 1)), out, cfg)?;
    }
    for i in 0..RESIDUAL_BLOCKS {
        let p = root.sub(&format!("res{}", i + 1));
        out = residual_block(&mut g, &p, out, RESIDUAL_FILTERS, RESIDUAL_KERNEL)?;
    }
    for (i, (filters, kernel)) in UPSAMPLE.into_iter().enumerate() {
        out = upsample_block(&mut g, &root.sub(&format!("up{}", i + 1)), out, filters, kernel)?;
    }

    let out = g.zero_pad(
        "output_pad",
        out,
        (OUTPUT_PADDING, OUTPUT_PADDING),
        (OUTPUT_PADDING, OUTPUT_PADDING),
    )?;
    let cfg = BlockConfig {
        padding: Padding::Valid,
        relu: false,
        ..BlockConfig::new(IMAGE_CHANNELS, OUTPUT_KERNEL)
    };
    let out = conv_block(&mut g, &root.sub("output"), out, cfg)?;
    let out = g.tanh("output.tanh", out)?;
    let out = g.deprocess("output.deprocess", out)?;
    if out.shape() != shape {
        return Err(Error::shapes_differ("output", shape, out.shape()));
    }

    let graph = g.finish(out)?;
    info!(height, width, nodes = graph.len(), "built transformation network");
    Ok(graph)
}

/// A transformation network together with the store owning its parameters.
pub struct TransformNet {
    pub vs: nn::VarStore,
    pub graph: ComputationGraph,
}

impl TransformNet {
    pub fn new(device: Device, height: i64, width: i64) -> Result<TransformNet> {
        let vs = nn::VarStore::new(device);
        let graph = transform_net(&vs.root(), height, width)?;
        Ok(TransformNet { vs, graph })
    }
}
