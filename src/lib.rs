//! Network topologies for fast neural style transfer.
//!
//! [`networks::transform::transform_net`] builds the image transformation
//! network and [`networks::vgg::FeatureExtractor`] exposes the activations of
//! a frozen, pretrained VGG16, optionally stitched onto the transformation
//! network's output so both form one differentiable graph.

pub mod error;
pub mod graph;
pub mod networks;

pub use error::{Error, Result};
