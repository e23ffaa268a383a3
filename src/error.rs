use thiserror::Error;

use crate::graph::Shape;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shape mismatch at {layer}: {reason}")]
    ShapeMismatch { layer: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing pretrained weights for {name}")]
    MissingWeights { name: String },

    #[error("pretrained weights for {name} have size {found:?}, expected {expected:?}")]
    WeightSize {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shapes_differ(layer: impl Into<String>, expected: Shape, found: Shape) -> Self {
        Error::shape(layer, format!("expected {expected}, found {found}"))
    }
}
