use std::{fmt::Display, str::FromStr};

use serde::Serialize;

use crate::error::{Error, Result};

/// Spatial shape of a single example, channels last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Shape {
    pub height: i64,
    pub width: i64,
    pub channels: i64,
}

impl Shape {
    pub fn new(height: i64, width: i64, channels: i64) -> Result<Shape> {
        if height <= 0 || width <= 0 || channels <= 0 {
            return Err(Error::Config(format!(
                "shape dimensions must be positive, got {height}x{width}x{channels}"
            )));
        }
        Ok(Shape {
            height,
            width,
            channels,
        })
    }

    /// The NCHW size of a runtime tensor holding `batch` examples of this shape.
    pub fn nchw(&self, batch: i64) -> [i64; 4] {
        [batch, self.channels, self.height, self.width]
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.height, self.width, self.channels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Padding {
    /// Output size is `ceil(input / stride)`.
    Same,
    /// No padding; each axis shrinks by `kernel - 1` before striding.
    Valid,
}

impl FromStr for Padding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Padding> {
        match s.to_ascii_lowercase().as_str() {
            "same" => Ok(Padding::Same),
            "valid" => Ok(Padding::Valid),
            e => Err(Error::Config(format!("unsupported padding mode: {e}"))),
        }
    }
}

/// Pads on each side of one axis, begin first.
///
/// Odd totals put the extra pixel at the end, which matches what
/// Keras/TensorFlow (and ONNX `SAME_UPPER`) do for strided convolutions.
pub fn same_pads(input: i64, kernel: i64, stride: i64) -> (i64, i64) {
    let out = (input + stride - 1) / stride; // ceil
    let needed = ((out - 1) * stride + kernel - input).max(0);
    let begin = needed / 2;
    (begin, needed - begin)
}

/// Output length of one axis after a convolution or pooling window.
pub fn conv_output(input: i64, kernel: i64, stride: i64, padding: Padding) -> Option<i64> {
    match padding {
        Padding::Same => Some(input.checked_add(stride - 1)? / stride),
        Padding::Valid if input >= kernel => Some((input - kernel) / stride + 1),
        Padding::Valid => None,
    }
}
