use tch::nn;

use crate::{
    error::{Error, Result},
    graph::{conv_output, same_pads, ConvParams, GraphBuilder, NormParams, Padding, TensorHandle},
    networks::Scope,
};

/// Epsilon of the instance normalisation layers.
pub const INSTANCE_NORM_EPS: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub filters: i64,
    pub kernel_size: i64,
    pub stride: i64,
    pub padding: Padding,
    pub relu: bool,
}

impl BlockConfig {
    /// Stride 1, `same` padding, followed by a ReLU.
    pub fn new(filters: i64, kernel_size: i64) -> BlockConfig {
        BlockConfig {
            filters,
            kernel_size,
            stride: 1,
            padding: Padding::Same,
            relu: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.filters <= 0 {
            return Err(Error::Config(format!("filter count must be positive, got {}", self.filters)));
        }
        if self.kernel_size <= 0 {
            return Err(Error::Config(format!("kernel size must be positive, got {}", self.kernel_size)));
        }
        if self.stride <= 0 {
            return Err(Error::Config(format!("stride must be positive, got {}", self.stride)));
        }
        Ok(())
    }
}

/// Convolution, instance normalisation and an optional ReLU.
///
/// `same` padding is materialised as an explicit zero-pad node so that
/// strided convolutions on even inputs pad only the trailing edge.
pub fn conv_block(g: &mut GraphBuilder, p: &Scope, x: TensorHandle, cfg: BlockConfig) -> Result<TensorHandle> {
    cfg.validate()?;
    let s = x.shape();
    let (k, stride) = (cfg.kernel_size, cfg.stride);
    let fits = |n| conv_output(n, k, stride, cfg.padding).is_some();
    if !fits(s.height) || !fits(s.width) {
        return Err(Error::shape(
            p.node("conv"),
            format!("{k}x{k} {:?} convolution does not fit in {s}", cfg.padding),
        ));
    }

    let x = match cfg.padding {
        Padding::Same => {
            let rows = same_pads(s.height, k, stride);
            let cols = same_pads(s.width, k, stride);
            if rows == (0, 0) && cols == (0, 0) {
                x
            } else {
                g.zero_pad(&p.node("pad"), x, rows, cols)?
            }
        }
        Padding::Valid => x,
    };

    let conv_config = nn::ConvConfig {
        stride,
        ..Default::default()
    };
    let conv = nn::conv2d(p.path() / "conv", s.channels, cfg.filters, k, conv_config);
    let x = g.conv2d(
        &p.node("conv"),
        x,
        ConvParams {
            ws: conv.ws,
            bs: conv.bs,
            stride,
        },
    )?;

    let norm = p.path() / "norm";
    let x = g.instance_norm(
        &p.node("norm"),
        x,
        NormParams {
            gamma: norm.ones("gamma", &[cfg.filters]),
            beta: norm.zeros("beta", &[cfg.filters]),
            eps: INSTANCE_NORM_EPS,
        },
    )?;

    if cfg.relu {
        g.relu(&p.node("relu"), x)
    } else {
        Ok(x)
    }
}

/// Two valid convolutions plus the input, centre-cropped to match.
///
/// Each convolution shrinks both spatial axes by `kernel_size - 1`, so the
/// identity branch loses `kernel_size - 1` pixels on every side.
pub fn residual_block(
    g: &mut GraphBuilder,
    p: &Scope,
    x: TensorHandle,
    filters: i64,
    kernel_size: i64,
) -> Result<TensorHandle> {
    if kernel_size <= 0 {
        return Err(Error::Config(format!("kernel size must be positive, got {kernel_size}")));
    }
    if filters != x.shape().channels {
        return Err(Error::shape(
            p.node("add"),
            format!("{filters} filters cannot be added to an input of shape {}", x.shape()),
        ));
    }
    let crop = kernel_size - 1;
    let identity = g.crop(&p.node("identity"), x, (crop, crop), (crop, crop))?;

    let cfg = BlockConfig {
        padding: Padding::Valid,
        ..BlockConfig::new(filters, kernel_size)
    };
    let out = conv_block(g, &p.sub("conv1"), x, cfg)?;
    let out = conv_block(g, &p.sub("conv2"), out, BlockConfig { relu: false, ..cfg })?;
    g.add(&p.node("add"), out, identity)
}

/// Nearest-neighbour 2x upsampling, a 2 pixel zero border and a valid convolution.
pub fn upsample_block(
    g: &mut GraphBuilder,
    p: &Scope,
    x: TensorHandle,
    filters: i64,
    kernel_size: i64,
) -> Result<TensorHandle> {
    let out = g.upsample_nearest(&p.node("upsample"), x, 2)?;
    let out = g.zero_pad(&p.node("pad"), out, (2, 2), (2, 2))?;
    let cfg = BlockConfig {
        padding: Padding::Valid,
        ..BlockConfig::new(filters, kernel_size)
    };
    conv_block(g, &p.sub("conv"), out, cfg)
}
