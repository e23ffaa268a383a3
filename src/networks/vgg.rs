//! VGG16 convolutional trunk used as a fixed feature extractor.
//!
//! The extractor either owns its own input or is stitched onto the output of
//! another graph, in which case evaluating it runs (and differentiates
//! through) that graph as well.

use std::sync::Arc;

use tch::{nn, Device, Tensor};
use tracing::info;

use crate::{
    error::{Error, Result},
    graph::{same_pads, ComputationGraph, ConvParams, GraphBuilder, NamedOutputMap, Shape, TensorHandle},
    networks::{transform::IMAGE_CHANNELS, weights::copy_weight, weights::WeightStore},
};

/// Key of the extractor's input in its [`NamedOutputMap`].
pub const INPUT_LAYER: &str = "input";

/// `(output channels, convolutions)` of the five VGG16 blocks.
const BLOCKS: [(i64, usize); 5] = [(64, 2), (128, 2), (256, 3), (512, 3), (512, 3)];
const KERNEL: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// 3x3 same-padded convolution followed by a ReLU.
    Conv { name: String, c_in: i64, c_out: i64 },
    /// 2x2 max pooling with stride 2.
    Pool { name: String },
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Conv { name, .. } | Layer::Pool { name } => name,
        }
    }
}

/// The VGG16 layers without the classifier head, in order.
pub fn vgg16_layers() -> Vec<Layer> {
    let mut layers = vec![];
    let mut c_in = IMAGE_CHANNELS;
    for (b, (c_out, convs)) in BLOCKS.into_iter().enumerate() {
        for c in 0..convs {
            layers.push(Layer::Conv {
                name: format!("block{}_conv{}", b + 1, c + 1),
                c_in,
                c_out,
            });
            c_in = c_out;
        }
        layers.push(Layer::Pool {
            name: format!("block{}_pool", b + 1),
        });
    }
    layers
}

/// Pretrained VGG16 parameters, frozen from the moment they are created.
///
/// Every variable is registered as non-trainable, so `vs.trainable_variables()`
/// is empty and no optimizer built on this store can update it.
#[derive(Debug)]
pub struct PretrainedVgg16 {
    vs: nn::VarStore,
    convs: Vec<(Tensor, Tensor)>,
}

impl PretrainedVgg16 {
    /// Read `<layer>.weight` (OIHW) and `<layer>.bias` for every convolution.
    pub fn load(store: &impl WeightStore, device: Device) -> Result<Arc<PretrainedVgg16>> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let mut convs = vec![];
        for layer in vgg16_layers() {
            if let Layer::Conv { name, c_in, c_out } = layer {
                let p = &root / name.as_str();
                let mut ws = p.zeros_no_train("weight", &[c_out, c_in, KERNEL, KERNEL]);
                let mut bs = p.zeros_no_train("bias", &[c_out]);
                copy_weight(store, &format!("{name}.weight"), &mut ws)?;
                copy_weight(store, &format!("{name}.bias"), &mut bs)?;
                convs.push((ws, bs));
            }
        }
        info!(convolutions = convs.len(), ?device, "loaded pretrained vgg16");
        Ok(Arc::new(PretrainedVgg16 { vs, convs }))
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }
}

/// How the extractor obtains its input.
#[derive(Clone, Copy)]
pub enum Mode<'a> {
    Standalone { height: i64, width: i64 },
    Stitched(&'a ComputationGraph),
}

#[derive(Debug)]
pub struct FeatureExtractor {
    weights: Arc<PretrainedVgg16>,
    graph: ComputationGraph,
    layers: NamedOutputMap,
}

impl FeatureExtractor {
    /// Load the pretrained weights and build the extractor in one go.
    pub fn new(store: &impl WeightStore, device: Device, mode: Mode) -> Result<FeatureExtractor> {
        let weights = PretrainedVgg16::load(store, device)?;
        match mode {
            Mode::Standalone { height, width } => FeatureExtractor::standalone(weights, height, width),
            Mode::Stitched(upstream) => FeatureExtractor::stitched(weights, upstream),
        }
    }

    /// An extractor with its own `height`x`width` RGB input.
    pub fn standalone(weights: Arc<PretrainedVgg16>, height: i64, width: i64) -> Result<FeatureExtractor> {
        let mut g = GraphBuilder::new();
        let x = g.input("input", Shape::new(height, width, IMAGE_CHANNELS)?)?;
        FeatureExtractor::build(weights, g, x)
    }

    /// An extractor applied to the output of `upstream`.
    ///
    /// The result is a new graph whose input is `upstream`'s input; `upstream`
    /// and its parameters are shared, not copied.
    pub fn stitched(weights: Arc<PretrainedVgg16>, upstream: &ComputationGraph) -> Result<FeatureExtractor> {
        let g = GraphBuilder::extend(upstream);
        FeatureExtractor::build(weights, g, upstream.output())
    }

    fn build(weights: Arc<PretrainedVgg16>, mut g: GraphBuilder, root: TensorHandle) -> Result<FeatureExtractor> {
        let mut layers = NamedOutputMap::new();
        layers.insert(INPUT_LAYER, root)?;

        let mut convs = weights.convs.iter();
        let mut out = root;
        for layer in vgg16_layers() {
            out = match layer {
                Layer::Conv { name, .. } => {
                    let (ws, bs) = convs
                        .next()
                        .ok_or_else(|| Error::MissingWeights { name: name.clone() })?;
                    let s = out.shape();
                    let padded = g.zero_pad(
                        &format!("{name}.pad"),
                        out,
                        same_pads(s.height, KERNEL, 1),
                        same_pads(s.width, KERNEL, 1),
                    )?;
                    let conv = ConvParams {
                        ws: ws.shallow_clone(),
                        bs: Some(bs.shallow_clone()),
                        stride: 1,
                    };
                    let conv = g.conv2d(&format!("{name}.conv"), padded, conv)?;
                    let out = g.relu(&name, conv)?;
                    layers.insert(&name, out)?;
                    out
                }
                Layer::Pool { name } => {
                    let out = g.max_pool(&name, out, 2)?;
                    layers.insert(&name, out)?;
                    out
                }
            };
        }

        let graph = g.finish(out)?;
        info!(layers = layers.len(), nodes = graph.len(), "built vgg16 feature extractor");
        Ok(FeatureExtractor {
            weights,
            graph,
            layers,
        })
    }

    pub fn graph(&self) -> &ComputationGraph {
        &self.graph
    }

    pub fn layers(&self) -> &NamedOutputMap {
        &self.layers
    }

    pub fn weights(&self) -> &Arc<PretrainedVgg16> {
        &self.weights
    }

    /// Evaluate the graph once and read off every named layer.
    ///
    /// `xs` is fed to the graph's input: the image itself when standalone,
    /// the upstream network's input when stitched.
    pub fn features(&self, xs: &Tensor) -> Result<Vec<(String, Tensor)>> {
        let values = self.graph.forward_all(xs)?;
        Ok(self
            .layers
            .iter()
            .map(|(name, h)| (name.to_owned(), values[h.id()].shallow_clone()))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use tch::Kind;

    use super::*;

    /// Random weights under the names a real VGG16 store uses.
    pub(crate) fn random_store() -> HashMap<String, Tensor> {
        let opts = (Kind::Float, Device::Cpu);
        let mut store = HashMap::new();
        for layer in vgg16_layers() {
            if let Layer::Conv { name, c_in, c_out } = layer {
                let ws = Tensor::randn([c_out, c_in, KERNEL, KERNEL], opts) * 0.05;
                store.insert(format!("{name}.weight"), ws);
                store.insert(format!("{name}.bias"), Tensor::zeros([c_out], opts));
            }
        }
        store
    }

    #[test]
    fn layer_list_matches_vgg16() {
        let layers = vgg16_layers();
        assert_eq!(layers.len(), 18);
        assert_eq!(layers[0].name(), "block1_conv1");
        assert_eq!(layers[2].name(), "block1_pool");
        assert_eq!(layers[9].name(), "block3_pool");
        assert_eq!(layers[17].name(), "block5_pool");
        let convs = layers.iter().filter(|l| matches!(l, Layer::Conv { .. })).count();
        assert_eq!(convs, 13);
    }

    #[test]
    fn weights_are_frozen_at_load() {
        let weights = PretrainedVgg16::load(&random_store(), Device::Cpu).unwrap();
        assert_eq!(weights.device(), Device::Cpu);
        assert!(weights.var_store().trainable_variables().is_empty());
        let vars = weights.var_store().variables();
        assert_eq!(vars.len(), 26);
        assert!(vars.values().all(|v| !v.requires_grad()));
    }

    #[test]
    fn missing_weights_fail_the_load() {
        let mut store = random_store();
        store.remove("block4_conv2.bias");
        let err = PretrainedVgg16::load(&store, Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::MissingWeights { ref name } if name == "block4_conv2.bias"), "{err}");
    }

    #[test]
    fn standalone_map_follows_the_architecture() {
        let weights = PretrainedVgg16::load(&random_store(), Device::Cpu).unwrap();
        let vgg = FeatureExtractor::standalone(weights, 64, 48).unwrap();
        let keys: Vec<_> = vgg.layers().keys().collect();
        let expected: Vec<_> = std::iter::once(INPUT_LAYER.to_owned())
            .chain(vgg16_layers().iter().map(|l| l.name().to_owned()))
            .collect();
        assert_eq!(keys, expected);

        let shape = |name: &str| vgg.layers().get(name).unwrap().shape();
        assert_eq!(shape("input"), Shape::new(64, 48, 3).unwrap());
        assert_eq!(shape("block1_conv2"), Shape::new(64, 48, 64).unwrap());
        assert_eq!(shape("block2_pool"), Shape::new(16, 12, 128).unwrap());
        assert_eq!(shape("block4_conv3"), Shape::new(8, 6, 512).unwrap());
        assert_eq!(shape("block5_pool"), Shape::new(2, 1, 512).unwrap());
        assert_eq!(vgg.graph().output(), vgg.layers().get("block5_pool").unwrap());
        assert_eq!(vgg.layers().get("block3_conv1"), vgg.layers().get("block3_conv1"));
    }

    #[test]
    fn images_too_small_for_five_pools_fail() {
        let weights = PretrainedVgg16::load(&random_store(), Device::Cpu).unwrap();
        let err = FeatureExtractor::standalone(weights, 16, 64).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn instances_share_loaded_weights() {
        let weights = PretrainedVgg16::load(&random_store(), Device::Cpu).unwrap();
        let a = FeatureExtractor::standalone(weights.clone(), 32, 32).unwrap();
        let b = FeatureExtractor::standalone(weights, 64, 64).unwrap();
        assert!(Arc::ptr_eq(a.weights(), b.weights()));
    }

    #[test]
    fn features_have_the_declared_shapes() {
        let vgg = FeatureExtractor::new(&random_store(), Device::Cpu, Mode::Standalone { height: 32, width: 32 })
            .unwrap();
        let xs = Tensor::rand([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let features = vgg.features(&xs).unwrap();
        assert_eq!(features.len(), 19);
        for ((name, value), (key, handle)) in features.iter().zip(vgg.layers().iter()) {
            assert_eq!(name, key);
            assert_eq!(value.size(), handle.shape().nchw(1));
        }
        assert!(!features[1].1.requires_grad());
    }
}
