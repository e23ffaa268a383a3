//! Eagerly shape-checked computation graphs.
//!
//! A [`GraphBuilder`] appends nodes one at a time, inferring each node's
//! [`Shape`] as it goes, so an incompatible topology fails while it is being
//! assembled rather than when it is first evaluated. [`GraphBuilder::finish`]
//! turns it into an immutable [`ComputationGraph`] that evaluates on `tch`.

mod outputs;
mod shape;

pub use outputs::NamedOutputMap;
pub use shape::{conv_output, same_pads, Padding, Shape};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use indexmap::IndexMap;
use serde::Serialize;
use tch::Tensor;
use tracing::debug;

use crate::error::{Error, Result};

static NEXT_LINEAGE: AtomicU64 = AtomicU64::new(0);

pub type NodeId = usize;

/// A reference to a node's output inside one graph, carrying its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle {
    lineage: u64,
    id: NodeId,
    shape: Shape,
}

impl TensorHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }
}

#[derive(Debug)]
pub struct ConvParams {
    /// `[out_channels, in_channels, kernel_h, kernel_w]`
    pub ws: Tensor,
    pub bs: Option<Tensor>,
    pub stride: i64,
}

#[derive(Debug)]
pub struct NormParams {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub eps: f64,
}

#[derive(Debug)]
pub enum Op {
    Input,
    ZeroPad {
        top: i64,
        bottom: i64,
        left: i64,
        right: i64,
    },
    Crop {
        top: i64,
        bottom: i64,
        left: i64,
        right: i64,
    },
    Conv2d(ConvParams),
    InstanceNorm(NormParams),
    Relu,
    Tanh,
    UpsampleNearest {
        factor: i64,
    },
    MaxPool {
        size: i64,
    },
    Add,
    /// Maps `[-1, 1]` onto the `[0, 255]` pixel range.
    Deprocess,
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Input => "input",
            Op::ZeroPad { .. } => "zero_pad",
            Op::Crop { .. } => "crop",
            Op::Conv2d(_) => "conv2d",
            Op::InstanceNorm(_) => "instance_norm",
            Op::Relu => "relu",
            Op::Tanh => "tanh",
            Op::UpsampleNearest { .. } => "upsample_nearest",
            Op::MaxPool { .. } => "max_pool",
            Op::Add => "add",
            Op::Deprocess => "deprocess",
        }
    }
}

#[derive(Debug)]
pub struct Node {
    name: String,
    op: Op,
    inputs: Vec<NodeId>,
    shape: Shape,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    fn eval(&self, values: &[Tensor]) -> Tensor {
        let x = |i: usize| &values[self.inputs[i]];
        match &self.op {
            Op::Input => unreachable!("input nodes are bound, not evaluated"),
            Op::ZeroPad {
                top,
                bottom,
                left,
                right,
            } => x(0).zero_pad2d(*left, *right, *top, *bottom),
            Op::Crop { top, left, .. } => x(0)
                .narrow(2, *top, self.shape.height)
                .narrow(3, *left, self.shape.width),
            Op::Conv2d(conv) => x(0).conv2d(
                &conv.ws,
                conv.bs.as_ref(),
                [conv.stride, conv.stride],
                [0, 0],
                [1, 1],
                1,
            ),
            Op::InstanceNorm(norm) => x(0).instance_norm(
                Some(&norm.gamma),
                Some(&norm.beta),
                None,
                None,
                true,
                0.1,
                norm.eps,
                false,
            ),
            Op::Relu => x(0).relu(),
            Op::Tanh => x(0).tanh(),
            Op::UpsampleNearest { .. } => x(0).upsample_nearest2d(
                [self.shape.height, self.shape.width],
                None::<f64>,
                None::<f64>,
            ),
            Op::MaxPool { size } => x(0).max_pool2d_default(*size),
            Op::Add => x(0) + x(1),
            Op::Deprocess => (x(0) + 1.0) * 127.5,
        }
    }
}

/// A serialisable line of a graph summary.
#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub op: &'static str,
    pub inputs: Vec<String>,
    pub shape: Shape,
}

/// Lineages of the graphs a builder was extended from, with their lengths at
/// the time of extension. Handles from those graphs stay valid.
#[derive(Debug, Clone, Default)]
struct Ancestry(Vec<(u64, usize)>);

impl Ancestry {
    fn owns(&self, handle: &TensorHandle) -> bool {
        self.0
            .iter()
            .any(|(lineage, len)| *lineage == handle.lineage && handle.id < *len)
    }
}

#[derive(Debug)]
pub struct GraphBuilder {
    lineage: u64,
    ancestry: Ancestry,
    /// Nodes keyed by their unique name; a node's id is its index.
    nodes: IndexMap<String, Arc<Node>>,
    input: Option<NodeId>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder {
            lineage: NEXT_LINEAGE.fetch_add(1, Ordering::Relaxed),
            ancestry: Ancestry::default(),
            nodes: IndexMap::new(),
            input: None,
        }
    }

    /// Continue from a finished graph. Nodes and their parameters are shared
    /// with `graph`, which itself is left untouched.
    pub fn extend(graph: &ComputationGraph) -> GraphBuilder {
        let mut ancestry = graph.ancestry.clone();
        ancestry.0.push((graph.lineage, graph.nodes.len()));
        GraphBuilder {
            lineage: NEXT_LINEAGE.fetch_add(1, Ordering::Relaxed),
            ancestry,
            nodes: graph.nodes.clone(),
            input: Some(graph.input),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn check(&self, handle: &TensorHandle) -> Result<()> {
        let own = handle.lineage == self.lineage && handle.id < self.nodes.len();
        if own || self.ancestry.owns(handle) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "tensor handle {} does not belong to this graph",
                handle.id
            )))
        }
    }

    fn push(&mut self, name: &str, op: Op, inputs: &[TensorHandle], shape: Shape) -> Result<TensorHandle> {
        for input in inputs {
            self.check(input)?;
        }
        if self.nodes.get_index_of(name).is_some() {
            return Err(Error::Config(format!("duplicate layer name: {name}")));
        }
        debug!(layer = name, op = op.kind(), %shape, "node added");
        let node = Arc::new(Node {
            name: name.to_owned(),
            op,
            inputs: inputs.iter().map(|h| h.id).collect(),
            shape,
        });
        let (id, _) = self.nodes.insert_full(name.to_owned(), node);
        Ok(TensorHandle {
            lineage: self.lineage,
            id,
            shape,
        })
    }

    /// Declare the graph's single input.
    pub fn input(&mut self, name: &str, shape: Shape) -> Result<TensorHandle> {
        if self.input.is_some() {
            return Err(Error::Config("graph already declares an input".into()));
        }
        let handle = self.push(name, Op::Input, &[], shape)?;
        self.input = Some(handle.id);
        Ok(handle)
    }

    pub fn zero_pad(
        &mut self,
        name: &str,
        x: TensorHandle,
        (top, bottom): (i64, i64),
        (left, right): (i64, i64),
    ) -> Result<TensorHandle> {
        if top < 0 || bottom < 0 || left < 0 || right < 0 {
            return Err(Error::Config(format!("{name}: padding must not be negative")));
        }
        let s = x.shape;
        let shape = Shape {
            height: s.height + top + bottom,
            width: s.width + left + right,
            ..s
        };
        self.push(name, Op::ZeroPad { top, bottom, left, right }, &[x], shape)
    }

    pub fn crop(
        &mut self,
        name: &str,
        x: TensorHandle,
        (top, bottom): (i64, i64),
        (left, right): (i64, i64),
    ) -> Result<TensorHandle> {
        if top < 0 || bottom < 0 || left < 0 || right < 0 {
            return Err(Error::Config(format!("{name}: cropping must not be negative")));
        }
        let s = x.shape;
        let (height, width) = (s.height - top - bottom, s.width - left - right);
        if height <= 0 || width <= 0 {
            return Err(Error::shape(
                name,
                format!("cropping {s} by ({top}, {bottom}), ({left}, {right}) leaves nothing"),
            ));
        }
        let shape = Shape { height, width, ..s };
        self.push(name, Op::Crop { top, bottom, left, right }, &[x], shape)
    }

    /// An unpadded convolution; pad explicitly beforehand for `same` output.
    pub fn conv2d(&mut self, name: &str, x: TensorHandle, conv: ConvParams) -> Result<TensorHandle> {
        let size = conv.ws.size();
        let &[filters, in_channels, kh, kw] = size.as_slice() else {
            return Err(Error::Config(format!("{name}: convolution weight must be 4-d, got {size:?}")));
        };
        if in_channels != x.shape.channels {
            return Err(Error::shape(
                name,
                format!("expects {in_channels} input channels, found {}", x.shape),
            ));
        }
        let out = |input: i64, kernel: i64| conv_output(input, kernel, conv.stride, Padding::Valid);
        let (Some(height), Some(width)) = (out(x.shape.height, kh), out(x.shape.width, kw)) else {
            return Err(Error::shape(
                name,
                format!("{kh}x{kw} valid convolution does not fit in {}", x.shape),
            ));
        };
        let shape = Shape {
            height,
            width,
            channels: filters,
        };
        self.push(name, Op::Conv2d(conv), &[x], shape)
    }

    pub fn instance_norm(&mut self, name: &str, x: TensorHandle, norm: NormParams) -> Result<TensorHandle> {
        if norm.gamma.size() != [x.shape.channels] || norm.beta.size() != [x.shape.channels] {
            return Err(Error::shape(name, format!("normalisation parameters do not match {}", x.shape)));
        }
        self.push(name, Op::InstanceNorm(norm), &[x], x.shape)
    }

    pub fn relu(&mut self, name: &str, x: TensorHandle) -> Result<TensorHandle> {
        self.push(name, Op::Relu, &[x], x.shape)
    }

    pub fn tanh(&mut self, name: &str, x: TensorHandle) -> Result<TensorHandle> {
        self.push(name, Op::Tanh, &[x], x.shape)
    }

    pub fn deprocess(&mut self, name: &str, x: TensorHandle) -> Result<TensorHandle> {
        if x.shape.channels != 3 {
            return Err(Error::shape(name, format!("deprocessing expects 3 channels, found {}", x.shape)));
        }
        self.push(name, Op::Deprocess, &[x], x.shape)
    }

    pub fn upsample_nearest(&mut self, name: &str, x: TensorHandle, factor: i64) -> Result<TensorHandle> {
        if factor <= 0 {
            return Err(Error::Config(format!("{name}: upsampling factor must be positive")));
        }
        let s = x.shape;
        let shape = Shape {
            height: s.height * factor,
            width: s.width * factor,
            ..s
        };
        self.push(name, Op::UpsampleNearest { factor }, &[x], shape)
    }

    /// Non-overlapping `size`x`size` max pooling; trailing rows and columns are dropped.
    pub fn max_pool(&mut self, name: &str, x: TensorHandle, size: i64) -> Result<TensorHandle> {
        if size <= 0 {
            return Err(Error::Config(format!("{name}: pool size must be positive")));
        }
        let out = |input: i64| conv_output(input, size, size, Padding::Valid);
        let (Some(height), Some(width)) = (out(x.shape.height), out(x.shape.width)) else {
            return Err(Error::shape(name, format!("{size}x{size} pool does not fit in {}", x.shape)));
        };
        let shape = Shape {
            height,
            width,
            ..x.shape
        };
        self.push(name, Op::MaxPool { size }, &[x], shape)
    }

    pub fn add(&mut self, name: &str, a: TensorHandle, b: TensorHandle) -> Result<TensorHandle> {
        if a.shape != b.shape {
            return Err(Error::shapes_differ(name, a.shape, b.shape));
        }
        self.push(name, Op::Add, &[a, b], a.shape)
    }

    pub fn finish(self, output: TensorHandle) -> Result<ComputationGraph> {
        self.check(&output)?;
        let input = self
            .input
            .ok_or_else(|| Error::Config("graph has no declared input".into()))?;
        Ok(ComputationGraph {
            lineage: self.lineage,
            ancestry: self.ancestry,
            nodes: self.nodes,
            input,
            output: output.id,
        })
    }
}

/// An immutable graph with one declared input and one declared output.
#[derive(Debug)]
pub struct ComputationGraph {
    lineage: u64,
    ancestry: Ancestry,
    nodes: IndexMap<String, Arc<Node>>,
    input: NodeId,
    output: NodeId,
}

impl ComputationGraph {
    fn handle(&self, id: NodeId) -> TensorHandle {
        TensorHandle {
            lineage: self.lineage,
            id,
            shape: self.nodes[id].shape,
        }
    }

    pub fn input(&self) -> TensorHandle {
        self.handle(self.input)
    }

    pub fn output(&self) -> TensorHandle {
        self.handle(self.output)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look a node up by its unique name.
    pub fn node(&self, name: &str) -> Option<TensorHandle> {
        self.nodes.get_index_of(name).map(|id| self.handle(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|n| n.as_ref())
    }

    fn contains(&self, handle: &TensorHandle) -> bool {
        (handle.lineage == self.lineage && handle.id < self.nodes.len()) || self.ancestry.owns(handle)
    }

    pub fn summary(&self) -> Vec<LayerSummary> {
        self.nodes()
            .map(|n| LayerSummary {
                name: n.name().to_owned(),
                op: n.op().kind(),
                inputs: n.inputs().iter().map(|&i| self.nodes[i].name.clone()).collect(),
                shape: n.shape(),
            })
            .collect()
    }

    /// True when `node` is computed (transitively) from `ancestor`.
    pub fn depends_on(&self, node: TensorHandle, ancestor: TensorHandle) -> bool {
        if !self.contains(&node) || !self.contains(&ancestor) {
            return false;
        }
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![node.id];
        while let Some(id) = stack.pop() {
            if id == ancestor.id {
                return true;
            }
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            stack.extend(self.nodes[id].inputs.iter().copied());
        }
        false
    }

    /// Evaluate every node, in construction order, on an NCHW batch.
    pub fn forward_all(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let expected = self.nodes[self.input].shape;
        let size = xs.size();
        if size.len() != 4 || size[1..] != expected.nchw(size[0])[1..] {
            return Err(Error::shape(
                &self.nodes[self.input].name,
                format!("input tensor of size {size:?} does not match declared {expected}"),
            ));
        }
        let mut values: Vec<Tensor> = Vec::with_capacity(self.nodes.len());
        for (id, node) in self.nodes.values().enumerate() {
            let value = if id == self.input {
                xs.shallow_clone()
            } else {
                node.eval(&values)
            };
            values.push(value);
        }
        Ok(values)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut values = self.forward_all(xs)?;
        Ok(values.swap_remove(self.output))
    }
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind};

    use super::*;

    fn shape(h: i64, w: i64, c: i64) -> Shape {
        Shape::new(h, w, c).unwrap()
    }

    #[test]
    fn shapes_are_inferred_while_building() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(8, 6, 2)).unwrap();
        let padded = g.zero_pad("pad", x, (1, 1), (2, 0)).unwrap();
        assert_eq!(padded.shape(), shape(10, 8, 2));
        let cropped = g.crop("crop", padded, (2, 2), (1, 1)).unwrap();
        assert_eq!(cropped.shape(), shape(6, 6, 2));
        let up = g.upsample_nearest("up", cropped, 2).unwrap();
        assert_eq!(up.shape(), shape(12, 12, 2));
        let pooled = g.max_pool("pool", up, 2).unwrap();
        assert_eq!(pooled.shape(), shape(6, 6, 2));
    }

    #[test]
    fn mismatched_add_fails() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(8, 8, 2)).unwrap();
        let c = g.crop("crop", x, (1, 1), (1, 1)).unwrap();
        let err = g.add("add", x, c).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn over_cropping_fails() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 1)).unwrap();
        assert!(matches!(
            g.crop("crop", x, (2, 2), (0, 0)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn names_are_unique() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 1)).unwrap();
        g.relu("act", x).unwrap();
        assert!(matches!(g.relu("act", x), Err(Error::Config(_))));
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut a = GraphBuilder::new();
        let mut b = GraphBuilder::new();
        let x = a.input("input", shape(4, 4, 1)).unwrap();
        b.input("input", shape(4, 4, 1)).unwrap();
        assert!(matches!(b.relu("act", x), Err(Error::Config(_))));
    }

    #[test]
    fn conv_checks_channels_and_fit() {
        let opts = (Kind::Float, Device::Cpu);
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 2)).unwrap();
        let conv = |c_in| ConvParams {
            ws: Tensor::zeros([3, c_in, 3, 3], opts),
            bs: None,
            stride: 1,
        };
        assert!(matches!(g.conv2d("bad", x, conv(5)), Err(Error::ShapeMismatch { .. })));
        let y = g.conv2d("conv", x, conv(2)).unwrap();
        assert_eq!(y.shape(), shape(2, 2, 3));
        assert!(matches!(g.conv2d("tiny", y, conv(3)), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn forward_matches_declared_shapes() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 6, 3)).unwrap();
        let padded = g.zero_pad("pad", x, (1, 1), (1, 1)).unwrap();
        let cropped = g.crop("crop", padded, (1, 1), (1, 1)).unwrap();
        let sum = g.add("add", cropped, x).unwrap();
        let up = g.upsample_nearest("up", sum, 2).unwrap();
        let graph = g.finish(up).unwrap();

        let xs = Tensor::ones([2, 3, 4, 6], (Kind::Float, Device::Cpu));
        let values = graph.forward_all(&xs).unwrap();
        for (node, value) in graph.nodes().zip(values.iter()) {
            assert_eq!(value.size(), node.shape().nchw(2));
        }
        let out = graph.forward(&xs).unwrap();
        assert_eq!(out.size(), [2, 3, 8, 12]);
        assert_eq!(out.double_value(&[0, 0, 0, 0]), 2.0);
    }

    #[test]
    fn forward_rejects_wrong_input() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 3)).unwrap();
        let graph = g.finish(x).unwrap();
        let xs = Tensor::ones([1, 3, 5, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(graph.forward(&xs), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn extended_graphs_share_their_prefix() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 1)).unwrap();
        let y = g.relu("act", x).unwrap();
        let base = g.finish(y).unwrap();

        let mut ext = GraphBuilder::extend(&base);
        assert!(matches!(ext.input("again", shape(4, 4, 1)), Err(Error::Config(_))));
        let z = ext.tanh("squash", base.output()).unwrap();
        let unrelated = ext.upsample_nearest("up", base.input(), 2).unwrap();
        let stitched = ext.finish(z).unwrap();

        assert_eq!(base.len(), 2);
        assert_eq!(stitched.len(), 4);
        assert_eq!(stitched.input().id(), base.input().id());
        assert!(stitched.depends_on(z, base.input()));
        assert!(stitched.depends_on(z, base.output()));
        assert!(!stitched.depends_on(unrelated, base.output()));
        assert!(!base.depends_on(z, base.input()));
    }

    #[test]
    fn nodes_are_looked_up_by_name_in_construction_order() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 2)).unwrap();
        let a = g.relu("act", x).unwrap();
        let b = g.add("sum", a, x).unwrap();
        let graph = g.finish(b).unwrap();

        assert_eq!(graph.node("act"), Some(a));
        assert_eq!(graph.node("sum"), Some(b));
        assert_eq!(graph.node("missing"), None);
        let names: Vec<_> = graph.nodes().map(|n| n.name()).collect();
        assert_eq!(names, ["input", "act", "sum"]);
    }

    #[test]
    fn summary_lists_ops_and_inputs() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(4, 4, 2)).unwrap();
        let a = g.relu("act", x).unwrap();
        let b = g.add("sum", a, x).unwrap();
        let graph = g.finish(b).unwrap();

        let summary = graph.summary();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].op, "input");
        assert!(summary[0].inputs.is_empty());
        assert_eq!(summary[2].op, "add");
        assert_eq!(summary[2].inputs, ["act", "input"]);
        assert_eq!(summary[2].shape, shape(4, 4, 2));
        assert!(matches!(graph.nodes().nth(2).unwrap().op(), Op::Add));
    }

    #[test]
    fn deprocess_maps_unit_range_to_pixels() {
        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(1, 3, 3)).unwrap();
        let y = g.deprocess("deprocess", x).unwrap();
        let graph = g.finish(y).unwrap();

        let xs = Tensor::from_slice(&[-1f32, 0.0, 1.0])
            .view([1, 1, 1, 3])
            .repeat([1, 3, 1, 1]);
        let out = graph.forward(&xs).unwrap();
        for c in 0..3 {
            assert_eq!(out.double_value(&[0, c, 0, 0]), 0.0);
            assert_eq!(out.double_value(&[0, c, 0, 1]), 127.5);
            assert_eq!(out.double_value(&[0, c, 0, 2]), 255.0);
        }

        let mut g = GraphBuilder::new();
        let x = g.input("input", shape(1, 3, 2)).unwrap();
        assert!(matches!(g.deprocess("deprocess", x), Err(Error::ShapeMismatch { .. })));
    }
}
