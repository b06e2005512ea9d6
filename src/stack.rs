//! The ordered layer chain at the heart of the engine.
//!
//! A [`LayerStack`] owns its [`Node`]s and the layout of their parameter ranges, but not the
//! parameter buffer itself: every pipeline call takes the stack's flat parameter slice and
//! the [`Workspaces`](crate::workspace::Workspaces) to run in. That is what lets a stack be
//! nested inside another one as a single layer, using a sub-range of the parent's buffer.
//!
//! The pipelines themselves live in `forward.rs`, `backward.rs` and `recurrent.rs`.

use rand::rngs::StdRng;

use crate::layer::{Node, NodeKind, OutputLayer};
use crate::params::{ParamLayout, ParamSpec};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct LayerStack {
    pub(crate) nodes: Vec<Node>,
    pub(crate) layout: ParamLayout,
}

impl LayerStack {
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::InvalidConfig(
                "a layer stack needs at least one layer".to_owned(),
            ));
        }
        for (idx, node) in nodes.iter().enumerate() {
            if matches!(node, Node::Output(_)) && idx + 1 != nodes.len() {
                tracing::debug!(layer = idx, "output layer used in a non-terminal position");
            }
        }
        let counts: Vec<usize> = nodes.iter().map(Node::num_params).collect();
        Ok(Self {
            layout: ParamLayout::from_counts(&counts),
            nodes,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    #[inline]
    pub fn num_params(&self) -> usize {
        self.layout.total()
    }

    pub fn node(&self, idx: usize) -> Result<&Node> {
        let len = self.nodes.len();
        self.nodes.get(idx).ok_or_else(|| Error::index("layer", idx, len))
    }

    pub fn node_mut(&mut self, idx: usize) -> Result<&mut Node> {
        let len = self.nodes.len();
        self.nodes
            .get_mut(idx)
            .ok_or_else(|| Error::index("layer", idx, len))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        self.nodes.iter().map(Node::kind).collect()
    }

    /// Per-layer parameter specs, in layer order.
    pub fn param_specs(&self) -> Vec<Vec<ParamSpec>> {
        self.nodes.iter().map(Node::param_specs).collect()
    }

    /// All specs flattened into one list named `"<layer>_<name>"`.
    pub(crate) fn flat_param_specs(&self) -> Vec<ParamSpec> {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(idx, node)| {
                node.param_specs().into_iter().map(move |mut spec| {
                    spec.name = format!("{idx}_{}", spec.name);
                    spec
                })
            })
            .collect()
    }

    /// Let every layer initialize its own view of `params`.
    pub fn init_params(&self, params: &mut [f32], rng: &mut StdRng) {
        for (idx, node) in self.nodes.iter().enumerate() {
            let view = self.layout.slice_mut(params, idx);
            if !view.is_empty() {
                node.init_params(view, rng);
            }
        }
    }

    pub fn set_input_mini_batch_size(&mut self, size: usize) {
        for node in &mut self.nodes {
            node.set_input_mini_batch_size(size);
        }
    }

    /// Push the iteration and epoch counters into every layer.
    pub fn synchronize_counts(&mut self, iteration: u64, epoch: u64) {
        for node in &mut self.nodes {
            node.set_counts(iteration, epoch);
        }
    }

    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            node.clear();
        }
    }

    pub(crate) fn has_output_layer(&self) -> bool {
        matches!(self.nodes.last(), Some(Node::Output(_)))
    }

    /// The terminal loss layer and its parameter view.
    pub(crate) fn output_layer_mut<'a>(
        &'a mut self,
        params: &'a [f32],
    ) -> Result<(&'a mut dyn OutputLayer, &'a [f32])> {
        let last = self.nodes.len() - 1;
        let view = self.layout.slice(params, last);
        match self.nodes.last_mut() {
            Some(Node::Output(layer)) => Ok((layer.as_mut(), view)),
            Some(other) => Err(Error::UnsupportedConfiguration(format!(
                "last layer is a {} {} layer, not an output layer",
                other.kind(),
                other.layer_type()
            ))),
            None => Err(Error::UnsupportedConfiguration(
                "stack has no layers".to_owned(),
            )),
        }
    }

    pub(crate) fn check_params(&self, params: &[f32]) -> Result<()> {
        if params.len() != self.layout.total() {
            return Err(Error::ShapeMismatch(format!(
                "stack expects {} parameters, got {}",
                self.layout.total(),
                params.len()
            )));
        }
        Ok(())
    }

    /// One line per layer: index, variant, type and parameter count.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        self.write_summary(&mut out, "");
        out.push_str(&format!("total parameters: {}\n", self.num_params()));
        out
    }

    fn write_summary(&self, out: &mut String, prefix: &str) {
        for (idx, node) in self.nodes.iter().enumerate() {
            out.push_str(&format!(
                "{prefix}{idx:<4} {:<10} {:<16} {:>8}\n",
                node.kind().to_string(),
                node.layer_type(),
                node.num_params()
            ));
            if let Node::Nested(inner) = node {
                inner.write_summary(out, &format!("{prefix}{idx}."));
            }
        }
    }
}
