//! The layer contract consumed by the engine.
//!
//! A layer never owns its parameters. The engine passes the layer's slice of the shared
//! parameter buffer into every call (`params`), laid out as the layer's own
//! [`ParamSpec`] list declares. Layers with no parameters receive an empty slice.
//!
//! Capabilities are resolved once, when the layer is wrapped in a [`Node`]:
//!
//! - [`Node::Standard`]: plain layer.
//! - [`Node::Recurrent`]: carries state across time steps ([`RecurrentLayer`]).
//! - [`Node::Output`]: computes a loss against labels ([`OutputLayer`]).
//! - [`Node::Frozen`]: never updated; truncates the backward pass.
//! - [`Node::Nested`]: a whole [`LayerStack`] used as one layer.

use std::fmt;

use rand::rngs::StdRng;

use crate::envelope::{Activations, Gradients, TensorMap};
use crate::params::ParamSpec;
use crate::stack::LayerStack;
use crate::workspace::Workspace;
use crate::{Error, Result, Tensor};

/// Named recurrent state tensors (for example `"h"`).
pub type RnnState = TensorMap;

pub trait Layer: fmt::Debug + Send {
    /// Short type name, used by summaries and logs.
    fn layer_type(&self) -> &'static str;

    fn param_specs(&self) -> Vec<ParamSpec>;

    fn num_params(&self) -> usize {
        self.param_specs().iter().map(ParamSpec::len).sum()
    }

    /// Randomly initialize this layer's view.
    ///
    /// Shape contract: `params.len() == self.num_params()`.
    fn init_params(&self, params: &mut [f32], rng: &mut StdRng);

    /// Forward pass. `input` is already a shallow copy owned by the layer.
    ///
    /// Tensors the layer allocates should come from `ws`; the engine promotes the returned
    /// activations out of the step's scope.
    fn activate(
        &mut self,
        params: &[f32],
        input: Activations,
        training: bool,
        ws: &mut Workspace,
    ) -> Result<Activations>;

    /// Backward pass for the most recent training-mode `activate`.
    ///
    /// `epsilon.activation_grad` is dL/d(output). The result carries dL/d(input) and this
    /// layer's parameter gradients keyed by bare parameter name.
    fn backprop_gradient(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        ws: &mut Workspace,
    ) -> Result<Gradients>;

    fn is_pretrain_layer(&self) -> bool {
        false
    }

    /// One unsupervised step on this layer's own view; returns the step's score.
    fn pretrain_step(
        &mut self,
        _params: &mut [f32],
        _input: &Activations,
        _ws: &mut Workspace,
    ) -> Result<f32> {
        Err(Error::UnsupportedConfiguration(format!(
            "{} layers cannot be pretrained",
            self.layer_type()
        )))
    }

    fn set_input_mini_batch_size(&mut self, _size: usize) {}

    fn set_iteration_count(&mut self, _iteration: u64) {}

    fn set_epoch_count(&mut self, _epoch: u64) {}

    /// Drop cached inputs and other per-iteration state.
    fn clear(&mut self) {}

    fn box_clone(&self) -> Box<dyn Layer>;
}

pub trait RecurrentLayer: Layer {
    /// Run one or more steps starting from, and then updating, the stored state.
    fn rnn_time_step(
        &mut self,
        params: &[f32],
        input: Activations,
        ws: &mut Workspace,
    ) -> Result<Activations>;

    /// Run starting from the stored state without modifying it.
    ///
    /// With `store_last_for_tbptt` the final state is kept aside as the TBPTT state.
    fn rnn_activate_using_stored_state(
        &mut self,
        params: &[f32],
        input: Activations,
        training: bool,
        store_last_for_tbptt: bool,
        ws: &mut Workspace,
    ) -> Result<Activations>;

    fn rnn_get_previous_state(&self) -> RnnState;

    fn rnn_set_previous_state(&mut self, state: RnnState);

    fn rnn_clear_previous_state(&mut self);

    fn rnn_get_tbptt_state(&self) -> RnnState;

    fn rnn_set_tbptt_state(&mut self, state: RnnState);

    /// Backward pass limited to the last `back_length` time steps.
    fn tbptt_backprop_gradient(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        _back_length: usize,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        self.backprop_gradient(params, epsilon, ws)
    }

    fn box_clone_recurrent(&self) -> Box<dyn RecurrentLayer>;
}

pub trait OutputLayer: Layer {
    /// Labels plus an optional label mask.
    fn set_labels(&mut self, labels: Option<Tensor>, mask: Option<Tensor>);

    fn has_labels(&self) -> bool;

    /// Input the loss is computed from.
    fn set_input(&mut self, input: Activations);

    /// Score of the stored input against the stored labels.
    fn compute_score(&mut self, params: &[f32], ws: &mut Workspace) -> Result<f32>;

    /// Score of every example as a `[batch, 1]` column; their mean is
    /// [`compute_score`](Self::compute_score). Time series sum their unmasked steps.
    fn compute_score_examples(&mut self, params: &[f32], ws: &mut Workspace) -> Result<Tensor>;

    fn box_clone_output(&self) -> Box<dyn OutputLayer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Standard,
    Recurrent,
    Output,
    Frozen,
    Nested,
}

/// A layer slot in a stack.
#[derive(Debug)]
pub enum Node {
    Standard(Box<dyn Layer>),
    Recurrent(Box<dyn RecurrentLayer>),
    Output(Box<dyn OutputLayer>),
    Frozen(Box<dyn Layer>),
    Nested(Box<LayerStack>),
}

/// Run `$body` against the leaf layer, or `$nested` for a nested stack.
macro_rules! dispatch {
    ($node:expr, $l:ident => $body:expr, $n:ident => $nested:expr) => {
        match $node {
            Node::Standard($l) | Node::Frozen($l) => $body,
            Node::Recurrent($l) => $body,
            Node::Output($l) => $body,
            Node::Nested($n) => $nested,
        }
    };
}
pub(crate) use dispatch;

impl Node {
    pub fn standard(layer: impl Layer + 'static) -> Self {
        Node::Standard(Box::new(layer))
    }

    pub fn recurrent(layer: impl RecurrentLayer + 'static) -> Self {
        Node::Recurrent(Box::new(layer))
    }

    pub fn output(layer: impl OutputLayer + 'static) -> Self {
        Node::Output(Box::new(layer))
    }

    pub fn frozen(layer: impl Layer + 'static) -> Self {
        Node::Frozen(Box::new(layer))
    }

    pub fn nested(stack: LayerStack) -> Self {
        Node::Nested(Box::new(stack))
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Standard(_) => NodeKind::Standard,
            Node::Recurrent(_) => NodeKind::Recurrent,
            Node::Output(_) => NodeKind::Output,
            Node::Frozen(_) => NodeKind::Frozen,
            Node::Nested(_) => NodeKind::Nested,
        }
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        matches!(self, Node::Frozen(_))
    }

    pub fn layer_type(&self) -> &'static str {
        dispatch!(self, l => l.layer_type(), _n => "LayerStack")
    }

    /// Parameter specs; a nested stack reports its layers' specs as `"<inner>_<name>"`.
    pub fn param_specs(&self) -> Vec<ParamSpec> {
        dispatch!(self, l => l.param_specs(), n => n.flat_param_specs())
    }

    pub fn num_params(&self) -> usize {
        dispatch!(self, l => l.num_params(), n => n.num_params())
    }

    pub fn init_params(&self, params: &mut [f32], rng: &mut StdRng) {
        dispatch!(self, l => l.init_params(params, rng), n => n.init_params(params, rng))
    }

    pub fn is_pretrain_layer(&self) -> bool {
        dispatch!(self, l => l.is_pretrain_layer(), _n => false)
    }

    /// One unsupervised step of a pretrain layer on its own parameter view.
    pub fn pretrain_step(
        &mut self,
        params: &mut [f32],
        input: &Activations,
        ws: &mut Workspace,
    ) -> Result<f32> {
        dispatch!(
            self,
            l => l.pretrain_step(params, input, ws),
            _n => Err(Error::UnsupportedConfiguration(
                "nested stacks cannot be pretrained as one layer".to_owned()
            ))
        )
    }

    pub fn set_input_mini_batch_size(&mut self, size: usize) {
        dispatch!(self, l => l.set_input_mini_batch_size(size), n => n.set_input_mini_batch_size(size))
    }

    pub fn set_counts(&mut self, iteration: u64, epoch: u64) {
        dispatch!(
            self,
            l => {
                l.set_iteration_count(iteration);
                l.set_epoch_count(epoch);
            },
            n => n.synchronize_counts(iteration, epoch)
        )
    }

    pub fn clear(&mut self) {
        dispatch!(self, l => l.clear(), n => n.clear())
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        match self {
            Node::Standard(l) => Node::Standard(l.box_clone()),
            Node::Recurrent(l) => Node::Recurrent(l.box_clone_recurrent()),
            Node::Output(l) => Node::Output(l.box_clone_output()),
            Node::Frozen(l) => Node::Frozen(l.box_clone()),
            Node::Nested(n) => Node::Nested(n.clone()),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Standard => "standard",
            NodeKind::Recurrent => "recurrent",
            NodeKind::Output => "output",
            NodeKind::Frozen => "frozen",
            NodeKind::Nested => "nested",
        };
        f.write_str(name)
    }
}
