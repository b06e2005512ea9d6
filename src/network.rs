//! The trainable network: a [`LayerStack`] plus everything it needs to run.
//!
//! `Network` owns the flat parameter buffer and its gradient twin, one arena set for training
//! and one for inference, the updater, and the transient input/label references of the
//! current iteration. Layers only ever see borrowed slices of the buffers.

use std::ops::Range;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::NetworkConfig;
use crate::data::DataSet;
use crate::envelope::{Activations, BackpropResult, GradientMap, TensorMap};
use crate::error::soften;
use crate::layer::{Node, OutputLayer, RnnState};
use crate::listener::TrainingListener;
use crate::optim::{GradientsAccumulator, OptimizerUpdater, Updater};
use crate::params::{GradientBuffer, ParamStore};
use crate::stack::LayerStack;
use crate::workspace::{Workspace, WorkspaceKind, Workspaces};
use crate::{Error, Result, Tensor, tensor};

#[derive(Debug)]
pub struct Network {
    pub(crate) config: NetworkConfig,
    pub(crate) stack: LayerStack,
    pub(crate) store: ParamStore,
    pub(crate) gradient: GradientBuffer,
    pub(crate) training_ws: Workspaces,
    pub(crate) inference_ws: Workspaces,
    input: Option<Activations>,
    labels: Option<Tensor>,
    labels_mask: Option<Tensor>,
    updater: Box<dyn Updater>,
    accumulator: Option<(Arc<dyn GradientsAccumulator>, usize)>,
    pub(crate) listeners: Vec<Box<dyn TrainingListener>>,
    score: f32,
    gradients: Option<GradientMap>,
}

impl Network {
    /// Initialize with randomly initialized parameters drawn from `config.seed`.
    pub fn new(config: NetworkConfig, stack: LayerStack) -> Result<Self> {
        Self::init(config, stack, None)
    }

    /// Initialize, optionally taking the parameters from a `[1, n]` row vector.
    ///
    /// The supplied values are copied; the network's buffer is never shared with the caller.
    pub fn init(config: NetworkConfig, stack: LayerStack, params: Option<&Tensor>) -> Result<Self> {
        config.validate()?;
        let (mut store, needs_init) = ParamStore::initialize(stack.param_specs(), params)?;
        if needs_init {
            let mut rng = StdRng::seed_from_u64(config.seed);
            stack.init_params(store.as_mut_slice(), &mut rng);
        }
        let gradient = store.build_gradient_view();
        let training_ws = Workspaces::new(config.training_workspace_mode, config.cache_mode)?;
        let inference_ws = Workspaces::new(config.inference_workspace_mode, config.cache_mode)?;
        let updater = OptimizerUpdater::new(config.optimizer, config.lr, config.lr_schedule, store.len())?;

        tracing::debug!(
            layers = stack.len(),
            params = store.len(),
            training_workspace = ?config.training_workspace_mode,
            inference_workspace = ?config.inference_workspace_mode,
            cache = ?config.cache_mode,
            "network initialized"
        );

        Ok(Self {
            config,
            stack,
            store,
            gradient,
            training_ws,
            inference_ws,
            input: None,
            labels: None,
            labels_mask: None,
            updater: Box::new(updater),
            accumulator: None,
            listeners: Vec::new(),
            score: 0.0,
            gradients: None,
        })
    }

    /// Stack, parameter slice and the arena set for the requested mode.
    fn parts(&mut self, training: bool) -> (&mut LayerStack, &[f32], &mut Workspaces) {
        let ws = if training {
            &mut self.training_ws
        } else {
            &mut self.inference_ws
        };
        (&mut self.stack, self.store.as_slice(), ws)
    }

    // ---- structure -----------------------------------------------------------------------

    #[inline]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    #[inline]
    pub fn stack(&self) -> &LayerStack {
        &self.stack
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.stack.len()
    }

    pub fn layer(&self, idx: usize) -> Result<&Node> {
        self.stack.node(idx)
    }

    pub fn summary(&self) -> String {
        self.stack.summary()
    }

    /// Arena set used for training (`true`) or inference (`false`).
    pub fn workspaces(&self, training: bool) -> &Workspaces {
        if training {
            &self.training_ws
        } else {
            &self.inference_ws
        }
    }

    // ---- parameters ----------------------------------------------------------------------

    #[inline]
    pub fn num_params(&self) -> usize {
        self.store.len()
    }

    /// Copy of the flat buffer as a `[1, n]` row vector.
    pub fn params(&self) -> Tensor {
        self.store.params()
    }

    pub fn set_params(&mut self, values: &Tensor) -> Result<()> {
        self.store.set_params(values)
    }

    /// Address of the parameter buffer; it never changes after construction.
    #[inline]
    pub fn params_ptr(&self) -> *const f32 {
        self.store.buffer_ptr()
    }

    /// Range of layer `idx` in the flat buffer; `None` for parameterless layers.
    pub fn param_range(&self, idx: usize) -> Result<Option<Range<usize>>> {
        self.stack.node(idx)?;
        Ok(self.store.layout().range(idx))
    }

    pub fn param_view(&self, idx: usize) -> Result<Option<&[f32]>> {
        self.store.view(idx)
    }

    pub fn gradient(&self) -> &GradientBuffer {
        &self.gradient
    }

    pub fn get_param(&self, idx: usize, name: &str) -> Result<Tensor> {
        self.store.get_param(idx, name)
    }

    pub fn set_param(&mut self, idx: usize, name: &str, value: &Tensor) -> Result<()> {
        self.store.set_param(idx, name, value)
    }

    /// [`get_param`](Self::get_param) addressed as `"<layer>_<name>"`.
    pub fn get_param_by_key(&self, key: &str) -> Result<Tensor> {
        self.store.get_param_by_key(key)
    }

    pub fn set_param_by_key(&mut self, key: &str, value: &Tensor) -> Result<()> {
        self.store.set_param_by_key(key, value)
    }

    /// Every named parameter keyed `"<layer>_<name>"`, layer 0 first.
    pub fn param_table(&self) -> Result<TensorMap> {
        self.store.param_table()
    }

    /// Replace every parameter at once; nothing is written unless the whole table fits.
    pub fn set_param_table(&mut self, table: &TensorMap) -> Result<()> {
        self.store.set_param_table(table)
    }

    // ---- inputs --------------------------------------------------------------------------

    pub fn set_input(&mut self, input: Activations) {
        self.input = Some(input);
    }

    pub fn input(&self) -> Option<&Activations> {
        self.input.as_ref()
    }

    pub fn set_labels(&mut self, labels: Option<Tensor>, mask: Option<Tensor>) {
        self.labels = labels;
        self.labels_mask = mask;
    }

    // ---- forward -------------------------------------------------------------------------

    /// Activations of every layer up to `last` for the stored input.
    pub fn feed_forward_to_layer(&mut self, last: usize, training: bool) -> Result<Vec<Activations>> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| Error::MissingInput("no input set".to_owned()))?;
        let (stack, params, ws) = self.parts(training);
        ws.scoped(&[WorkspaceKind::External], |ws| {
            stack.feed_forward_to_layer(params, &input, last, training, ws)
        })
    }

    /// Set `input` and compute the activations of every layer.
    pub fn feed_forward(&mut self, input: Activations, training: bool) -> Result<Vec<Activations>> {
        self.set_input(input);
        let last = self.stack.len() - 1;
        self.feed_forward_to_layer(last, training)
    }

    /// Network output for `input`. The input is not retained.
    pub fn output(&mut self, input: &Tensor, training: bool) -> Result<Tensor> {
        let acts = self.feed_forward(Activations::new(input.clone()), training);
        self.input = None;
        acts?
            .pop()
            .map(|a| a.tensor)
            .ok_or_else(|| Error::MissingInput("network produced no output".to_owned()))
    }

    /// Output of layer `to` when `input` is fed straight into layer `from`.
    pub fn activate_selected_layers(&mut self, from: usize, to: usize, input: &Tensor) -> Result<Tensor> {
        let input = Activations::new(input.clone());
        let (stack, params, ws) = self.parts(false);
        ws.scoped(&[WorkspaceKind::External], |ws| {
            stack.activate_selected_layers(params, from, to, &input, ws)
        })
        .map(|a| a.tensor)
    }

    // ---- backward ------------------------------------------------------------------------

    /// Forward the stored input, backpropagate the loss against the stored labels and pack the
    /// gradients into the gradient buffer. Returns the score.
    ///
    /// A network without a terminal output layer logs a warning and returns `Ok(None)`.
    pub fn compute_gradient_and_score(&mut self) -> Result<Option<f32>> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| Error::MissingInput("no input set".to_owned()))?;
        if !self.stack.has_output_layer() {
            return soften(Err(Error::UnsupportedConfiguration(
                "cannot compute a score without an output layer".to_owned(),
            )));
        }
        self.stack
            .synchronize_counts(self.config.iteration_count, self.config.epoch_count);

        let tbptt = self.config.is_tbptt();
        let back_length = tbptt.then_some(self.config.tbptt_back_length);
        let labels = self.labels.clone();
        let labels_mask = self.labels_mask.clone();
        let n = self.stack.len();

        let (stack, params, ws) = self.parts(true);
        let step = ws.scoped(&[WorkspaceKind::External], |ws| {
            let acts = if tbptt {
                stack.rnn_activate_using_stored_state(params, &input, true, true, ws)?
            } else if n >= 2 {
                stack.feed_forward_to_layer(params, &input, n - 2, true, ws)?
            } else {
                vec![input.shallow_clone()]
            };
            let output_input = acts[n - 1].shallow_clone();
            {
                let (output, _) = stack.output_layer_mut(params)?;
                output.set_input(output_input);
                output.set_labels(labels, labels_mask);
            }

            let Some(result) = stack.backprop_gradients(params, None, true, back_length, ws)? else {
                return Ok(None);
            };
            let (output, view) = stack.output_layer_mut(params)?;
            let mut scope = ws.arena_mut(WorkspaceKind::FeedForward).enter_scope();
            let score = output.compute_score(view, &mut scope)?;
            Ok(Some((acts, result, score)))
        })?;

        let Some((acts, result, score)) = step else {
            return Ok(None);
        };
        for l in &mut self.listeners {
            l.on_forward_pass(&acts);
        }
        self.gradient.pack(&result.gradients, self.store.specs())?;
        for l in &mut self.listeners {
            l.on_backward_pass(&result.gradients);
        }
        self.score = score;
        self.gradients = Some(result.gradients);
        Ok(Some(score))
    }

    /// Backpropagate an externally supplied dL/d(output) through the whole stack.
    ///
    /// Uses the activations cached by the last training-mode forward pass and packs the
    /// gradients into the gradient buffer.
    pub fn backprop_gradient(&mut self, epsilon: Tensor) -> Result<Option<BackpropResult>> {
        let back_length = self.config.is_tbptt().then_some(self.config.tbptt_back_length);
        let (stack, params, ws) = self.parts(true);
        let result = ws.scoped(&[WorkspaceKind::External], |ws| {
            stack.backprop_gradients(params, Some(epsilon), false, back_length, ws)
        })?;
        if let Some(result) = &result {
            self.gradient.pack(&result.gradients, self.store.specs())?;
            self.gradients = Some(result.gradients.clone());
        }
        Ok(result)
    }

    /// Keyed gradients of the last backward pass.
    pub fn gradients(&self) -> Option<&GradientMap> {
        self.gradients.as_ref()
    }

    /// Turn the gradient buffer into an update and subtract it from the parameters.
    ///
    /// Frozen layers' ranges are zeroed first, so they never move. Advances the iteration
    /// counter.
    pub fn apply_update(&mut self) -> Result<()> {
        let restore = match &self.accumulator {
            Some((acc, _)) => {
                check_accumulator(acc.as_ref(), self.gradient.as_slice().len())?;
                Some(self.updater.state_view())
            }
            None => None,
        };
        self.zero_frozen();
        self.updater.update(
            self.gradient.as_mut_slice(),
            self.config.iteration_count,
            self.config.epoch_count,
        )?;
        if let Some((acc, party)) = &self.accumulator {
            let shared = acc
                .store_update(*party, self.gradient.as_slice())
                .and_then(|()| acc.apply_update(*party, self.gradient.as_mut_slice()));
            if let Err(e) = shared {
                if let Some(state) = &restore {
                    self.updater.set_state_view(state)?;
                }
                return Err(e);
            }
            self.zero_frozen();
        }
        for (p, u) in self.store.as_mut_slice().iter_mut().zip(self.gradient.as_slice()) {
            *p -= *u;
        }
        self.config.iteration_count += 1;
        Ok(())
    }

    fn zero_frozen(&mut self) {
        for (idx, node) in self.stack.nodes().iter().enumerate() {
            if node.is_frozen() {
                self.gradient.zero_layer(idx);
            }
        }
    }

    /// Score of the last gradient computation.
    #[inline]
    pub fn score(&self) -> f32 {
        self.score
    }

    /// Score of `features` against `labels` without touching parameters or stored state.
    pub fn score_dataset(&mut self, ds: &DataSet) -> Result<Option<f32>> {
        self.score_with(ds, |output, params, ws| output.compute_score(params, ws))
    }

    /// Per-example scores as a `[batch, 1]` column, averaging to
    /// [`score_dataset`](Self::score_dataset).
    ///
    /// Masked examples score zero; a time series example scores the sum of its unmasked steps.
    pub fn score_examples(&mut self, ds: &DataSet) -> Result<Option<Tensor>> {
        self.score_with(ds, |output, params, ws| output.compute_score_examples(params, ws))
    }

    fn score_with<T>(
        &mut self,
        ds: &DataSet,
        score: impl FnOnce(&mut dyn OutputLayer, &[f32], &mut Workspace) -> Result<T>,
    ) -> Result<Option<T>> {
        if !self.stack.has_output_layer() {
            return soften(Err(Error::UnsupportedConfiguration(
                "cannot compute a score without an output layer".to_owned(),
            )));
        }
        let labels = ds.labels.clone().ok_or(Error::MissingLabels)?;
        let input = ds.input();
        let labels_mask = ds.labels_mask.clone();
        let n = self.stack.len();

        let (stack, params, ws) = self.parts(false);
        let out = ws.scoped(&[WorkspaceKind::External], |ws| {
            let last_input = if n >= 2 {
                let mut acts = stack.feed_forward_to_layer(params, &input, n - 2, false, ws)?;
                acts.pop()
                    .ok_or_else(|| Error::MissingInput("network produced no output".to_owned()))?
            } else {
                input.shallow_clone()
            };
            let (output, view) = stack.output_layer_mut(params)?;
            output.set_input(last_input);
            output.set_labels(Some(labels), labels_mask);
            let mut scope = ws.arena_mut(WorkspaceKind::FeedForward).enter_scope();
            let out = score(&mut *output, view, &mut *scope);
            output.clear();
            out
        })?;
        Ok(Some(out))
    }

    // ---- recurrent -----------------------------------------------------------------------

    /// Feed one or more steps, carrying each recurrent layer's stored state forward.
    ///
    /// A `[batch, features]` input comes back as `[batch, outputs]`.
    pub fn rnn_time_step(&mut self, input: &Tensor) -> Result<Tensor> {
        let single_step = input.ndim() == 2;
        let input = Activations::new(input.clone());
        let (stack, params, ws) = self.parts(false);
        let out = ws.scoped(&[WorkspaceKind::External], |ws| {
            stack.rnn_time_step(params, &input, ws)
        });
        self.input = None;
        let out = out?.tensor;
        Ok(if single_step {
            tensor::squeeze_time(out)
        } else {
            out
        })
    }

    pub fn rnn_get_previous_state(&self, idx: usize) -> Result<Option<RnnState>> {
        self.stack.rnn_get_previous_state(idx)
    }

    pub fn rnn_set_previous_state(&mut self, idx: usize, state: RnnState) -> Result<()> {
        self.stack.rnn_set_previous_state(idx, state)
    }

    pub fn rnn_clear_previous_state(&mut self) {
        self.stack.rnn_clear_previous_state();
    }

    /// Activations of every layer starting from the stored state, which is left as is.
    pub fn rnn_activate_using_stored_state(
        &mut self,
        input: &Activations,
        training: bool,
        store_last_for_tbptt: bool,
    ) -> Result<Vec<Activations>> {
        let (stack, params, ws) = self.parts(training);
        ws.scoped(&[WorkspaceKind::External], |ws| {
            stack.rnn_activate_using_stored_state(params, input, training, store_last_for_tbptt, ws)
        })
    }

    pub fn update_rnn_state_with_tbptt_state(&mut self) {
        self.stack.update_rnn_state_with_tbptt_state();
    }

    // ---- lifecycle -----------------------------------------------------------------------

    /// Drop the input, labels and every layer's per-iteration caches.
    ///
    /// Recurrent state and updater state survive.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.input = None;
        self.labels = None;
        self.labels_mask = None;
        self.gradients = None;
    }

    pub fn add_listener(&mut self, listener: impl TrainingListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Replace the update rule, e.g. with a custom [`Updater`].
    pub fn set_updater(&mut self, updater: Box<dyn Updater>) {
        self.updater = updater;
    }

    pub fn updater_state(&self) -> Tensor {
        self.updater.state_view()
    }

    pub fn set_updater_state(&mut self, state: &Tensor) -> Result<()> {
        self.updater.set_state_view(state)
    }

    /// Share updates with other networks through `accumulator`.
    ///
    /// Once attached, every update this network applies is published to the other parties and
    /// theirs are folded into its own. Do not also train the same parameters standalone.
    pub fn set_gradients_accumulator(&mut self, accumulator: Arc<dyn GradientsAccumulator>) -> Result<()> {
        check_accumulator(accumulator.as_ref(), self.num_params())?;
        let party = accumulator.register()?;
        tracing::debug!(party, "gradients accumulator attached");
        self.accumulator = Some((accumulator, party));
        Ok(())
    }

    /// Mini-batch example count of the stored input.
    pub fn input_mini_batch_size(&self) -> usize {
        self.input.as_ref().map_or(0, Activations::batch_size)
    }
}

fn check_accumulator(acc: &dyn GradientsAccumulator, num_params: usize) -> Result<()> {
    if acc.num_params() != num_params {
        return Err(Error::ShapeMismatch(format!(
            "accumulator exchanges {} values, network has {num_params} parameters",
            acc.num_params()
        )));
    }
    Ok(())
}

/// Duplicates parameters, layer state and updater state.
///
/// Listeners and an attached gradients accumulator are not carried over.
impl Clone for Network {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            stack: self.stack.clone(),
            store: self.store.clone(),
            gradient: self.gradient.clone(),
            training_ws: self.training_ws.clone(),
            inference_ws: self.inference_ws.clone(),
            input: self.input.clone(),
            labels: self.labels.clone(),
            labels_mask: self.labels_mask.clone(),
            updater: self.updater.box_clone(),
            accumulator: None,
            listeners: Vec::new(),
            score: self.score,
            gradients: self.gradients.clone(),
        }
    }
}
