use rand::rngs::StdRng;

use super::{Init, affine, affine_backward, check_params, from_rows, matrix_tensor, to_rows};
use crate::envelope::{Activations, FlatOrder, Gradients};
use crate::layer::{Layer, OutputLayer};
use crate::loss::Loss;
use crate::params::ParamSpec;
use crate::workspace::Workspace;
use crate::{Activation, Error, Result, Tensor, tensor};

/// Dense projection followed by a loss against labels.
///
/// Labels are `[batch, n_out]`, or `[batch, n_out, time]` for time series. A label mask is
/// one weight per example (`[batch, 1]`) or per example and step (`[batch, time]`); masked
/// rows contribute neither score nor gradient.
#[derive(Debug, Clone)]
pub struct LossOutput {
    n_in: usize,
    n_out: usize,
    activation: Activation,
    loss: Loss,
    init: Init,
    input: Option<Tensor>,
    labels: Option<Tensor>,
    label_mask: Option<Tensor>,
}

/// Output of one forward pass over the stored input.
struct Forward {
    x: Tensor,
    y: Tensor,
    batch: Option<usize>,
}

impl LossOutput {
    pub fn new(n_in: usize, n_out: usize, activation: Activation, loss: Loss) -> Self {
        Self {
            n_in,
            n_out,
            activation,
            loss,
            init: Init::for_activation(activation),
            input: None,
            labels: None,
            label_mask: None,
        }
    }

    pub fn with_init(mut self, init: Init) -> Self {
        self.init = init;
        self
    }

    #[inline]
    pub fn loss(&self) -> Loss {
        self.loss
    }

    #[inline]
    fn w_len(&self) -> usize {
        self.n_in * self.n_out
    }

    fn forward(&self, params: &[f32], input: &Tensor, ws: &mut Workspace) -> Result<Forward> {
        check_params(self.layer_type(), params, self.num_params())?;
        let (x, batch) = to_rows(input, self.n_in)?;
        let w = tensor::matrix_view(&params[..self.w_len()], self.n_in, self.n_out, FlatOrder::ColumnMajor)?;
        let mut y = affine(&x, w, &params[self.w_len()..], ws)?;
        self.activation.apply(&mut y);
        Ok(Forward { x, y, batch })
    }

    fn stored_input(&self) -> Result<&Tensor> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::MissingInput("output layer has no input".to_owned()))
    }

    /// Labels as rows, their example count, and the per-row weights.
    fn label_rows(&self) -> Result<(Tensor, usize, Option<Vec<f32>>)> {
        let labels = self.labels.as_ref().ok_or(Error::MissingLabels)?;
        let (rows, _) = to_rows(labels, self.n_out)?;
        let weights = match &self.label_mask {
            None => None,
            Some(mask) if labels.ndim() == 3 => Some(tensor::fold_mask(mask)?),
            Some(mask) => Some(mask.iter().copied().collect()),
        };
        Ok((rows, labels.shape()[0], weights))
    }
}

impl Layer for LossOutput {
    fn layer_type(&self) -> &'static str {
        "LossOutput"
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("W", &[self.n_in, self.n_out], FlatOrder::ColumnMajor),
            ParamSpec::new("b", &[1, self.n_out], FlatOrder::RowMajor),
        ]
    }

    fn init_params(&self, params: &mut [f32], rng: &mut StdRng) {
        let (w, b) = params.split_at_mut(self.w_len());
        self.init.fill(self.n_in, self.n_out, w, rng);
        b.fill(0.0);
    }

    fn activate(
        &mut self,
        params: &[f32],
        input: Activations,
        training: bool,
        ws: &mut Workspace,
    ) -> Result<Activations> {
        let fwd = self.forward(params, &input.tensor, ws)?;
        if training {
            self.input = Some(input.tensor.clone());
        }
        Ok(input.map_tensor(from_rows(fwd.y, fwd.batch, ws)?))
    }

    /// Ignores `epsilon`: the error signal comes from the loss against the stored labels.
    fn backprop_gradient(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        let input = self.stored_input()?.clone();
        let (target, batch_size, weights) = self.label_rows()?;
        let fwd = self.forward(params, &input, ws)?;

        let (_, grad) = self.loss.backward(
            tensor::as_matrix(&fwd.y)?,
            tensor::as_matrix(&target)?,
            weights.as_deref(),
            batch_size,
        )?;
        let mut dz = ws.adopt(matrix_tensor(grad))?;
        self.activation.backprop_inplace(&fwd.y, &mut dz)?;

        let w = tensor::matrix_view(&params[..self.w_len()], self.n_in, self.n_out, FlatOrder::ColumnMajor)?;
        let grads = affine_backward(&fwd.x, w, &dz, ws)?;
        ws.recycle(dz);

        let mut out = Gradients {
            activation_grad: Some(from_rows(grads.dx, fwd.batch, ws)?),
            mask: epsilon.mask,
            mask_state: epsilon.mask_state,
            ..Gradients::default()
        };
        out.params.push("W", grads.dw, FlatOrder::ColumnMajor);
        out.params.push("b", grads.db, FlatOrder::RowMajor);
        Ok(out)
    }

    fn clear(&mut self) {
        self.input = None;
        self.labels = None;
        self.label_mask = None;
    }

    fn box_clone(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

impl OutputLayer for LossOutput {
    fn set_labels(&mut self, labels: Option<Tensor>, mask: Option<Tensor>) {
        self.labels = labels;
        self.label_mask = mask;
    }

    fn has_labels(&self) -> bool {
        self.labels.is_some()
    }

    fn set_input(&mut self, input: Activations) {
        self.input = Some(input.tensor);
    }

    fn compute_score(&mut self, params: &[f32], ws: &mut Workspace) -> Result<f32> {
        let input = self.stored_input()?.clone();
        let (target, batch_size, weights) = self.label_rows()?;
        let fwd = self.forward(params, &input, ws)?;
        self.loss.score(
            tensor::as_matrix(&fwd.y)?,
            tensor::as_matrix(&target)?,
            weights.as_deref(),
            batch_size,
        )
    }

    fn compute_score_examples(&mut self, params: &[f32], ws: &mut Workspace) -> Result<Tensor> {
        let input = self.stored_input()?.clone();
        let (target, batch_size, weights) = self.label_rows()?;
        let fwd = self.forward(params, &input, ws)?;
        let rows = self.loss.score_rows(
            tensor::as_matrix(&fwd.y)?,
            tensor::as_matrix(&target)?,
            weights.as_deref(),
        )?;
        // Folded time series hold `steps` consecutive rows per example.
        let steps = rows.len() / batch_size.max(1);
        let mut out = ws.alloc(&[batch_size, 1])?;
        for (slot, example) in out.iter_mut().zip(rows.chunks(steps.max(1))) {
            *slot = example.iter().sum();
        }
        Ok(out)
    }

    fn box_clone_output(&self) -> Box<dyn OutputLayer> {
        Box::new(self.clone())
    }
}
