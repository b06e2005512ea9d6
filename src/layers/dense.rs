use rand::rngs::StdRng;

use super::{Init, affine, affine_backward, check_params, from_rows, to_rows};
use crate::envelope::{Activations, FlatOrder, Gradients};
use crate::layer::Layer;
use crate::params::ParamSpec;
use crate::workspace::Workspace;
use crate::{Activation, Error, Result, Tensor, tensor};

/// Fully connected layer: `y = activation(x W + b)`.
#[derive(Debug, Clone)]
pub struct Dense {
    n_in: usize,
    n_out: usize,
    activation: Activation,
    init: Init,
    // Cached by training-mode `activate`.
    input: Option<Tensor>,
    output: Option<Tensor>,
    batch: Option<usize>,
}

impl Dense {
    pub fn new(n_in: usize, n_out: usize, activation: Activation) -> Self {
        Self {
            n_in,
            n_out,
            activation,
            init: Init::for_activation(activation),
            input: None,
            output: None,
            batch: None,
        }
    }

    pub fn with_init(mut self, init: Init) -> Self {
        self.init = init;
        self
    }

    #[inline]
    pub fn n_in(&self) -> usize {
        self.n_in
    }

    #[inline]
    pub fn n_out(&self) -> usize {
        self.n_out
    }

    #[inline]
    fn w_len(&self) -> usize {
        self.n_in * self.n_out
    }
}

impl Layer for Dense {
    fn layer_type(&self) -> &'static str {
        "Dense"
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
        check_params(self.layer_type(), params, self.num_params())?;
        let (x, batch) = to_rows(&input.tensor, self.n_in)?;
        let w = tensor::matrix_view(&params[..self.w_len()], self.n_in, self.n_out, FlatOrder::ColumnMajor)?;

        let mut y = affine(&x, w, &params[self.w_len()..], ws)?;
        self.activation.apply(&mut y);

        if training {
            self.input = Some(x);
            self.output = Some(y.clone());
            self.batch = batch;
        }
        Ok(input.map_tensor(from_rows(y, batch, ws)?))
    }

    fn backprop_gradient(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        check_params(self.layer_type(), params, self.num_params())?;
        let (Some(x), Some(y)) = (&self.input, &self.output) else {
            return Err(Error::MissingInput(
                "dense backprop called without a training forward pass".to_owned(),
            ));
        };
        let eps = epsilon
            .activation_grad
            .ok_or_else(|| Error::MissingInput("dense backprop needs an output error".to_owned()))?;
        let (rows, _) = to_rows(&eps, self.n_out)?;
        let mut dz = ws.alloc(rows.shape())?;
        dz.assign(&rows);
        self.activation.backprop_inplace(y, &mut dz)?;

        let w = tensor::matrix_view(&params[..self.w_len()], self.n_in, self.n_out, FlatOrder::ColumnMajor)?;
        let grads = affine_backward(x, w, &dz, ws)?;
        ws.recycle(dz);

        let mut out = Gradients {
            activation_grad: Some(from_rows(grads.dx, self.batch, ws)?),
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
        self.output = None;
        self.batch = None;
    }

    fn box_clone(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
