use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, ArrayView2, Axis, Ix2, Zip};
use rand::rngs::StdRng;

use super::{Init, check_params, matrix_tensor};
use crate::envelope::{Activations, FlatOrder, Gradients};
use crate::layer::{Layer, RecurrentLayer, RnnState};
use crate::params::ParamSpec;
use crate::workspace::Workspace;
use crate::{Activation, Error, Result, Tensor, tensor};

const STATE_KEY: &str = "h";

/// Elman recurrent layer: `h_t = m_t * activation(x_t W + h_{t-1} RW + b)`.
///
/// Input is `[batch, n_in, time]`; a `[batch, n_in]` input is a single step and comes back as
/// `[batch, n_out]`. An active `[batch, time]` mask zeroes masked steps, which also resets the
/// carried state for that example.
#[derive(Debug, Clone)]
pub struct SimpleRnn {
    n_in: usize,
    n_out: usize,
    activation: Activation,
    init: Init,
    state: RnnState,
    tbptt_state: RnnState,
    cache: Option<Cache>,
}

#[derive(Debug, Clone)]
struct Cache {
    input: Tensor,
    output: Tensor,
    h0: Tensor,
    mask: Option<Tensor>,
    single_step: bool,
}

struct Run {
    input: Tensor,
    output: Tensor,
    h0: Tensor,
    mask: Option<Tensor>,
    single_step: bool,
}

impl Run {
    fn last_state(&self) -> Tensor {
        let steps = self.output.shape()[2];
        self.output
            .index_axis(Axis(2), steps - 1)
            .to_owned()
            .into_shared()
    }
}

fn matrix<'a>(view: ndarray::ArrayViewD<'a, f32>) -> Result<ArrayView2<'a, f32>> {
    view.into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

impl SimpleRnn {
    pub fn new(n_in: usize, n_out: usize, activation: Activation) -> Self {
        Self {
            n_in,
            n_out,
            activation,
            init: Init::for_activation(activation),
            state: RnnState::new(),
            tbptt_state: RnnState::new(),
            cache: None,
        }
    }

    pub fn with_init(mut self, init: Init) -> Self {
        self.init = init;
        self
    }

    #[inline]
    fn w_len(&self) -> usize {
        self.n_in * self.n_out
    }

    #[inline]
    fn rw_len(&self) -> usize {
        self.n_out * self.n_out
    }

    fn weights<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView2<'a, f32>, &'a [f32])> {
        let (w, rest) = params.split_at(self.w_len());
        let (rw, b) = rest.split_at(self.rw_len());
        Ok((
            tensor::matrix_view(w, self.n_in, self.n_out, FlatOrder::ColumnMajor)?,
            tensor::matrix_view(rw, self.n_out, self.n_out, FlatOrder::ColumnMajor)?,
            b,
        ))
    }

    /// Run every step of `input` starting from `h0` (zeros when `None`).
    fn run(
        &self,
        params: &[f32],
        input: &Activations,
        h0: Option<&Tensor>,
        ws: &mut Workspace,
    ) -> Result<Run> {
        check_params(self.layer_type(), params, self.num_params())?;
        let single_step = input.tensor.ndim() == 2;
        let x = if single_step {
            input.tensor.clone().insert_axis(Axis(2))
        } else {
            input.tensor.clone()
        };
        let (batch, n_in, steps) = tensor::dims3(&x)?;
        if n_in != self.n_in {
            return Err(Error::ShapeMismatch(format!(
                "expected {} features, got shape {:?}",
                self.n_in,
                input.tensor.shape()
            )));
        }
        if steps == 0 {
            return Err(Error::InvalidData("time series has no steps".to_owned()));
        }

        let h0 = match h0 {
            Some(h) if h.shape() == [batch, self.n_out] => h.clone(),
            Some(h) => {
                return Err(Error::ShapeMismatch(format!(
                    "stored state {:?} does not match a batch of {batch}",
                    h.shape()
                )));
            }
            None => tensor::zeros(&[batch, self.n_out]),
        };
        let mask = match &input.mask {
            Some(m) if input.mask_is_active() => {
                if m.shape() != [batch, steps] {
                    return Err(Error::ShapeMismatch(format!(
                        "mask {:?} does not match [{batch}, {steps}]",
                        m.shape()
                    )));
                }
                Some(m.clone())
            }
            _ => None,
        };

        let (w, rw, b) = self.weights(params)?;
        let mut output = ws.alloc(&[batch, self.n_out, steps])?;
        let mut h = tensor::as_matrix(&h0)?.to_owned();
        for t in 0..steps {
            let mut z = Array2::from_shape_fn((batch, self.n_out), |(_, j)| b[j]);
            general_mat_mul(1.0, &matrix(x.index_axis(Axis(2), t))?, &w, 1.0, &mut z);
            general_mat_mul(1.0, &h, &rw, 1.0, &mut z);
            z.mapv_inplace(|v| self.activation.forward(v));
            if let Some(m) = &mask {
                for (r, mut row) in z.rows_mut().into_iter().enumerate() {
                    row *= m[[r, t]];
                }
            }
            output.index_axis_mut(Axis(2), t).assign(&z);
            h = z;
        }

        Ok(Run {
            input: x,
            output,
            h0,
            mask,
            single_step,
        })
    }

    fn finish(&mut self, run: Run, input: &Activations, training: bool) -> Activations {
        let out = if run.single_step {
            tensor::squeeze_time(run.output.clone())
        } else {
            run.output.clone()
        };
        if training {
            self.cache = Some(Cache {
                input: run.input,
                output: run.output,
                h0: run.h0,
                mask: run.mask,
                single_step: run.single_step,
            });
        }
        input.map_tensor(out)
    }

    fn backprop_steps(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        back_length: Option<usize>,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        check_params(self.layer_type(), params, self.num_params())?;
        let cache = self.cache.as_ref().ok_or_else(|| {
            Error::MissingInput("rnn backprop called without a training forward pass".to_owned())
        })?;
        let eps = epsilon
            .activation_grad
            .ok_or_else(|| Error::MissingInput("rnn backprop needs an output error".to_owned()))?;
        let eps = if eps.ndim() == 2 && cache.single_step {
            eps.insert_axis(Axis(2))
        } else {
            eps
        };
        if eps.shape() != cache.output.shape() {
            return Err(Error::ShapeMismatch(format!(
                "gradient {:?} does not match output {:?}",
                eps.shape(),
                cache.output.shape()
            )));
        }

        let (batch, _, steps) = tensor::dims3(&cache.output)?;
        let end = back_length.map_or(0, |k| steps.saturating_sub(k));
        let (w, rw, _) = self.weights(params)?;

        let mut dw = Array2::<f32>::zeros((self.n_in, self.n_out));
        let mut drw = Array2::<f32>::zeros((self.n_out, self.n_out));
        let mut db = Array1::<f32>::zeros(self.n_out);
        let mut dx = ws.alloc(&[batch, self.n_in, steps])?;
        let mut dh_next = Array2::<f32>::zeros((batch, self.n_out));

        for t in (end..steps).rev() {
            let mut dh = matrix(eps.index_axis(Axis(2), t))?.to_owned();
            dh += &dh_next;
            if let Some(m) = &cache.mask {
                for (r, mut row) in dh.rows_mut().into_iter().enumerate() {
                    row *= m[[r, t]];
                }
            }
            Zip::from(&mut dh)
                .and(&matrix(cache.output.index_axis(Axis(2), t))?)
                .for_each(|d, &y| *d *= self.activation.grad_from_output(y));

            let h_prev = if t == 0 {
                tensor::as_matrix(&cache.h0)?
            } else {
                matrix(cache.output.index_axis(Axis(2), t - 1))?
            };
            general_mat_mul(1.0, &matrix(cache.input.index_axis(Axis(2), t))?.t(), &dh, 1.0, &mut dw);
            general_mat_mul(1.0, &h_prev.t(), &dh, 1.0, &mut drw);
            db += &dh.sum_axis(Axis(0));

            let mut dx_t = dx
                .index_axis_mut(Axis(2), t)
                .into_dimensionality::<Ix2>()
                .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
            general_mat_mul(1.0, &dh, &w.t(), 0.0, &mut dx_t);
            dh_next = dh.dot(&rw.t());
        }

        let dx = if cache.single_step {
            tensor::squeeze_time(dx)
        } else {
            dx
        };
        let mut out = Gradients {
            activation_grad: Some(dx),
            mask: epsilon.mask,
            mask_state: epsilon.mask_state,
            ..Gradients::default()
        };
        out.params.push("W", ws.adopt(matrix_tensor(dw))?, FlatOrder::ColumnMajor);
        out.params.push("RW", ws.adopt(matrix_tensor(drw))?, FlatOrder::ColumnMajor);
        out.params.push(
            "b",
            ws.adopt(db.insert_axis(Axis(0)).into_dyn().into_shared())?,
            FlatOrder::RowMajor,
        );
        Ok(out)
    }
}

impl Layer for SimpleRnn {
    fn layer_type(&self) -> &'static str {
        "SimpleRnn"
    }

    fn param_specs(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("W", &[self.n_in, self.n_out], FlatOrder::ColumnMajor),
            ParamSpec::new("RW", &[self.n_out, self.n_out], FlatOrder::ColumnMajor),
            ParamSpec::new("b", &[1, self.n_out], FlatOrder::RowMajor),
        ]
    }

    fn init_params(&self, params: &mut [f32], rng: &mut StdRng) {
        let (w, rest) = params.split_at_mut(self.w_len());
        let (rw, b) = rest.split_at_mut(self.rw_len());
        self.init.fill(self.n_in, self.n_out, w, rng);
        self.init.fill(self.n_out, self.n_out, rw, rng);
        b.fill(0.0);
    }

    /// Starts from a zero state; stored state is neither read nor written.
    fn activate(
        &mut self,
        params: &[f32],
        input: Activations,
        training: bool,
        ws: &mut Workspace,
    ) -> Result<Activations> {
        let run = self.run(params, &input, None, ws)?;
        Ok(self.finish(run, &input, training))
    }

    fn backprop_gradient(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        self.backprop_steps(params, epsilon, None, ws)
    }

    fn clear(&mut self) {
        self.cache = None;
    }

    fn box_clone(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

impl RecurrentLayer for SimpleRnn {
    fn rnn_time_step(
        &mut self,
        params: &[f32],
        input: Activations,
        ws: &mut Workspace,
    ) -> Result<Activations> {
        let run = self.run(params, &input, self.state.get(STATE_KEY), ws)?;
        self.state.insert(STATE_KEY, run.last_state());
        Ok(self.finish(run, &input, false))
    }

    fn rnn_activate_using_stored_state(
        &mut self,
        params: &[f32],
        input: Activations,
        training: bool,
        store_last_for_tbptt: bool,
        ws: &mut Workspace,
    ) -> Result<Activations> {
        let run = self.run(params, &input, self.state.get(STATE_KEY), ws)?;
        if store_last_for_tbptt {
            self.tbptt_state.insert(STATE_KEY, run.last_state());
        }
        Ok(self.finish(run, &input, training))
    }

    fn rnn_get_previous_state(&self) -> RnnState {
        self.state.clone()
    }

    fn rnn_set_previous_state(&mut self, state: RnnState) {
        self.state = state;
    }

    fn rnn_clear_previous_state(&mut self) {
        self.state = RnnState::new();
        self.tbptt_state = RnnState::new();
    }

    fn rnn_get_tbptt_state(&self) -> RnnState {
        self.tbptt_state.clone()
    }

    fn rnn_set_tbptt_state(&mut self, state: RnnState) {
        self.tbptt_state = state;
    }

    fn tbptt_backprop_gradient(
        &mut self,
        params: &[f32],
        epsilon: Gradients,
        back_length: usize,
        ws: &mut Workspace,
    ) -> Result<Gradients> {
        self.backprop_steps(params, epsilon, Some(back_length), ws)
    }

    fn box_clone_recurrent(&self) -> Box<dyn RecurrentLayer> {
        Box::new(self.clone())
    }
}
