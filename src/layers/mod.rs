//! Built-in layers.
//!
//! The engine only relies on the [`Layer`](crate::Layer) contract; these are the reference
//! implementations used by the builder, tests, benches and demos.
//!
//! Weight matrices are `[n_in, n_out]` stored column-major (`f` order), biases are
//! `[1, n_out]` row-major. Dense-style layers accept `[batch, n_in]` or time series
//! `[batch, n_in, time]`; a time series is folded to one row per (example, step) and
//! unfolded again on the way out.

mod activation_layer;
mod dense;
mod output;
mod rnn;

pub use activation_layer::ActivationLayer;
pub use dense::Dense;
pub use output::LossOutput;
pub use rnn::SimpleRnn;

use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Ix2};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

use crate::workspace::Workspace;
use crate::{Activation, Error, Result, Tensor, tensor};

/// Weight initialization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// Xavier/Glorot uniform; suits `tanh`, `sigmoid` and `identity`.
    Xavier,
    /// He/Kaiming uniform; suits `relu` and `leaky relu`.
    He,
}

impl Init {
    pub fn for_activation(act: Activation) -> Self {
        match act {
            Activation::Tanh | Activation::Sigmoid | Activation::Identity => Init::Xavier,
            Activation::ReLU | Activation::LeakyReLU { .. } => Init::He,
        }
    }

    pub(crate) fn fill(self, fan_in: usize, fan_out: usize, out: &mut [f32], rng: &mut StdRng) {
        let limit = match self {
            Init::Xavier => (6.0 / (fan_in + fan_out).max(1) as f32).sqrt(),
            Init::He => (6.0 / fan_in.max(1) as f32).sqrt(),
        };
        let dist = Uniform::new_inclusive(-limit, limit);
        for w in out.iter_mut() {
            *w = dist.sample(rng);
        }
    }
}

/// Rows view of an activation: rank 2 as is, rank 3 folded.
///
/// Returns the batch size when folding happened.
pub(crate) fn to_rows(t: &Tensor, n_cols: usize) -> Result<(Tensor, Option<usize>)> {
    let (rows, batch) = match t.ndim() {
        2 => (t.clone(), None),
        3 => (tensor::fold_time(t)?, Some(t.shape()[0])),
        n => {
            return Err(Error::ShapeMismatch(format!(
                "expected [batch, features] or [batch, features, time], got rank {n}"
            )));
        }
    };
    if rows.shape()[1] != n_cols {
        return Err(Error::ShapeMismatch(format!(
            "expected {n_cols} features, got shape {:?}",
            t.shape()
        )));
    }
    Ok((rows, batch))
}

/// Undo [`to_rows`].
pub(crate) fn from_rows(t: Tensor, batch: Option<usize>, ws: &mut Workspace) -> Result<Tensor> {
    match batch {
        Some(b) => ws.adopt(tensor::unfold_time(&t, b)?),
        None => Ok(t),
    }
}

/// `x W + b` into an arena tensor.
pub(crate) fn affine(
    x: &Tensor,
    w: ArrayView2<'_, f32>,
    b: &[f32],
    ws: &mut Workspace,
) -> Result<Tensor> {
    let x2 = tensor::as_matrix(x)?;
    let mut out = ws.alloc(&[x2.nrows(), w.ncols()])?;
    {
        let mut o = out
            .view_mut()
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        general_mat_mul(1.0, &x2, &w, 0.0, &mut o);
        o += &ArrayView1::from(b);
    }
    Ok(out)
}

/// Parameter and input gradients of `y = x W + b` given `dz = dL/d(x W + b)`.
pub(crate) struct AffineGrads {
    pub dw: Tensor,
    pub db: Tensor,
    pub dx: Tensor,
}

pub(crate) fn affine_backward(
    x: &Tensor,
    w: ArrayView2<'_, f32>,
    dz: &Tensor,
    ws: &mut Workspace,
) -> Result<AffineGrads> {
    let x2 = tensor::as_matrix(x)?;
    let dz2 = tensor::as_matrix(dz)?;
    if x2.nrows() != dz2.nrows() || dz2.ncols() != w.ncols() {
        return Err(Error::ShapeMismatch(format!(
            "gradient {:?} does not fit input {:?} and weights {:?}",
            dz2.dim(),
            x2.dim(),
            w.dim()
        )));
    }

    let mut dw = ws.alloc(&[w.nrows(), w.ncols()])?;
    let mut dx = ws.alloc(&[x2.nrows(), w.nrows()])?;
    {
        let mut dw2 = as_matrix_mut(&mut dw)?;
        general_mat_mul(1.0, &x2.t(), &dz2, 0.0, &mut dw2);
    }
    {
        let mut dx2 = as_matrix_mut(&mut dx)?;
        general_mat_mul(1.0, &dz2, &w.t(), 0.0, &mut dx2);
    }
    let db = sum_rows(dz2, ws)?;
    Ok(AffineGrads { dw, db, dx })
}

/// Column sums as a `[1, n]` arena tensor.
pub(crate) fn sum_rows(m: ArrayView2<'_, f32>, ws: &mut Workspace) -> Result<Tensor> {
    let mut db = ws.alloc(&[1, m.ncols()])?;
    db.index_axis_mut(Axis(0), 0).assign(&m.sum_axis(Axis(0)));
    Ok(db)
}

pub(crate) fn as_matrix_mut(t: &mut Tensor) -> Result<ndarray::ArrayViewMut2<'_, f32>> {
    t.view_mut()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

pub(crate) fn matrix_tensor(m: Array2<f32>) -> Tensor {
    m.into_dyn().into_shared()
}

pub(crate) fn check_params(layer: &str, params: &[f32], expected: usize) -> Result<()> {
    if params.len() != expected {
        return Err(Error::ShapeMismatch(format!(
            "{layer} expects {expected} parameters, got {}",
            params.len()
        )));
    }
    Ok(())
}
