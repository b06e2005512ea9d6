//! Element-wise activation functions used by the built-in layers.
//!
//! Layers cache their *post-activation* output `y` and compute `dL/dz` from `dL/dy` using
//! only `y`, so no separate pre-activation buffer has to survive until the backward pass.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use ndarray::Zip;

use crate::{Error, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Activation {
    #[default]
    Tanh,
    ReLU,
    LeakyReLU {
        alpha: f32,
    },
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn validate(self) -> Result<()> {
        if let Activation::LeakyReLU { alpha } = self {
            if !(alpha.is_finite() && alpha >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "leaky ReLU alpha must be finite and >= 0, got {alpha}"
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn forward(self, x: f32) -> f32 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU { alpha } if x <= 0.0 => alpha * x,
            Activation::LeakyReLU { .. } | Activation::Identity => x,
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// dy/dz expressed through the output `y`.
    #[inline]
    pub fn grad_from_output(self, y: f32) -> f32 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::ReLU if y > 0.0 => 1.0,
            Activation::ReLU => 0.0,
            Activation::LeakyReLU { alpha } if y <= 0.0 => alpha,
            Activation::LeakyReLU { .. } | Activation::Identity => 1.0,
            Activation::Sigmoid => y * (1.0 - y),
        }
    }

    /// Apply in place to every element.
    pub fn apply(self, t: &mut Tensor) {
        if self != Activation::Identity {
            t.mapv_inplace(|x| self.forward(x));
        }
    }

    /// Overwrite `eps` (dL/dy) with dL/dz, given the cached output `y`.
    pub fn backprop_inplace(self, y: &Tensor, eps: &mut Tensor) -> Result<()> {
        if y.shape() != eps.shape() {
            return Err(Error::ShapeMismatch(format!(
                "activation output {:?} and gradient {:?} differ",
                y.shape(),
                eps.shape()
            )));
        }
        if self != Activation::Identity {
            Zip::from(eps).and(y).for_each(|e, &out| *e *= self.grad_from_output(out));
        }
        Ok(())
    }
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    // Numerically stable sigmoid.
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}
