//! Update rules and cross-instance gradient sharing.
//!
//! An [`Updater`] turns the packed gradient buffer into the update that gets subtracted from
//! the parameters, in place. Its state (momentum, Adam moments) is one flat buffer laid out
//! like the parameters, exposed as a row vector so a trained network can be cloned with its
//! optimizer state intact.

use std::fmt;
use std::sync::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Tensor, tensor};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
/// Optimizer choice for training.
pub enum Optimizer {
    /// Plain SGD.
    #[default]
    Sgd,
    /// SGD with momentum.
    SgdMomentum { momentum: f32 },
    /// Adam (bias-corrected).
    Adam { beta1: f32, beta2: f32, eps: f32 },
}

impl Optimizer {
    /// Validate optimizer hyperparameters.
    pub fn validate(self) -> Result<()> {
        match self {
            Optimizer::Sgd => Ok(()),
            Optimizer::SgdMomentum { momentum } => {
                if !(momentum.is_finite() && (0.0..1.0).contains(&momentum)) {
                    return Err(Error::InvalidConfig(format!(
                        "momentum must be finite and in [0,1), got {momentum}"
                    )));
                }
                Ok(())
            }
            Optimizer::Adam { beta1, beta2, eps } => {
                if !(beta1.is_finite() && (0.0..1.0).contains(&beta1)) {
                    return Err(Error::InvalidConfig(format!(
                        "adam beta1 must be finite and in [0,1), got {beta1}"
                    )));
                }
                if !(beta2.is_finite() && (0.0..1.0).contains(&beta2)) {
                    return Err(Error::InvalidConfig(format!(
                        "adam beta2 must be finite and in [0,1), got {beta2}"
                    )));
                }
                if !(eps.is_finite() && eps > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "adam eps must be finite and > 0, got {eps}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Number of state values kept per parameter.
    fn state_per_param(self) -> usize {
        match self {
            Optimizer::Sgd => 0,
            Optimizer::SgdMomentum { .. } => 1,
            Optimizer::Adam { .. } => 2,
        }
    }
}

/// Learning rate as a function of the epoch counter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LrSchedule {
    #[default]
    Constant,
    /// `lr * gamma^(epoch / step_size)`.
    StepDecay { step_size: u64, gamma: f32 },
}

impl LrSchedule {
    pub fn validate(self) -> Result<()> {
        match self {
            LrSchedule::Constant => Ok(()),
            LrSchedule::StepDecay { step_size, gamma } => {
                if step_size == 0 {
                    return Err(Error::InvalidConfig("step_size must be > 0".to_owned()));
                }
                if !(gamma.is_finite() && gamma > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "gamma must be finite and > 0, got {gamma}"
                    )));
                }
                Ok(())
            }
        }
    }

    #[inline]
    pub fn lr_at(self, base: f32, epoch: u64) -> f32 {
        match self {
            LrSchedule::Constant => base,
            LrSchedule::StepDecay { step_size, gamma } => {
                let decays = (epoch / step_size).min(i32::MAX as u64) as i32;
                base * gamma.powi(decays)
            }
        }
    }
}

/// Update rule applied to the flat gradient buffer.
pub trait Updater: fmt::Debug + Send {
    /// Overwrite `gradient` with the update to subtract from the parameters.
    fn update(&mut self, gradient: &mut [f32], iteration: u64, epoch: u64) -> Result<()>;

    /// Rule state as a `[1, n]` row vector (`[1, 0]` for stateless rules).
    fn state_view(&self) -> Tensor;

    fn set_state_view(&mut self, state: &Tensor) -> Result<()>;

    fn box_clone(&self) -> Box<dyn Updater>;
}

impl Clone for Box<dyn Updater> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// The built-in updater for [`Optimizer`].
#[derive(Debug, Clone)]
pub struct OptimizerUpdater {
    optimizer: Optimizer,
    lr: f32,
    schedule: LrSchedule,
    num_params: usize,
    // Momentum: [v]; Adam: [m, v].
    state: Vec<f32>,
}

impl OptimizerUpdater {
    pub fn new(optimizer: Optimizer, lr: f32, schedule: LrSchedule, num_params: usize) -> Result<Self> {
        optimizer.validate()?;
        schedule.validate()?;
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::InvalidConfig("lr must be finite and > 0".to_owned()));
        }
        Ok(Self {
            optimizer,
            lr,
            schedule,
            num_params,
            state: vec![0.0; optimizer.state_per_param() * num_params],
        })
    }

    #[inline]
    pub fn optimizer(&self) -> Optimizer {
        self.optimizer
    }

    #[inline]
    pub fn lr(&self) -> f32 {
        self.lr
    }
}

impl Updater for OptimizerUpdater {
    fn update(&mut self, gradient: &mut [f32], iteration: u64, epoch: u64) -> Result<()> {
        if gradient.len() != self.num_params {
            return Err(Error::ShapeMismatch(format!(
                "updater sized for {} parameters, got {}",
                self.num_params,
                gradient.len()
            )));
        }
        let lr = self.schedule.lr_at(self.lr, epoch);

        match self.optimizer {
            Optimizer::Sgd => {
                for g in gradient.iter_mut() {
                    *g *= lr;
                }
            }
            Optimizer::SgdMomentum { momentum } => {
                for (v, g) in self.state.iter_mut().zip(gradient.iter_mut()) {
                    *v = momentum * *v + *g;
                    *g = lr * *v;
                }
            }
            Optimizer::Adam { beta1, beta2, eps } => {
                // Bias correction uses the 1-based step number.
                let t = (iteration + 1).min(i32::MAX as u64) as i32;
                let corr1 = 1.0 - beta1.powi(t);
                let corr2 = 1.0 - beta2.powi(t);
                let (m, v) = self.state.split_at_mut(self.num_params);
                for i in 0..gradient.len() {
                    let g = gradient[i];
                    m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                    v[i] = beta2 * v[i] + (1.0 - beta2) * (g * g);

                    let m_hat = m[i] / corr1;
                    let v_hat = v[i] / corr2;
                    gradient[i] = lr * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }
        Ok(())
    }

    fn state_view(&self) -> Tensor {
        tensor::row_vector(&self.state)
    }

    fn set_state_view(&mut self, state: &Tensor) -> Result<()> {
        if !tensor::is_row_vector(state) || state.len() != self.state.len() {
            return Err(Error::ShapeMismatch(format!(
                "updater state must be [1, {}], got {:?}",
                self.state.len(),
                state.shape()
            )));
        }
        for (dst, src) in self.state.iter_mut().zip(state.iter()) {
            *dst = *src;
        }
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Updater> {
        Box::new(self.clone())
    }
}

/// Exchange of updates between network instances training the same model.
///
/// Each instance registers once and gets a party id. After computing its own update it
/// publishes it with [`store_update`](Self::store_update) and then folds in everything the
/// other parties published since its last call with [`apply_update`](Self::apply_update).
///
/// Mixing a network attached to an accumulator with standalone training of the same
/// parameters is not supported: updates would be applied twice.
pub trait GradientsAccumulator: fmt::Debug + Send + Sync {
    /// Length of the updates this accumulator exchanges.
    fn num_params(&self) -> usize;

    fn register(&self) -> Result<usize>;

    fn store_update(&self, party: usize, update: &[f32]) -> Result<()>;

    /// Add pending updates from other parties into `update` and clear them.
    fn apply_update(&self, party: usize, update: &mut [f32]) -> Result<()>;
}

/// In-process [`GradientsAccumulator`] keeping one pending sum per party behind a mutex.
#[derive(Debug)]
pub struct SharedGradientsAccumulator {
    len: usize,
    pending: Mutex<Vec<Vec<f32>>>,
}

impl SharedGradientsAccumulator {
    pub fn new(num_params: usize) -> Self {
        Self {
            len: num_params,
            pending: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.len {
            return Err(Error::ShapeMismatch(format!(
                "accumulator holds {} values, got {got}",
                self.len
            )));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<f32>>>> {
        self.pending
            .lock()
            .map_err(|_| Error::Concurrency("gradient accumulator lock poisoned".to_owned()))
    }
}

impl GradientsAccumulator for SharedGradientsAccumulator {
    fn num_params(&self) -> usize {
        self.len
    }

    fn register(&self) -> Result<usize> {
        let mut pending = self.lock()?;
        pending.push(vec![0.0; self.len]);
        Ok(pending.len() - 1)
    }

    fn store_update(&self, party: usize, update: &[f32]) -> Result<()> {
        self.check_len(update.len())?;
        let mut pending = self.lock()?;
        if party >= pending.len() {
            return Err(Error::index("accumulator party", party, pending.len()));
        }
        for (other, queue) in pending.iter_mut().enumerate() {
            if other == party {
                continue;
            }
            for (q, u) in queue.iter_mut().zip(update) {
                *q += *u;
            }
        }
        Ok(())
    }

    fn apply_update(&self, party: usize, update: &mut [f32]) -> Result<()> {
        self.check_len(update.len())?;
        let mut pending = self.lock()?;
        let len = pending.len();
        let queue = pending
            .get_mut(party)
            .ok_or_else(|| Error::index("accumulator party", party, len))?;
        for (u, q) in update.iter_mut().zip(queue.iter_mut()) {
            *u += *q;
            *q = 0.0;
        }
        Ok(())
    }
}
