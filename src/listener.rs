//! Training callbacks.

use std::fmt;

use crate::envelope::{Activations, GradientMap};

/// Hooks invoked by the training loop. Every method has an empty default.
pub trait TrainingListener: fmt::Debug + Send {
    fn on_epoch_start(&mut self, _epoch: u64) {}

    fn on_epoch_end(&mut self, _epoch: u64) {}

    /// Activations of every layer, network input first.
    fn on_forward_pass(&mut self, _activations: &[Activations]) {}

    fn on_backward_pass(&mut self, _gradients: &GradientMap) {}

    fn iteration_done(&mut self, _iteration: u64, _epoch: u64, _score: f32) {}
}

/// Logs the score every `frequency` iterations at `info` level.
#[derive(Debug, Clone)]
pub struct ScoreLogger {
    frequency: u64,
}

impl ScoreLogger {
    pub fn new(frequency: u64) -> Self {
        Self {
            frequency: frequency.max(1),
        }
    }
}

impl Default for ScoreLogger {
    fn default() -> Self {
        Self::new(10)
    }
}

impl TrainingListener for ScoreLogger {
    fn iteration_done(&mut self, iteration: u64, epoch: u64, score: f32) {
        if iteration % self.frequency == 0 {
            tracing::info!(iteration, epoch, score, "score");
        }
    }

    fn on_epoch_end(&mut self, epoch: u64) {
        tracing::debug!(epoch, "epoch finished");
    }
}
