//! Network configuration.
//!
//! With the `serde` feature the configuration round-trips through JSON; missing fields take
//! their [`Default`] values.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serde")]
use std::path::Path;

use crate::optim::{LrSchedule, Optimizer};
use crate::workspace::{CacheMode, WorkspaceMode};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BackpropType {
    #[default]
    Standard,
    /// Split time series into segments of `tbptt_fwd_length` steps.
    TruncatedBptt,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NetworkConfig {
    /// Seed for parameter initialization.
    pub seed: u64,
    pub backprop: bool,
    pub pretrain: bool,
    pub backprop_type: BackpropType,
    pub tbptt_fwd_length: usize,
    pub tbptt_back_length: usize,
    pub training_workspace_mode: WorkspaceMode,
    pub inference_workspace_mode: WorkspaceMode,
    pub cache_mode: CacheMode,
    pub optimizer: Optimizer,
    pub lr: f32,
    pub lr_schedule: LrSchedule,
    /// Iterations completed so far; advanced by every parameter update.
    pub iteration_count: u64,
    /// Epochs completed so far.
    pub epoch_count: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            backprop: true,
            pretrain: false,
            backprop_type: BackpropType::Standard,
            tbptt_fwd_length: 20,
            tbptt_back_length: 20,
            training_workspace_mode: WorkspaceMode::Separate,
            inference_workspace_mode: WorkspaceMode::Separate,
            cache_mode: CacheMode::None,
            optimizer: Optimizer::Sgd,
            lr: 1e-2,
            lr_schedule: LrSchedule::Constant,
            iteration_count: 0,
            epoch_count: 0,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        self.lr_schedule.validate()?;
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "lr must be finite and > 0, got {}",
                self.lr
            )));
        }
        if self.backprop_type == BackpropType::TruncatedBptt {
            if self.tbptt_fwd_length == 0 || self.tbptt_back_length == 0 {
                return Err(Error::InvalidConfig(
                    "tbptt forward and backward lengths must be > 0".to_owned(),
                ));
            }
            if self.tbptt_back_length > self.tbptt_fwd_length {
                return Err(Error::InvalidConfig(format!(
                    "tbptt backward length {} exceeds forward length {}",
                    self.tbptt_back_length, self.tbptt_fwd_length
                )));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_tbptt(&self) -> bool {
        self.backprop_type == BackpropType::TruncatedBptt
    }
}

#[cfg(feature = "serde")]
impl NetworkConfig {
    pub fn to_json_string_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidData(format!("failed to serialize config: {e}")))
    }

    /// Parse and validate a configuration.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: NetworkConfig = serde_json::from_str(s)
            .map_err(|e| Error::InvalidData(format!("failed to parse config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let s = self.to_json_string_pretty()?;
        let p = path.as_ref();
        std::fs::write(p, s)
            .map_err(|e| Error::InvalidData(format!("failed to write {}: {e}", p.display())))
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::InvalidData(format!("failed to read {}: {e}", p.display())))?;
        Self::from_json_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tbptt_lengths_are_checked_only_for_tbptt() {
        let mut cfg = NetworkConfig {
            tbptt_fwd_length: 0,
            ..NetworkConfig::default()
        };
        assert!(cfg.validate().is_ok());
        cfg.backprop_type = BackpropType::TruncatedBptt;
        assert!(cfg.validate().is_err());
        cfg.tbptt_fwd_length = 10;
        cfg.tbptt_back_length = 20;
        assert!(cfg.validate().is_err());
        cfg.tbptt_back_length = 5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_learning_rate() {
        let cfg = NetworkConfig {
            lr: -1.0,
            ..NetworkConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = NetworkConfig::from_json_str(
            r#"{ "seed": 7, "backprop_type": "TruncatedBptt", "tbptt_fwd_length": 4, "tbptt_back_length": 2 }"#,
        )
        .unwrap();
        assert_eq!(cfg.seed, 7);
        assert!(cfg.is_tbptt());
        assert_eq!(cfg.lr, NetworkConfig::default().lr);

        let back = NetworkConfig::from_json_str(&cfg.to_json_string_pretty().unwrap()).unwrap();
        assert_eq!(back, cfg);
        assert!(NetworkConfig::from_json_str("{ \"lr\": 0.0 }").is_err());
    }
}
