use thiserror::Error;

/// Errors raised by the engine.
///
/// Everything except [`Error::UnsupportedConfiguration`] is fatal for the call that
/// produced it. `UnsupportedConfiguration` marks a legitimate partial setup (no terminal
/// loss layer, non time-series input handed to truncated BPTT, ...); the engine logs it
/// and turns the operation into a no-op instead of failing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid index: {0}")]
    InvalidIndex(String),
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("missing labels: no labels were set before the output layer was asked for gradients")]
    MissingLabels,
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid parameter key {0:?}: expected \"<layer>_<name>\"")]
    InvalidParamKey(String),
    #[error("workspace {name} overflow: requested {requested} elements with {available} available")]
    WorkspaceOverflow {
        name: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("concurrency: {0}")]
    Concurrency(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the engine treats this error as a soft no-op.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::UnsupportedConfiguration(_))
    }

    pub(crate) fn index(what: &str, index: usize, len: usize) -> Self {
        Error::InvalidIndex(format!("{what} {index} out of range for length {len}"))
    }
}

/// Downgrades a recoverable error into a logged no-op.
///
/// This is the only place that decides between "warn and return nothing" and
/// "propagate"; both backward entry points and truncated BPTT route through it.
pub(crate) fn soften<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_recoverable() => {
            tracing::warn!(error = %err, "operation skipped");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unsupported_configuration_is_recoverable() {
        assert!(Error::UnsupportedConfiguration("x".to_owned()).is_recoverable());
        assert!(!Error::MissingLabels.is_recoverable());
        assert!(!Error::ShapeMismatch("x".to_owned()).is_recoverable());
    }

    #[test]
    fn soften_passes_values_and_fatal_errors_through() {
        assert_eq!(soften(Ok(3)).unwrap(), Some(3));
        assert_eq!(
            soften::<()>(Err(Error::UnsupportedConfiguration("no output layer".to_owned())))
                .unwrap(),
            None
        );
        assert_eq!(soften::<()>(Err(Error::MissingLabels)), Err(Error::MissingLabels));
    }
}
