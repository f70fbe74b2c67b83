//! Error types

use thiserror::Error;

/// Invalid options or arguments, reported before any item is touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be a positive integer, got {value}")]
    InvalidBound { field: &'static str, value: usize },

    #[error("{field} of {value_ms}ms is too large")]
    IntervalTooLarge { field: &'static str, value_ms: u64 },
}

/// Failure of a one-shot operation: either the options were rejected or a task failed
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task failed: {0}")]
    Task(E),
}

impl<E> Error<E> {
    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Get the task error, if the task is what failed
    pub fn into_task(self) -> Option<E> {
        match self {
            Error::Task(e) => Some(e),
            Error::Config(_) => None,
        }
    }
}

/// Reject a size or concurrency bound below one
pub(crate) fn check_bound(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidBound { field, value });
    }
    Ok(value)
}

/// Reject an interval the monotonic clock cannot represent
pub(crate) fn check_interval(field: &'static str, value_ms: u64) -> Result<u64, ConfigError> {
    // tokio's timer wheel tops out at roughly two years
    const MAX_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1000;
    if value_ms > MAX_INTERVAL_MS {
        return Err(ConfigError::IntervalTooLarge { field, value_ms });
    }
    Ok(value_ms)
}
