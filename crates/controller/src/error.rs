//! Error types for the controller crate.

use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Controller error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Workers did not drain within the shutdown grace period.
    #[error("shutdown grace period of {grace_secs}s exceeded")]
    ShutdownTimeout { grace_secs: u64 },
}

impl Error {
    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_config("workers must be positive");
        assert!(err.to_string().contains("workers must be positive"));

        let err = Error::ShutdownTimeout { grace_secs: 30 };
        assert!(err.to_string().contains("30"));
    }
}
