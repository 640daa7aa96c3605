//! Error types for the core crate.

use std::fmt;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Clone)]
pub enum Error {
    /// Object store operation failed.
    StoreFailed { operation: String, reason: String },
    /// Object already exists.
    ObjectExists { key: String },
    /// Object not found.
    ObjectNotFound { key: String },
    /// Invalid object data.
    InvalidObject { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreFailed { operation, reason } => {
                write!(f, "object store operation '{operation}' failed: {reason}")
            }
            Self::ObjectExists { key } => {
                write!(f, "object '{key}' already exists")
            }
            Self::ObjectNotFound { key } => {
                write!(f, "object '{key}' not found")
            }
            Self::InvalidObject { reason } => {
                write!(f, "invalid object: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an object exists error.
    pub fn object_exists(key: impl Into<String>) -> Self {
        Self::ObjectExists { key: key.into() }
    }

    /// Create an object not found error.
    pub fn object_not_found(key: impl Into<String>) -> Self {
        Self::ObjectNotFound { key: key.into() }
    }

    /// Create an invalid object error.
    pub fn invalid_object(reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            reason: reason.into(),
        }
    }
}
