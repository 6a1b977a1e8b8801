//! Error types for the core crate.

use thiserror::Error;

/// Errors produced while parsing or validating core types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A reference string did not match any known lexical shape.
    #[error("invalid ref: {message}")]
    InvalidRef {
        /// Description of the malformed reference
        message: String,
    },

    /// A value had the right shape but violated a structural rule.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format violation
        message: String,
    },
}

impl CoreError {
    /// Builds an `InvalidRef` from anything displayable.
    pub fn invalid_ref(message: impl Into<String>) -> Self {
        CoreError::InvalidRef {
            message: message.into(),
        }
    }

    /// Builds an `InvalidFormat` from anything displayable.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        CoreError::InvalidFormat {
            message: message.into(),
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
