//! Errors raised while turning untrusted input into domain values.

use thiserror::Error;

/// Parse/validation failure for identifiers and enumerated domain values.
///
/// Infrastructure failures (storage, queue, network) have their own error
/// types in the crates that own them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Not a well-formed UUID for the named identifier type.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
