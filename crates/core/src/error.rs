//! Domain error model.

use thiserror::Error;

/// Result type used by domain-level validation.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic, input-driven failures only. Storage failures belong to the
/// error types of each crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
