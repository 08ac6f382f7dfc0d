//! Error types for ID and key parsing.

use thiserror::Error;

/// Errors that can occur when parsing identifiers or object keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has the wrong prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The object kind is not one the scheduler commits.
    #[error("unknown object kind: {0}")]
    UnknownKind(String),

    /// The object key does not have the expected shape.
    #[error("invalid object key '{key}': {message}")]
    InvalidKey { key: String, message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from parsing an object key.
    pub fn is_key_error(&self) -> bool {
        matches!(self, IdError::UnknownKind(_) | IdError::InvalidKey { .. })
    }
}
