//! Common error types for the chat gateway crates.

use thiserror::Error;

/// Errors raised when constructing a typed identifier from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// The value was empty or whitespace only.
    #[error("{kind} must not be empty")]
    Empty {
        /// Identifier kind, e.g. "user id".
        kind: &'static str,
    },

    /// The value exceeded the maximum identifier length.
    #[error("{kind} exceeds {max} characters")]
    TooLong {
        /// Identifier kind.
        kind: &'static str,
        /// Maximum allowed length.
        max: usize,
    },

    /// The value contained characters outside `[A-Za-z0-9_-]`.
    #[error("{kind} contains invalid characters")]
    InvalidCharacters {
        /// Identifier kind.
        kind: &'static str,
    },
}

/// Result type alias using `IdentifierError`
pub type Result<T> = std::result::Result<T, IdentifierError>;
