//! Error types for object identity parsing.

use thiserror::Error;

/// Errors that can occur when deriving or parsing an object key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("object key cannot be empty")]
    Empty,

    /// The key is missing the `/` separator.
    #[error("object key missing '/' separator: {0}")]
    MissingSeparator(String),

    /// The object lacks a metadata field needed for identity.
    #[error("object is missing {0}")]
    MissingField(&'static str),
}

impl KeyError {
    /// Returns true if the object itself was incomplete (as opposed to a bad string).
    pub fn is_missing_field(&self) -> bool {
        matches!(self, KeyError::MissingField(_))
    }
}
