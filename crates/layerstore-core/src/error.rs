//! Error types for layerstore operations
//!
//! Every failing container operation returns a StoreError value. Nothing in
//! this crate panics on a missing or duplicate key.

use std::error::Error;
use std::fmt;

/// Layerstore error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `add` found the key(s) already present in local storage.
    /// The shadow chain is not consulted for this check.
    DuplicateKey,

    /// The key(s) are absent from local storage and from every shadow.
    KeyNotFound,

    /// `delete` targeted key(s) that only exist in a shadow.
    /// Shadows are read-only from the copy's point of view.
    CannotDeleteFromShadow,

    /// A Config failed validation
    InvalidConfig {
        /// Which parameter was rejected and why
        reason: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DuplicateKey => write!(f, "key already exists"),
            StoreError::KeyNotFound => write!(f, "key was not found"),
            StoreError::CannotDeleteFromShadow => write!(f, "cannot delete from shadow"),
            StoreError::InvalidConfig { reason } => write!(f, "invalid config: {}", reason),
        }
    }
}

impl Error for StoreError {}

/// Result type alias for layerstore operations
pub type StoreResult<T> = Result<T, StoreError>;
