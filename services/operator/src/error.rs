//! Error types for the reconcile loop.

use extop_api::{KeyError, ObjectKey};
use extop_reconcile::FingerprintError;
use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by a reconcile pass.
///
/// The loop never retries. Whoever invoked it decides whether and when to
/// try again, using [`ReconcileError::is_transient`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A store read or write failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The extension could not be rendered into a DaemonSet.
    #[error("failed to build desired daemonset: {0}")]
    Build(String),

    /// The extension has no uid, so ownership cannot be recorded.
    #[error("extension {0} has no uid; refusing to create an unowned daemonset")]
    MissingOwnerRef(ObjectKey),

    /// The invoking context was cancelled before a write was issued.
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Returns true if the same input may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Build(_) | Self::MissingOwnerRef(_) => false,
            Self::Cancelled => true,
        }
    }
}

impl From<FingerprintError> for ReconcileError {
    fn from(err: FingerprintError) -> Self {
        ReconcileError::Build(err.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(err: serde_json::Error) -> Self {
        ReconcileError::Build(err.to_string())
    }
}

impl From<KeyError> for ReconcileError {
    fn from(err: KeyError) -> Self {
        ReconcileError::Build(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ReconcileError::Cancelled.is_transient());
        assert!(ReconcileError::Store(StoreError::Conflict("rv".to_string())).is_transient());
        assert!(!ReconcileError::Store(StoreError::Invalid("bad".to_string())).is_transient());
        assert!(!ReconcileError::Build("bad".to_string()).is_transient());
        assert!(
            !ReconcileError::MissingOwnerRef(ObjectKey::new("ns", "ext")).is_transient()
        );
    }

    #[test]
    fn test_key_error_is_build_error() {
        let err: ReconcileError = KeyError::MissingField(".metadata.name").into();
        assert!(matches!(err, ReconcileError::Build(_)));
    }
}
