//! Resource store interface.
//!
//! The store is the only way the operator touches cluster state:
//! - Read the `Extension` being reconciled
//! - Read, create and replace its DaemonSet
//!
//! `KubeStore` talks to the API server. `MemoryStore` keeps everything in
//! process and is used for tests and local runs.

mod kube_store;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use extop_api::{Extension, ObjectKey};
use k8s_openapi::api::apps::v1::DaemonSet;
use thiserror::Error;

pub use self::kube_store::KubeStore;
pub use self::memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    /// The write lost a race with another writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A create found the object already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The store rejected the object itself.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other API server error.
    #[error("api error: {0}")]
    Api(#[source] kube::Error),
}

impl StoreError {
    /// Returns true for the distinguished "does not exist" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

/// Access to the objects the operator reconciles.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch an extension by key.
    async fn get_extension(&self, key: &ObjectKey) -> StoreResult<Extension>;

    /// Fetch the DaemonSet with the given key.
    async fn get_daemon_set(&self, key: &ObjectKey) -> StoreResult<DaemonSet>;

    /// Create a DaemonSet. Fails with `AlreadyExists` if one is present.
    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet>;

    /// Replace a DaemonSet wholesale. When `resourceVersion` is set the
    /// replace only succeeds against that version.
    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get_extension(&self, key: &ObjectKey) -> StoreResult<Extension> {
        (**self).get_extension(key).await
    }

    async fn get_daemon_set(&self, key: &ObjectKey) -> StoreResult<DaemonSet> {
        (**self).get_daemon_set(key).await
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet> {
        (**self).create_daemon_set(daemon_set).await
    }

    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet> {
        (**self).replace_daemon_set(daemon_set).await
    }
}

/// Turns a `NotFound` into `None`.
pub fn found<T>(result: StoreResult<T>) -> StoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found() {
        assert_eq!(found(Ok::<_, StoreError>(1)).unwrap(), Some(1));

        let missing: StoreResult<i32> = Err(StoreError::NotFound {
            kind: "DaemonSet",
            key: ObjectKey::new("ns", "ext"),
        });
        assert_eq!(found(missing).unwrap(), None);

        let failed: StoreResult<i32> = Err(StoreError::Unavailable("timeout".to_string()));
        assert!(found(failed).is_err());
    }

    #[test]
    fn test_not_found_display() {
        let err = StoreError::NotFound {
            kind: "Extension",
            key: ObjectKey::new("monitoring", "host"),
        };
        assert_eq!(err.to_string(), "Extension monitoring/host not found");
        assert!(err.is_transient());
    }
}
