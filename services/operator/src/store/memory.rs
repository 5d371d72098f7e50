//! In-process store for tests and local runs.
//!
//! Mimics the API server semantics the reconcile loop relies on:
//! - `NotFound` for missing objects
//! - `AlreadyExists` on duplicate create
//! - Optimistic concurrency on replace via `resourceVersion`
//! - Server-assigned `uid` and `resourceVersion`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use extop_api::{Extension, ObjectKey};
use k8s_openapi::api::apps::v1::DaemonSet;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Store, StoreError, StoreResult};

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    extensions: RwLock<BTreeMap<ObjectKey, Extension>>,
    daemon_sets: RwLock<BTreeMap<ObjectKey, DaemonSet>>,

    /// Source of uids and resource versions.
    version_counter: AtomicU64,

    /// Completed creates.
    creates: AtomicUsize,

    /// Completed replaces.
    replaces: AtomicUsize,

    /// Whether reads should "fail".
    fail_reads: AtomicBool,

    /// Whether writes should "fail".
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or overwrite an extension, assigning a uid if it has none.
    pub async fn put_extension(&self, mut extension: Extension) -> StoreResult<Extension> {
        let key = ObjectKey::of(&extension).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let version = self.next_version();
        if extension.metadata.uid.is_none() {
            extension.metadata.uid = Some(format!("uid-{version:08}"));
        }
        extension.metadata.resource_version = Some(version.to_string());
        self.extensions.write().await.insert(key, extension.clone());
        Ok(extension)
    }

    /// Remove an extension. The DaemonSet is left alone, as it would be
    /// until the garbage collector catches up.
    pub async fn remove_extension(&self, key: &ObjectKey) -> Option<Extension> {
        self.extensions.write().await.remove(key)
    }

    /// Seed a DaemonSet without counting it as a write.
    pub async fn put_daemon_set(&self, mut daemon_set: DaemonSet) -> StoreResult<DaemonSet> {
        let key = ObjectKey::of(&daemon_set).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let version = self.next_version();
        if daemon_set.metadata.uid.is_none() {
            daemon_set.metadata.uid = Some(format!("uid-{version:08}"));
        }
        daemon_set.metadata.resource_version = Some(version.to_string());
        self.daemon_sets.write().await.insert(key, daemon_set.clone());
        Ok(daemon_set)
    }

    /// Current DaemonSet for a key, if any.
    pub async fn daemon_set(&self, key: &ObjectKey) -> Option<DaemonSet> {
        self.daemon_sets.read().await.get(key).cloned()
    }

    /// Number of DaemonSets held.
    pub async fn daemon_set_count(&self) -> usize {
        self.daemon_sets.read().await.len()
    }

    /// Number of successful creates.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful replaces.
    pub fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    /// Total successful writes.
    pub fn writes(&self) -> usize {
        self.creates() + self.replaces()
    }

    /// Make subsequent reads fail with `Unavailable`.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail with `Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store configured to fail reads".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writes(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store configured to fail writes".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_extension(&self, key: &ObjectKey) -> StoreResult<Extension> {
        self.check_reads()?;
        self.extensions
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Extension",
                key: key.clone(),
            })
    }

    async fn get_daemon_set(&self, key: &ObjectKey) -> StoreResult<DaemonSet> {
        self.check_reads()?;
        self.daemon_set(key).await.ok_or_else(|| StoreError::NotFound {
            kind: "DaemonSet",
            key: key.clone(),
        })
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet> {
        self.check_writes()?;
        let key = ObjectKey::of(daemon_set).map_err(|e| StoreError::Invalid(e.to_string()))?;

        let mut daemon_sets = self.daemon_sets.write().await;
        if daemon_sets.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("daemonset {key}")));
        }
        if daemon_set.metadata.resource_version.is_some() {
            return Err(StoreError::Invalid(
                "resourceVersion should not be set on objects to be created".to_string(),
            ));
        }

        let version = self.next_version();
        let mut stored = daemon_set.clone();
        stored.metadata.uid = Some(format!("uid-{version:08}"));
        stored.metadata.resource_version = Some(version.to_string());
        daemon_sets.insert(key.clone(), stored.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);

        debug!(daemonset = %key, resource_version = version, "[MEMORY] Created daemonset");
        Ok(stored)
    }

    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet> {
        self.check_writes()?;
        let key = ObjectKey::of(daemon_set).map_err(|e| StoreError::Invalid(e.to_string()))?;

        let mut daemon_sets = self.daemon_sets.write().await;
        let Some(current) = daemon_sets.get(&key) else {
            return Err(StoreError::NotFound {
                kind: "DaemonSet",
                key,
            });
        };

        if let Some(expected) = &daemon_set.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "daemonset {key}: resourceVersion {expected} is stale"
                )));
            }
        }

        let version = self.next_version();
        let mut stored = daemon_set.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(version.to_string());
        daemon_sets.insert(key.clone(), stored.clone());
        self.replaces.fetch_add(1, Ordering::SeqCst);

        debug!(daemonset = %key, resource_version = version, "[MEMORY] Replaced daemonset");
        Ok(stored)
    }
}
