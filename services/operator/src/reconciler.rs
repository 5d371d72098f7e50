//! Reconcile loop for a single extension.
//!
//! One pass:
//! - Reads the `Extension` (a missing extension ends the pass successfully)
//! - Builds and stamps the desired DaemonSet
//! - Reads the current DaemonSet and classifies drift
//! - Issues at most one create or replace
//!
//! The reconciler keeps no state between passes and never retries. Ordering,
//! requeueing and backoff belong to whoever calls it.

use std::future::Future;

use extop_api::{Extension, ObjectKey};
use extop_reconcile::Fingerprint;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::desired::{self, AgentPolicy};
use crate::drift;
use crate::error::ReconcileError;
use crate::store::{found, Store};

/// What a reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The extension no longer exists. Nothing was read or written beyond it.
    ParentMissing,

    /// A DaemonSet was created.
    Created { fingerprint: Fingerprint },

    /// The DaemonSet was replaced. `previous` is the stamp it carried, if any.
    Updated {
        previous: Option<String>,
        fingerprint: Fingerprint,
    },

    /// The DaemonSet already matched.
    Unchanged { fingerprint: Fingerprint },
}

impl ReconcileOutcome {
    /// Returns true if the pass wrote to the store.
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Updated { .. })
    }

    /// The fingerprint the DaemonSet carries after the pass.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            Self::ParentMissing => None,
            Self::Created { fingerprint }
            | Self::Updated { fingerprint, .. }
            | Self::Unchanged { fingerprint } => Some(fingerprint),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParentMissing => "parent_missing",
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Unchanged { .. } => "unchanged",
        }
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciler converging one DaemonSet per extension.
pub struct Reconciler<S> {
    /// Cluster state access.
    store: S,

    /// Operator policy for the agent pod.
    policy: AgentPolicy,
}

impl<S: Store> Reconciler<S> {
    /// Create a new reconciler.
    pub fn new(store: S, policy: AgentPolicy) -> Self {
        Self { store, policy }
    }

    /// Perform a single reconciliation pass for `key`.
    ///
    /// Store reads are abandoned as soon as `cancel` fires, and no write is
    /// issued once it has fired; either way the pass returns
    /// [`ReconcileError::Cancelled`].
    #[instrument(skip(self, cancel), fields(extension = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        ensure_active(cancel)?;

        let Some(extension) = found(or_cancelled(cancel, self.store.get_extension(key)).await?)?
        else {
            info!("Extension not found, nothing to reconcile");
            return Ok(ReconcileOutcome::ParentMissing);
        };

        let desired = desired::build(&extension, &self.policy)?;
        let observed = found(or_cancelled(cancel, self.store.get_daemon_set(&desired.key)).await?)?;
        let drift = drift::classify(&desired, observed.as_ref());

        debug!(
            ?drift,
            fingerprint = %desired.fingerprint,
            observed = ?observed.as_ref().and_then(drift::stamp_of),
            "Classified daemonset"
        );

        let fingerprint = desired.fingerprint;
        if !drift.needs_write() {
            return Ok(ReconcileOutcome::Unchanged { fingerprint });
        }

        let owner = owner_reference(&extension, key)?;
        match observed {
            Some(current) => {
                let previous = drift::stamp_of(&current).map(str::to_string);
                let replacement = adopt(desired.daemon_set, &current, owner);

                ensure_active(cancel)?;
                self.store.replace_daemon_set(&replacement).await?;
                info!(
                    previous = previous.as_deref().unwrap_or("<none>"),
                    fingerprint = %fingerprint,
                    "Updated daemonset"
                );
                Ok(ReconcileOutcome::Updated {
                    previous,
                    fingerprint,
                })
            }
            None => {
                let mut daemon_set = desired.daemon_set;
                daemon_set.metadata.owner_references = Some(vec![owner]);

                ensure_active(cancel)?;
                self.store.create_daemon_set(&daemon_set).await?;
                info!(fingerprint = %fingerprint, "Created daemonset");
                Ok(ReconcileOutcome::Created { fingerprint })
            }
        }
    }
}

/// Controller owner reference so the DaemonSet is collected with its extension.
fn owner_reference(extension: &Extension, key: &ObjectKey) -> Result<OwnerReference, ReconcileError> {
    extension
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::MissingOwnerRef(key.clone()))
}

/// Carry the current object's identity over to its replacement.
///
/// Keeping `resourceVersion` makes the replace a compare-and-swap against the
/// version that was classified.
fn adopt(mut desired: DaemonSet, current: &DaemonSet, owner: OwnerReference) -> DaemonSet {
    desired.metadata.uid = current.metadata.uid.clone();
    desired.metadata.resource_version = current.metadata.resource_version.clone();
    desired.metadata.owner_references = Some(vec![owner]);
    desired
}

/// Runs a store read, giving up once `cancel` fires.
async fn or_cancelled<F: Future>(
    cancel: &CancellationToken,
    read: F,
) -> Result<F::Output, ReconcileError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Cancelled during read");
            Err(ReconcileError::Cancelled)
        }
        output = read => Ok(output),
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), ReconcileError> {
    if cancel.is_cancelled() {
        debug!("Cancelled before write");
        return Err(ReconcileError::Cancelled);
    }
    Ok(())
}
