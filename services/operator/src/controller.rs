//! Controller wiring.
//!
//! Watches `Extension` objects and the DaemonSets they own, and runs the
//! [`Reconciler`] for every change and on a periodic resync. The kube-rs
//! runtime serializes passes per object; passes for different objects run
//! concurrently.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use extop_api::Extension;
use extop_reconcile::FailureTracker;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::desired::managed_selector;
use crate::error::ReconcileError;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::{KubeStore, Store};

/// Shared state handed to every reconcile and error-policy call.
pub struct Context<S> {
    /// The reconcile loop.
    reconciler: Reconciler<S>,

    /// Consecutive failures per extension.
    failures: Mutex<FailureTracker>,

    /// Requeue delay after a successful pass.
    resync_interval: Duration,

    /// Fired on shutdown; stops passes before their next write.
    cancel: CancellationToken,
}

impl<S: Store> Context<S> {
    /// Create a new context.
    pub fn new(
        reconciler: Reconciler<S>,
        failures: FailureTracker,
        resync_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            failures: Mutex::new(failures),
            resync_interval,
            cancel,
        }
    }

    /// Returns true if the extension has failed past the tracker's limit.
    pub fn is_failing(&self, key: &str) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_exhausted(key)
    }

    /// Number of extensions with recorded failures.
    pub fn failing_count(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Reconcile entry point called by the controller runtime.
pub async fn reconcile<S: Store>(
    extension: Arc<Extension>,
    ctx: Arc<Context<S>>,
) -> Result<Action, ReconcileError> {
    let key = extension.key()?;
    let outcome = ctx.reconciler.reconcile(&key, &ctx.cancel).await?;

    {
        let mut failures = ctx.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.clear(&key.to_string());
        // Extensions deleted while failing never get a clearing pass
        failures.prune();
    }

    debug!(extension = %key, outcome = %outcome, "Reconcile pass complete");
    Ok(next_action(&outcome, ctx.resync_interval))
}

/// Error policy called by the controller runtime after a failed pass.
///
/// Transient errors are requeued with exponential backoff. Once an
/// extension keeps failing past the tracker's limit it is logged at error
/// level so persistent misconfiguration stands out. Terminal errors wait for
/// the extension to change.
pub fn error_policy<S: Store>(
    extension: Arc<Extension>,
    error: &ReconcileError,
    ctx: Arc<Context<S>>,
) -> Action {
    let key = extension
        .key()
        .map(|k| k.to_string())
        .unwrap_or_else(|_| extension.name_any());

    if !error.is_transient() {
        error!(extension = %key, error = %error, "Reconcile failed; waiting for the extension to change");
        return Action::await_change();
    }

    let report = {
        let mut failures = ctx.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.prune();
        failures.record_failure(&key)
    };

    if report.exhausted {
        error!(
            extension = %key,
            error = %error,
            failures = report.count,
            backoff_secs = report.backoff.as_secs(),
            "Reconcile keeps failing"
        );
    } else {
        warn!(
            extension = %key,
            error = %error,
            failures = report.count,
            backoff_secs = report.backoff.as_secs(),
            "Reconcile failed, will retry"
        );
    }

    Action::requeue(report.backoff)
}

/// Requeue decision after a successful pass.
pub fn next_action(outcome: &ReconcileOutcome, resync_interval: Duration) -> Action {
    match outcome {
        // Deleted extensions come back through the watch if recreated
        ReconcileOutcome::ParentMissing => Action::await_change(),
        _ => Action::requeue(resync_interval),
    }
}

/// Run the controller until a shutdown signal arrives.
pub async fn run(client: Client, config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let (extensions, daemon_sets): (Api<Extension>, Api<DaemonSet>) =
        match &config.watch_namespace {
            Some(namespace) => (
                Api::namespaced(client.clone(), namespace),
                Api::namespaced(client.clone(), namespace),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    let reconciler = Reconciler::new(KubeStore::new(client), config.agent.clone());
    let ctx = Arc::new(Context::new(
        reconciler,
        config.failure_tracker(),
        config.resync_interval,
        cancel,
    ));

    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        resync_interval_secs = config.resync_interval.as_secs(),
        "Starting extension controller"
    );

    Controller::new(extensions, watcher::Config::default())
        .owns(
            daemon_sets,
            watcher::Config::default().labels(&managed_selector()),
        )
        .shutdown_on_signal()
        .run(reconcile::<KubeStore>, error_policy::<KubeStore>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, action)) => debug!(object = %object, ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Controller error"),
            }
        })
        .await;

    info!("Extension controller terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use extop_api::{ExtensionSpec, ObjectKey};
    use extop_reconcile::Fingerprint;

    use super::*;
    use crate::desired::AgentPolicy;
    use crate::store::{MemoryStore, StoreError};

    fn context(store: Arc<MemoryStore>) -> Arc<Context<Arc<MemoryStore>>> {
        Arc::new(Context::new(
            Reconciler::new(store, AgentPolicy::default()),
            FailureTracker::new(
                2,
                Duration::from_secs(600),
                Duration::from_secs(5),
                Duration::from_secs(60),
            ),
            Duration::from_secs(300),
            CancellationToken::new(),
        ))
    }

    fn extension() -> Extension {
        let mut ext = Extension::new("ext", ExtensionSpec::default());
        ext.metadata.namespace = Some("ns".to_string());
        ext
    }

    #[test]
    fn test_next_action() {
        let resync = Duration::from_secs(300);
        assert_eq!(
            next_action(&ReconcileOutcome::ParentMissing, resync),
            Action::await_change()
        );
        assert_eq!(
            next_action(
                &ReconcileOutcome::Unchanged {
                    fingerprint: Fingerprint::from_json(&serde_json::json!({}))
                },
                resync
            ),
            Action::requeue(resync)
        );
    }

    #[tokio::test]
    async fn test_reconcile_creates_and_requeues() {
        let store = Arc::new(MemoryStore::new());
        let stored = store.put_extension(extension()).await.unwrap();
        let ctx = context(Arc::clone(&store));

        let action = reconcile(Arc::new(stored), Arc::clone(&ctx)).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert_eq!(store.creates(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_deleted_extension_awaits_change() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(Arc::clone(&store));

        let action = reconcile(Arc::new(extension()), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_error_policy_backs_off_and_escalates() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let ext = Arc::new(extension());
        let err = ReconcileError::Store(StoreError::Unavailable("timeout".to_string()));

        let delays: Vec<_> = (0..3)
            .map(|_| error_policy(Arc::clone(&ext), &err, Arc::clone(&ctx)))
            .collect();

        assert_eq!(
            delays,
            vec![
                Action::requeue(Duration::from_secs(5)),
                Action::requeue(Duration::from_secs(10)),
                Action::requeue(Duration::from_secs(20)),
            ]
        );
        assert!(ctx.is_failing("ns/ext"));
    }

    #[test]
    fn test_error_policy_terminal_waits_for_change() {
        let ctx = context(Arc::new(MemoryStore::new()));
        let err = ReconcileError::MissingOwnerRef(ObjectKey::new("ns", "ext"));

        let action = error_policy(Arc::new(extension()), &err, Arc::clone(&ctx));

        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.failing_count(), 0);
    }

    #[tokio::test]
    async fn test_success_clears_failures() {
        let store = Arc::new(MemoryStore::new());
        let stored = Arc::new(store.put_extension(extension()).await.unwrap());
        let ctx = context(Arc::clone(&store));

        let err = ReconcileError::Cancelled;
        error_policy(Arc::clone(&stored), &err, Arc::clone(&ctx));
        assert_eq!(ctx.failing_count(), 1);

        reconcile(stored, Arc::clone(&ctx)).await.unwrap();
        assert_eq!(ctx.failing_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_failures_are_pruned() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(Context::new(
            Reconciler::new(Arc::clone(&store), AgentPolicy::default()),
            FailureTracker::new(
                2,
                Duration::from_millis(1),
                Duration::from_secs(5),
                Duration::from_secs(60),
            ),
            Duration::from_secs(300),
            CancellationToken::new(),
        ));
        let err = ReconcileError::Store(StoreError::Unavailable("timeout".to_string()));

        // Failing extensions that are deleted before they recover
        for i in 0..10 {
            let mut ext = Extension::new(&format!("gone-{i}"), ExtensionSpec::default());
            ext.metadata.namespace = Some("ns".to_string());
            error_policy(Arc::new(ext), &err, Arc::clone(&ctx));
        }
        assert_eq!(ctx.failing_count(), 10);

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Any later failure sweeps the expired entries
        error_policy(Arc::new(extension()), &err, Arc::clone(&ctx));
        assert_eq!(ctx.failing_count(), 1);

        // So does any later success
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stored = store.put_extension(extension()).await.unwrap();
        let mut other = Extension::new("other", ExtensionSpec::default());
        other.metadata.namespace = Some("ns".to_string());
        error_policy(Arc::new(other), &err, Arc::clone(&ctx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        reconcile(Arc::new(stored), Arc::clone(&ctx)).await.unwrap();
        assert_eq!(ctx.failing_count(), 0);
    }
}
