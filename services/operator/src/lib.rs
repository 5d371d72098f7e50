//! Extension Operator Library
//!
//! Keeps one agent DaemonSet per `Extension` in sync with the extension's
//! declared spec. Each pass builds the desired DaemonSet, fingerprints it,
//! compares the fingerprint with the one stamped on the running DaemonSet
//! and issues at most one create or replace.
//!
//! ## Modules
//!
//! - `desired`: renders an `Extension` into its DaemonSet
//! - `drift`: compares desired and observed fingerprints
//! - `store`: cluster access (`KubeStore`) and an in-memory double (`MemoryStore`)
//! - `reconciler`: the reconcile pass
//! - `controller`: kube-rs controller wiring, requeue and backoff
//! - `config`: env-driven operator configuration

pub mod config;
pub mod controller;
pub mod desired;
pub mod drift;
pub mod error;
pub mod reconciler;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use desired::{AgentPolicy, DesiredDaemonSet, TEMPLATE_HASH_ANNOTATION};
pub use error::ReconcileError;
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use store::{KubeStore, MemoryStore, Store, StoreError};
