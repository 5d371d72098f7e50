//! Extension Operator
//!
//! Runs one agent pod per node for every `Extension` resource, fetching the
//! extensions the resource declares.
//!
//! ## Commands
//!
//! - `run`: watch extensions and their DaemonSets until shutdown
//! - `crd`: print the `Extension` CustomResourceDefinition as YAML
//! - `reconcile <namespace>/<name>`: run a single pass for one extension

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use extop_api::{Extension, ObjectKey};
use extop_operator::{config::Config, controller, KubeStore, Reconciler};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "extension-operator", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller.
    Run,

    /// Print the Extension CRD.
    Crd,

    /// Reconcile a single extension once and exit.
    Reconcile {
        /// Extension to reconcile, as `namespace/name`.
        key: ObjectKey,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Crd = cli.command {
        print!("{}", serde_yaml::to_string(&Extension::crd())?);
        return Ok(());
    }

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to EXTOP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        agent_image = %config.agent.image,
        "Configuration loaded"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create kubernetes client")?;

    // Cancelled on shutdown so in-flight passes stop before their next write
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Run => controller::run(client, &config, cancel).await,
        Command::Reconcile { key } => {
            let reconciler = Reconciler::new(KubeStore::new(client), config.agent.clone());
            match reconciler.reconcile(&key, &cancel).await {
                Ok(outcome) => {
                    info!(extension = %key, outcome = %outcome, "Reconcile complete");
                    println!("{key}: {outcome}");
                    Ok(())
                }
                Err(e) => {
                    error!(extension = %key, error = %e, transient = e.is_transient(), "Reconcile failed");
                    Err(e.into())
                }
            }
        }
        Command::Crd => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_takes_namespaced_key() {
        let cli = Cli::try_parse_from(["extension-operator", "reconcile", "monitoring/host"]).unwrap();
        let Command::Reconcile { key } = cli.command else {
            panic!("expected reconcile command");
        };
        assert_eq!(key, ObjectKey::new("monitoring", "host"));

        assert!(Cli::try_parse_from(["extension-operator", "reconcile", "host"]).is_err());
    }
}
