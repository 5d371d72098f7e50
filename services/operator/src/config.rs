//! Operator configuration.
//!
//! Everything here is operator policy, read once at startup. None of it can
//! be set from an `Extension`.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use extop_reconcile::{
    FailureTracker, DEFAULT_ERROR_BACKOFF_BASE, DEFAULT_ERROR_BACKOFF_MAX, DEFAULT_FAILURE_WINDOW,
    DEFAULT_MAX_FAILURES, DEFAULT_RESYNC_INTERVAL,
};

use crate::desired::{
    AgentPolicy, DEFAULT_AGENT_IMAGE, DEFAULT_PROBE_INITIAL_DELAY_SECS, DEFAULT_PROBE_PERIOD_SECS,
    DEFAULT_PULL_POLICY,
};

const PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Operator configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch. `None` watches all namespaces.
    pub watch_namespace: Option<String>,

    /// Agent pod policy.
    pub agent: AgentPolicy,

    /// Requeue delay after a successful pass.
    pub resync_interval: Duration,

    /// Delay after the first failure.
    pub error_backoff_base: Duration,

    /// Upper bound on the failure delay.
    pub error_backoff_max: Duration,

    /// Failures tolerated before an extension is reported as persistently failing.
    pub max_failures: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            agent: AgentPolicy::default(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            error_backoff_base: DEFAULT_ERROR_BACKOFF_BASE,
            error_backoff_max: DEFAULT_ERROR_BACKOFF_MAX,
            max_failures: DEFAULT_MAX_FAILURES,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let watch_namespace = lookup("EXTOP_WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let image = lookup("EXTOP_AGENT_IMAGE").unwrap_or_else(|| DEFAULT_AGENT_IMAGE.to_string());
        if image.trim().is_empty() {
            bail!("EXTOP_AGENT_IMAGE must not be empty.");
        }

        let pull_policy =
            lookup("EXTOP_AGENT_PULL_POLICY").unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string());
        if !PULL_POLICIES.contains(&pull_policy.as_str()) {
            bail!("EXTOP_AGENT_PULL_POLICY must be one of {PULL_POLICIES:?}, got {pull_policy:?}.");
        }

        let probe_initial_delay_secs: i32 = parse_var(
            &lookup,
            "EXTOP_PROBE_INITIAL_DELAY_SECS",
            DEFAULT_PROBE_INITIAL_DELAY_SECS,
        )?;
        let probe_period_secs: i32 =
            parse_var(&lookup, "EXTOP_PROBE_PERIOD_SECS", DEFAULT_PROBE_PERIOD_SECS)?;
        if probe_initial_delay_secs < 0 || probe_period_secs < 1 {
            bail!("Probe delay must be >= 0 and probe period must be >= 1 second.");
        }

        let resync_secs: u64 = parse_var(
            &lookup,
            "EXTOP_RESYNC_INTERVAL_SECS",
            DEFAULT_RESYNC_INTERVAL.as_secs(),
        )?;
        let backoff_base_secs: u64 = parse_var(
            &lookup,
            "EXTOP_ERROR_BACKOFF_BASE_SECS",
            DEFAULT_ERROR_BACKOFF_BASE.as_secs(),
        )?;
        let backoff_max_secs: u64 = parse_var(
            &lookup,
            "EXTOP_ERROR_BACKOFF_MAX_SECS",
            DEFAULT_ERROR_BACKOFF_MAX.as_secs(),
        )?;
        let max_failures: u32 = parse_var(&lookup, "EXTOP_MAX_FAILURES", DEFAULT_MAX_FAILURES)?;

        let log_level = lookup("EXTOP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            watch_namespace,
            agent: AgentPolicy {
                image,
                pull_policy,
                probe_initial_delay_secs,
                probe_period_secs,
            },
            resync_interval: Duration::from_secs(resync_secs.max(1)),
            error_backoff_base: Duration::from_secs(backoff_base_secs.max(1)),
            error_backoff_max: Duration::from_secs(backoff_max_secs.max(backoff_base_secs).max(1)),
            max_failures,
            log_level,
        })
    }

    /// Failure tracker configured from this config.
    pub fn failure_tracker(&self) -> FailureTracker {
        FailureTracker::new(
            self.max_failures,
            DEFAULT_FAILURE_WINDOW,
            self.error_backoff_base,
            self.error_backoff_max,
        )
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be an integer."))?
        .unwrap_or(default))
}
