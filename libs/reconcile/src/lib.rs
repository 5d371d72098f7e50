//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge a child resource to a declared specification. Key concepts:
//!
//! - **Desired state**: What the child should look like (built from the spec).
//! - **Observed state**: What the store currently holds for the child.
//! - **Fingerprint**: A short digest stamped onto the child so drift can be
//!   detected with a string comparison instead of a structural diff.
//!
//! # Invariants
//!
//! - Fingerprints are deterministic given the same logical input
//! - Map iteration order never affects a fingerprint
//! - A stamped object fingerprints identically to its unstamped form

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Fingerprinting errors.
#[derive(Debug, Error)]
pub enum FingerprintError {
    /// The description could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A fingerprint for deterministic comparison.
///
/// Used to detect when a rendered child resource has changed. This is a
/// change detector, not an integrity check: the hash is 32-bit FNV-1.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of any serializable description.
    pub fn of<T: Serialize>(description: &T) -> Result<Self, FingerprintError> {
        let value = serde_json::to_value(description)?;
        Ok(Self::from_json(&value))
    }

    /// Compute a fingerprint from a JSON value.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        Self(fnv1_32(canonical.as_bytes()).to_string())
    }

    /// Compute the fingerprint of a resource with its own stamp removed.
    ///
    /// `annotation_key` is dropped from `metadata.annotations` before hashing.
    /// An annotation map left empty by the removal is dropped as well, so the
    /// result equals the fingerprint of the never-stamped resource.
    pub fn of_excluding<T: Serialize>(
        resource: &T,
        annotation_key: &str,
    ) -> Result<Self, FingerprintError> {
        let mut value = serde_json::to_value(resource)?;
        if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            let now_empty = match metadata
                .get_mut("annotations")
                .and_then(|a| a.as_object_mut())
            {
                Some(annotations) => {
                    annotations.remove(annotation_key);
                    annotations.is_empty()
                }
                None => false,
            };
            if now_empty {
                metadata.remove("annotations");
            }
        }
        Ok(Self::from_json(&value))
    }

    /// Get the fingerprint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<str> for Fingerprint {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// FNV-1 32-bit hash (multiply, then xor).
fn fnv1_32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u32::from(byte);
    }
    hash
}

/// Drift classification of a child resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// No child exists for the identity.
    Absent,

    /// The child carries the desired fingerprint.
    Unchanged,

    /// The child carries a different fingerprint, or none at all.
    Changed,
}

impl Drift {
    /// Returns true if a store write is required.
    pub fn needs_write(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Classify a child against the desired fingerprint.
///
/// `observed` is `None` when the child does not exist, and `Some(None)` when
/// it exists without a fingerprint stamp (treated as drifted).
pub fn classify(desired: &Fingerprint, observed: Option<Option<&str>>) -> Drift {
    match observed {
        None => Drift::Absent,
        Some(Some(stamp)) if desired == stamp => Drift::Unchanged,
        Some(_) => Drift::Changed,
    }
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    /// Consecutive failures inside the current window.
    pub count: u32,

    /// True once `count` exceeds the tracker's limit.
    pub exhausted: bool,

    /// Suggested delay before the next attempt.
    pub backoff: Duration,
}

/// Failure tracker for repeatedly failing resources.
///
/// The tracker never retries anything itself. It tells the caller how long
/// to wait and whether the failure has become persistent enough to surface.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    /// Failures tolerated before a resource counts as exhausted.
    max_failures: u32,

    /// Window after which the count resets.
    window: Duration,

    /// Delay after the first failure.
    backoff_base: Duration,

    /// Upper bound on the delay.
    backoff_max: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl FailureTracker {
    /// Create a new failure tracker.
    pub fn new(
        max_failures: u32,
        window: Duration,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            max_failures,
            window,
            backoff_base,
            backoff_max,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    pub fn record_failure(&mut self, resource_key: &str) -> FailureReport {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count = count.saturating_add(1);
        let count = *count;

        FailureReport {
            count,
            exhausted: count > self.max_failures,
            backoff: self.backoff_for(count),
        }
    }

    /// Exponential delay for the given failure count, capped at the maximum.
    pub fn backoff_for(&self, count: u32) -> Duration {
        let exponent = count.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Check if failures are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_failures
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of resources currently tracked.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if no resource is failing.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_FAILURES,
            DEFAULT_FAILURE_WINDOW,
            DEFAULT_ERROR_BACKOFF_BASE,
            DEFAULT_ERROR_BACKOFF_MAX,
        )
    }
}

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default delay after the first failure.
pub const DEFAULT_ERROR_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default upper bound on the failure delay.
pub const DEFAULT_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Default failures tolerated before a resource is reported as persistently failing.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default failure window.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
