//! Desired-state builder.
//!
//! Renders an `Extension` into the DaemonSet that should be running for it.
//! Everything about the pod except the extension list is operator policy
//! ([`AgentPolicy`]); nothing in the `Extension` can change the image, the
//! host mount or the probe.

use std::collections::BTreeMap;

use extop_api::{Extension, ExtensionSpec, ObjectKey};
use extop_reconcile::Fingerprint;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, ExecAction, HostPathVolumeSource, PodSpec, PodTemplateSpec, Probe, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::error::ReconcileError;

/// Annotation holding the fingerprint of the rendered DaemonSet.
pub const TEMPLATE_HASH_ANNOTATION: &str = "internal.extension.dynatrace.com/template-hash";

pub const COMPONENT_LABEL: &str = "dynatrace.com/component";
pub const COMPONENT_VALUE: &str = "extension";
pub const INSTANCE_LABEL: &str = "extension.dynatrace.com/instance";
pub const NAMESPACE_LABEL: &str = "extension.dynatrace.com/namespace";

/// Environment variable carrying the declared extensions to the agent.
pub const EXTENSIONS_ENV: &str = "DT_EXTENSIONS";

pub const AGENT_CONTAINER: &str = "dt-extension";
pub const HOST_ROOT_VOLUME: &str = "host-root";
pub const HOST_ROOT_PATH: &str = "/";
pub const HOST_ROOT_MOUNT_PATH: &str = "/mnt/root";
pub const HEALTH_CHECK_COMMAND: [&str; 2] = ["/extension-watcher", "health-check"];
pub const PROBE_TIMEOUT_SECS: i32 = 1;

pub const DEFAULT_AGENT_IMAGE: &str = "quay.io/dlopes7/dt-extension:latest";
pub const DEFAULT_PULL_POLICY: &str = "Always";
pub const DEFAULT_PROBE_INITIAL_DELAY_SECS: i32 = 30;
pub const DEFAULT_PROBE_PERIOD_SECS: i32 = 30;

/// Operator-controlled settings for the agent pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPolicy {
    /// Agent container image.
    pub image: String,

    /// Image pull policy (`Always`, `IfNotPresent` or `Never`).
    pub pull_policy: String,

    /// Delay before the first readiness probe.
    pub probe_initial_delay_secs: i32,

    /// Interval between readiness probes.
    pub probe_period_secs: i32,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            image: DEFAULT_AGENT_IMAGE.to_string(),
            pull_policy: DEFAULT_PULL_POLICY.to_string(),
            probe_initial_delay_secs: DEFAULT_PROBE_INITIAL_DELAY_SECS,
            probe_period_secs: DEFAULT_PROBE_PERIOD_SECS,
        }
    }
}

/// A rendered DaemonSet together with the fingerprint stamped on it.
#[derive(Debug, Clone)]
pub struct DesiredDaemonSet {
    pub key: ObjectKey,
    pub daemon_set: DaemonSet,
    pub fingerprint: Fingerprint,
}

/// Builds the desired DaemonSet for an extension.
pub fn build(extension: &Extension, policy: &AgentPolicy) -> Result<DesiredDaemonSet, ReconcileError> {
    let key = extension.key()?;
    build_for(key, &extension.spec, policy)
}

/// Builds the desired DaemonSet for a spec under the given identity.
pub fn build_for(
    key: ObjectKey,
    spec: &ExtensionSpec,
    policy: &AgentPolicy,
) -> Result<DesiredDaemonSet, ReconcileError> {
    let labels = selector_labels(&key);
    let extensions = serde_json::to_string(&spec.extensions)?;

    let daemon_set = DaemonSet {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec(policy, extensions)),
            },
            ..Default::default()
        }),
        status: None,
    };

    let (daemon_set, fingerprint) = stamp(daemon_set)?;
    Ok(DesiredDaemonSet {
        key,
        daemon_set,
        fingerprint,
    })
}

/// Labels shared by the DaemonSet, its selector and its pods.
///
/// Name and namespace are both included, so two extensions never select each
/// other's pods.
pub fn selector_labels(key: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), key.name.clone()),
        (NAMESPACE_LABEL.to_string(), key.namespace.clone()),
    ])
}

/// Label selector matching every DaemonSet managed by the operator.
pub fn managed_selector() -> String {
    format!("{COMPONENT_LABEL}={COMPONENT_VALUE}")
}

/// Stamps a DaemonSet with the fingerprint of everything but the stamp itself.
pub fn stamp(mut daemon_set: DaemonSet) -> Result<(DaemonSet, Fingerprint), ReconcileError> {
    let fingerprint = Fingerprint::of_excluding(&daemon_set, TEMPLATE_HASH_ANNOTATION)?;
    daemon_set
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            TEMPLATE_HASH_ANNOTATION.to_string(),
            fingerprint.as_str().to_string(),
        );
    Ok((daemon_set, fingerprint))
}

fn pod_spec(policy: &AgentPolicy, extensions: String) -> PodSpec {
    PodSpec {
        volumes: Some(vec![Volume {
            name: HOST_ROOT_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: HOST_ROOT_PATH.to_string(),
                type_: None,
            }),
            ..Default::default()
        }]),
        containers: vec![Container {
            name: AGENT_CONTAINER.to_string(),
            image: Some(policy.image.clone()),
            image_pull_policy: Some(policy.pull_policy.clone()),
            env: Some(vec![EnvVar {
                name: EXTENSIONS_ENV.to_string(),
                value: Some(extensions),
                value_from: None,
            }]),
            readiness_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: Some(HEALTH_CHECK_COMMAND.iter().map(|s| s.to_string()).collect()),
                }),
                initial_delay_seconds: Some(policy.probe_initial_delay_secs),
                period_seconds: Some(policy.probe_period_secs),
                timeout_seconds: Some(PROBE_TIMEOUT_SECS),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: HOST_ROOT_VOLUME.to_string(),
                mount_path: HOST_ROOT_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }],
        ..Default::default()
    }
}
