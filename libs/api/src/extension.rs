//! The `Extension` custom resource.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{KeyError, ObjectKey};

/// Desired state of an `Extension`: the extensions every node should install.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "dynatrace.com",
    version = "v1alpha1",
    kind = "Extension",
    plural = "extensions"
)]
#[kube(namespaced, shortname = "ext", status = "ExtensionStatus")]
pub struct ExtensionSpec {
    /// Extensions to install, in declaration order. Duplicate names are
    /// accepted and passed through unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionSource>,
}

/// A single named download source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_link: String,
}

impl ExtensionSource {
    pub fn new(name: impl Into<String>, download_link: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            download_link: download_link.into(),
        }
    }
}

impl ExtensionSpec {
    /// Creates a spec declaring the given extensions.
    pub fn with_extensions(extensions: impl IntoIterator<Item = ExtensionSource>) -> Self {
        Self {
            extensions: extensions.into_iter().collect(),
        }
    }
}

/// Observed state of an `Extension`.
///
/// Written by the per-node agents, not by the operator. The shape is kept
/// stable for existing readers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ExtensionStatus {
    /// Agent instances keyed by node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances: BTreeMap<String, ExtensionInstance>,
}

/// A running agent pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInstance {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}

impl Extension {
    /// The identity shared by this extension and its DaemonSet.
    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::of(self)
    }
}
