//! Namespaced object identity.

use std::fmt;
use std::str::FromStr;

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::KeyError;

/// The `(namespace, name)` pair addressing a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derives the key of a namespaced resource from its metadata.
    pub fn of<K: Resource>(resource: &K) -> Result<Self, KeyError> {
        let meta = resource.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingField(".metadata.name"))?;
        let namespace = meta
            .namespace
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingField(".metadata.namespace"))?;
        Ok(Self::new(namespace, name))
    }

    /// Parses a key in `namespace/name` form.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }

        let Some((namespace, name)) = s.split_once('/') else {
            return Err(KeyError::MissingSeparator(s.to_string()));
        };

        if namespace.is_empty() {
            return Err(KeyError::MissingField("namespace"));
        }
        if name.is_empty() {
            return Err(KeyError::MissingField("name"));
        }

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
