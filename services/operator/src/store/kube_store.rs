//! Store backed by the Kubernetes API server.

use async_trait::async_trait;
use extop_api::{Extension, ObjectKey};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use super::{Store, StoreError, StoreResult};

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "extension-operator";

/// Store that reads and writes through a kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store on top of an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn extensions(&self, namespace: &str) -> Api<Extension> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn daemon_sets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_extension(&self, key: &ObjectKey) -> StoreResult<Extension> {
        self.extensions(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| from_kube(e, "Extension", key))
    }

    async fn get_daemon_set(&self, key: &ObjectKey) -> StoreResult<DaemonSet> {
        self.daemon_sets(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| from_kube(e, "DaemonSet", key))
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet> {
        let key = ObjectKey::of(daemon_set).map_err(|e| StoreError::Invalid(e.to_string()))?;
        debug!(daemonset = %key, "POST daemonset");
        self.daemon_sets(&key.namespace)
            .create(&Self::post_params(), daemon_set)
            .await
            .map_err(|e| from_kube(e, "DaemonSet", &key))
    }

    async fn replace_daemon_set(&self, daemon_set: &DaemonSet) -> StoreResult<DaemonSet> {
        let key = ObjectKey::of(daemon_set).map_err(|e| StoreError::Invalid(e.to_string()))?;
        debug!(
            daemonset = %key,
            resource_version = ?daemon_set.metadata.resource_version,
            "PUT daemonset"
        );
        self.daemon_sets(&key.namespace)
            .replace(&key.name, &Self::post_params(), daemon_set)
            .await
            .map_err(|e| from_kube(e, "DaemonSet", &key))
    }
}

/// Map a kube client error onto the store taxonomy.
fn from_kube(err: kube::Error, kind: &'static str, key: &ObjectKey) -> StoreError {
    if let kube::Error::Api(response) = &err {
        match (response.code, response.reason.as_str()) {
            (404, _) => {
                return StoreError::NotFound {
                    kind,
                    key: key.clone(),
                }
            }
            (409, "AlreadyExists") => return StoreError::AlreadyExists(response.message.clone()),
            (409, _) => return StoreError::Conflict(response.message.clone()),
            (400 | 422, _) => return StoreError::Invalid(response.message.clone()),
            _ => {}
        }
    }
    StoreError::Api(err)
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;
    use rstest::rstest;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from api server"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_not_found_is_distinguished() {
        let key = ObjectKey::new("ns", "ext");
        let err = from_kube(api_error(404, "NotFound"), "Extension", &key);
        assert!(err.is_not_found());
        assert!(matches!(err, StoreError::NotFound { kind: "Extension", .. }));
    }

    #[rstest]
    #[case(409, "AlreadyExists", "already exists")]
    #[case(409, "Conflict", "conflict")]
    #[case(422, "Invalid", "invalid object")]
    #[case(500, "InternalError", "api error")]
    #[case(429, "TooManyRequests", "api error")]
    fn test_error_mapping(#[case] code: u16, #[case] reason: &str, #[case] prefix: &str) {
        let err = from_kube(api_error(code, reason), "DaemonSet", &ObjectKey::new("ns", "ext"));
        assert!(err.to_string().starts_with(prefix), "{err}");
        assert!(!err.is_not_found());
    }
}
