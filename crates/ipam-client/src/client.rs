//! Kubernetes-backed lease client

use crate::error::LeaseError;
use crate::lease_trait::LeaseClientTrait;
use crds::IPAM;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

/// Lease client over the IPAM custom resource
#[derive(Clone)]
pub struct LeaseClient {
    client: Client,
}

impl std::fmt::Debug for LeaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseClient").finish_non_exhaustive()
    }
}

impl LeaseClient {
    /// Create a new lease client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<IPAM> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error(err: kube::Error, what: String) -> LeaseError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => LeaseError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 => LeaseError::Conflict(what),
        other => LeaseError::Kube(other),
    }
}

#[async_trait::async_trait]
impl LeaseClientTrait for LeaseClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<IPAM, LeaseError> {
        debug!(namespace, name, "Fetching IPAM object");
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, format!("{}/{}", namespace, name)))
    }

    async fn update(&self, ipam: &IPAM) -> Result<IPAM, LeaseError> {
        let name = ipam.metadata.name.clone().ok_or_else(|| {
            LeaseError::InvalidReference("IPAM object has no name".to_string())
        })?;
        let namespace = ipam.namespace().ok_or_else(|| {
            LeaseError::InvalidReference(format!("IPAM object {} has no namespace", name))
        })?;

        debug!(
            namespace = %namespace,
            name = %name,
            host_specs = ipam.spec.host_specs.len(),
            "Updating IPAM object"
        );
        self.api(&namespace)
            .replace(&name, &PostParams::default(), ipam)
            .await
            .map_err(|e| map_kube_error(e, format!("{}/{}", namespace, name)))
    }
}
