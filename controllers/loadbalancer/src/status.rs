//! Status write-back.
//!
//! Writes are skipped when the status already matches, and a 409 from the
//! API server is dropped: the next pass converges.

use crate::events::{reasons, EventRecorder, Severity};
use async_trait::async_trait;
use crds::{IngressLink, IngressLinkStatus, TransportServer, TransportServerStatus, VirtualServer, VirtualServerStatus};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, warn};

/// `statusOk` value of a rendered resource
pub const STATUS_OK: &str = "Ok";

/// Writes status subresources back to the cluster
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn virtual_server_status(&self, vs: &VirtualServer, status: &VirtualServerStatus) -> Result<(), kube::Error>;
    async fn transport_server_status(&self, ts: &TransportServer, status: &TransportServerStatus) -> Result<(), kube::Error>;
    async fn ingress_link_status(&self, il: &IngressLink, status: &IngressLinkStatus) -> Result<(), kube::Error>;
    /// Replace `status.loadBalancer.ingress` with `ips`
    async fn service_ingress(&self, svc: &Service, ips: &[String]) -> Result<(), kube::Error>;
}

/// Status writer patching through the API server
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl std::fmt::Debug for KubeStatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStatusWriter").finish_non_exhaustive()
    }
}

impl KubeStatusWriter {
    /// Writer using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch<K>(&self, obj: &K, patch: serde_json::Value) -> Result<(), kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %namespace, name = %name, "Status conflict, leaving it to the next pass");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn virtual_server_status(&self, vs: &VirtualServer, status: &VirtualServerStatus) -> Result<(), kube::Error> {
        self.patch(vs, json!({ "status": status })).await
    }

    async fn transport_server_status(&self, ts: &TransportServer, status: &TransportServerStatus) -> Result<(), kube::Error> {
        self.patch(ts, json!({ "status": status })).await
    }

    async fn ingress_link_status(&self, il: &IngressLink, status: &IngressLinkStatus) -> Result<(), kube::Error> {
        self.patch(il, json!({ "status": status })).await
    }

    async fn service_ingress(&self, svc: &Service, ips: &[String]) -> Result<(), kube::Error> {
        let ingress: Vec<_> = ips.iter().map(|ip| json!({ "ip": ip })).collect();
        self.patch(svc, json!({ "status": { "loadBalancer": { "ingress": ingress } } })).await
    }
}

/// Set `vsAddress` (and `statusOk`) unless already current
pub async fn update_virtual_server_status(writer: &dyn StatusWriter, vs: &VirtualServer, ip: &str) {
    let status = VirtualServerStatus {
        vs_address: ip.to_string(),
        status_ok: STATUS_OK.to_string(),
    };
    if vs.status.as_ref() == Some(&status) {
        return;
    }
    if let Err(e) = writer.virtual_server_status(vs, &status).await {
        warn!(virtual_server = %vs.name_any(), error = %e, "Failed to update VirtualServer status");
    }
}

/// Publish the listener address of a TransportServer
pub async fn update_transport_server_status(writer: &dyn StatusWriter, ts: &TransportServer, ip: &str) {
    let status = TransportServerStatus {
        vs_address: ip.to_string(),
        status_ok: STATUS_OK.to_string(),
    };
    if ts.status.as_ref() == Some(&status) {
        return;
    }
    if let Err(e) = writer.transport_server_status(ts, &status).await {
        warn!(transport_server = %ts.name_any(), error = %e, "Failed to update TransportServer status");
    }
}

/// Publish the listener address of an IngressLink
pub async fn update_ingress_link_status(writer: &dyn StatusWriter, il: &IngressLink, ip: &str) {
    let status = IngressLinkStatus {
        vs_address: ip.to_string(),
    };
    if il.status.as_ref() == Some(&status) {
        return;
    }
    if let Err(e) = writer.ingress_link_status(il, &status).await {
        warn!(ingress_link = %il.name_any(), error = %e, "Failed to update IngressLink status");
    }
}

fn service_ingress_ips(svc: &Service) -> Vec<String> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
        .unwrap_or_default()
}

/// Publish `ip` as the Service's load-balancer ingress
pub async fn set_service_ingress(writer: &dyn StatusWriter, events: &dyn EventRecorder, svc: &Service, ip: &str) {
    let current = service_ingress_ips(svc);
    if current.iter().any(|c| c == ip) {
        return;
    }
    let object = svc.object_ref(&());
    match writer.service_ingress(svc, &[ip.to_string()]).await {
        Ok(()) => {
            events
                .record(&object, Severity::Normal, reasons::EXTERNAL_IP, &format!("Added external IP {}", ip))
                .await;
        }
        Err(e) => {
            warn!(service = %svc.name_any(), error = %e, "Failed to set load-balancer ingress");
            events
                .record(
                    &object,
                    Severity::Warning,
                    reasons::STATUS_IP_ERROR,
                    &format!("Error updating load-balancer ingress to {}: {}", ip, e),
                )
                .await;
        }
    }
}

/// Remove `ip` from the Service's load-balancer ingress
pub async fn unset_service_ingress(writer: &dyn StatusWriter, events: &dyn EventRecorder, svc: &Service, ip: &str) {
    let current = service_ingress_ips(svc);
    if !current.iter().any(|c| c == ip) {
        return;
    }
    let remaining: Vec<String> = current.into_iter().filter(|c| c != ip).collect();
    let object = svc.object_ref(&());
    match writer.service_ingress(svc, &remaining).await {
        Ok(()) => {
            events
                .record(&object, Severity::Normal, reasons::EXTERNAL_IP, &format!("Removed external IP {}", ip))
                .await;
        }
        Err(e) => {
            warn!(service = %svc.name_any(), error = %e, "Failed to unset load-balancer ingress");
            events
                .record(
                    &object,
                    Severity::Warning,
                    reasons::STATUS_IP_ERROR,
                    &format!("Error removing load-balancer ingress {}: {}", ip, e),
                )
                .await;
        }
    }
}

/// Clear every load-balancer ingress entry of the Service
pub async fn erase_service_ingress(writer: &dyn StatusWriter, svc: &Service) {
    if service_ingress_ips(svc).is_empty() {
        return;
    }
    if let Err(e) = writer.service_ingress(svc, &[]).await {
        warn!(service = %svc.name_any(), error = %e, "Failed to erase load-balancer ingress");
    }
}
