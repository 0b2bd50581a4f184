//! Work items.
//!
//! Every watched kind is one variant of [`Resource`]; the dispatcher matches
//! on it exhaustively, so adding a kind without a handler does not compile.

use crds::{ExternalDNS, IngressLink, Policy, TLSProfile, TransportServer, VirtualServer, IPAM};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service};
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;

/// Kind of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    VirtualServer,
    TransportServer,
    IngressLink,
    ExternalDns,
    Policy,
    TlsProfile,
    Service,
    Endpoints,
    Namespace,
    Ipam,
}

impl ResourceKind {
    /// Kind name used in keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::VirtualServer => "VirtualServer",
            ResourceKind::TransportServer => "TransportServer",
            ResourceKind::IngressLink => "IngressLink",
            ResourceKind::ExternalDns => "ExternalDNS",
            ResourceKind::Policy => "Policy",
            ResourceKind::TlsProfile => "TLSProfile",
            ResourceKind::Service => "Service",
            ResourceKind::Endpoints => "Endpoints",
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Ipam => "IPAM",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched object, shared with the cache it came from
#[derive(Debug, Clone)]
pub enum Resource {
    VirtualServer(Arc<VirtualServer>),
    TransportServer(Arc<TransportServer>),
    IngressLink(Arc<IngressLink>),
    ExternalDns(Arc<ExternalDNS>),
    Policy(Arc<Policy>),
    TlsProfile(Arc<TLSProfile>),
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    Namespace(Arc<Namespace>),
    Ipam(Arc<IPAM>),
}

impl Resource {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::VirtualServer(_) => ResourceKind::VirtualServer,
            Resource::TransportServer(_) => ResourceKind::TransportServer,
            Resource::IngressLink(_) => ResourceKind::IngressLink,
            Resource::ExternalDns(_) => ResourceKind::ExternalDns,
            Resource::Policy(_) => ResourceKind::Policy,
            Resource::TlsProfile(_) => ResourceKind::TlsProfile,
            Resource::Service(_) => ResourceKind::Service,
            Resource::Endpoints(_) => ResourceKind::Endpoints,
            Resource::Namespace(_) => ResourceKind::Namespace,
            Resource::Ipam(_) => ResourceKind::Ipam,
        }
    }

    /// Namespace of the object (empty for cluster-scoped kinds)
    pub fn namespace(&self) -> String {
        let ns = match self {
            Resource::VirtualServer(r) => r.namespace(),
            Resource::TransportServer(r) => r.namespace(),
            Resource::IngressLink(r) => r.namespace(),
            Resource::ExternalDns(r) => r.namespace(),
            Resource::Policy(r) => r.namespace(),
            Resource::TlsProfile(r) => r.namespace(),
            Resource::Service(r) => r.namespace(),
            Resource::Endpoints(r) => r.namespace(),
            Resource::Namespace(_) => None,
            Resource::Ipam(r) => r.namespace(),
        };
        ns.unwrap_or_default()
    }

    /// Name of the wrapped object
    pub fn name(&self) -> String {
        match self {
            Resource::VirtualServer(r) => r.name_any(),
            Resource::TransportServer(r) => r.name_any(),
            Resource::IngressLink(r) => r.name_any(),
            Resource::ExternalDns(r) => r.name_any(),
            Resource::Policy(r) => r.name_any(),
            Resource::TlsProfile(r) => r.name_any(),
            Resource::Service(r) => r.name_any(),
            Resource::Endpoints(r) => r.name_any(),
            Resource::Namespace(r) => r.name_any(),
            Resource::Ipam(r) => r.name_any(),
        }
    }
}

/// Queue identity of a work item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub delete: bool,
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)?;
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)?;
        }
        if self.delete {
            f.write_str(" (deleted)")?;
        }
        Ok(())
    }
}

/// A resource plus whether it was deleted
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub resource: Resource,
    pub delete: bool,
}

impl WorkItem {
    /// Work item for `resource`; `delete` marks a removal
    pub fn new(resource: Resource, delete: bool) -> Self {
        Self { resource, delete }
    }

    /// Deduplication key
    pub fn key(&self) -> WorkKey {
        WorkKey {
            kind: self.resource.kind(),
            namespace: self.resource.namespace(),
            name: self.resource.name(),
            delete: self.delete,
        }
    }
}
