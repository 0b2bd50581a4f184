//! Address lease protocol.
//!
//! Requests are written to the IPAM object's spec; the external allocator
//! answers in its status. Every read and write is a full-object get/update
//! cycle, so a concurrent writer fails the update with a conflict and the
//! calling work item is retried.

use crate::config::IpamRef;
use crds::{HostSpec, IPAM};
use ipam_client::{LeaseClientTrait, LeaseError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a lease request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// No lease object configured or present
    NotEnabled,
    /// Empty label, or neither host nor key given
    InvalidInput,
    /// A stale allocation is still present; retry once it is cleaned up
    NotRequested,
    /// Request recorded, allocation pending
    Requested,
    /// Allocator assigned this address
    Allocated(String),
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseStatus::NotEnabled => f.write_str("NotEnabled"),
            LeaseStatus::InvalidInput => f.write_str("InvalidInput"),
            LeaseStatus::NotRequested => f.write_str("NotRequested"),
            LeaseStatus::Requested => f.write_str("Requested"),
            LeaseStatus::Allocated(ip) => write!(f, "Allocated({})", ip),
        }
    }
}

/// Drives the request/release protocol against the lease object
#[derive(Clone)]
pub struct LeaseManager {
    client: Arc<dyn LeaseClientTrait>,
    ipam: Option<IpamRef>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager").field("ipam", &self.ipam).finish()
    }
}

impl LeaseManager {
    /// Manager over the lease object `ipam`; leasing is disabled when `None`
    pub fn new(client: Arc<dyn LeaseClientTrait>, ipam: Option<IpamRef>) -> Self {
        Self { client, ipam }
    }

    /// True when a lease object is configured
    pub fn is_enabled(&self) -> bool {
        self.ipam.is_some()
    }

    /// Current lease object, `None` when leasing is off or the object is missing
    pub async fn lease_object(&self) -> Result<Option<IPAM>, LeaseError> {
        let Some(ipam) = &self.ipam else {
            return Ok(None);
        };
        match self.client.get(&ipam.namespace, &ipam.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(LeaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Request an address for `host`, or for `key` when `host` is empty
    pub async fn request(&self, label: &str, host: &str, key: &str) -> Result<LeaseStatus, LeaseError> {
        let Some(mut ipam) = self.lease_object().await? else {
            return Ok(LeaseStatus::NotEnabled);
        };
        if label.is_empty() || (host.is_empty() && key.is_empty()) {
            return Ok(LeaseStatus::InvalidInput);
        }

        if let Some(existing) = ipam.spec.host_specs.iter().find(|s| s.is_for(host, key)) {
            if existing.ipam_label == label {
                let allocated = ipam.status.as_ref().and_then(|status| {
                    status
                        .ip_status
                        .iter()
                        .find(|ip| ip.is_for(host, key) && ip.ipam_label == label)
                        .map(|ip| ip.ip.clone())
                });
                return Ok(match allocated {
                    Some(ip) => LeaseStatus::Allocated(ip),
                    None => LeaseStatus::Requested,
                });
            }
            let old_label = existing.ipam_label.clone();
            info!(host, key, old_label = %old_label, new_label = label, "Lease label changed, releasing old request");
            self.release(&old_label, host, key).await?;
            ipam = match self.lease_object().await? {
                Some(obj) => obj,
                None => return Ok(LeaseStatus::NotEnabled),
            };
        }

        let orphaned = ipam.status.as_ref().is_some_and(|status| {
            status
                .ip_status
                .iter()
                .any(|ip| ip.is_for(host, key) && ip.ipam_label == label)
        });
        if orphaned {
            debug!(host, key, label, "Allocation without a request is still present");
            return Ok(LeaseStatus::NotRequested);
        }

        let entry = if host.is_empty() {
            HostSpec {
                host: String::new(),
                key: key.to_string(),
                ipam_label: label.to_string(),
            }
        } else {
            HostSpec {
                host: host.to_string(),
                key: String::new(),
                ipam_label: label.to_string(),
            }
        };
        ipam.spec.host_specs.push(entry);
        self.client.update(&ipam).await?;
        info!(host, key, label, "Requested address");
        Ok(LeaseStatus::Requested)
    }

    /// Delete the request for `host` (or `key`) and return any address the
    /// allocator had assigned to it
    pub async fn release(&self, label: &str, host: &str, key: &str) -> Result<Option<String>, LeaseError> {
        let Some(mut ipam) = self.lease_object().await? else {
            return Ok(None);
        };
        if host.is_empty() && key.is_empty() {
            return Ok(None);
        }

        let ip = ipam.status.as_ref().and_then(|status| {
            status
                .ip_status
                .iter()
                .find(|ip| ip.is_for(host, key) && (label.is_empty() || ip.ipam_label == label))
                .map(|ip| ip.ip.clone())
        });

        let before = ipam.spec.host_specs.len();
        ipam.spec
            .host_specs
            .retain(|s| !(s.is_for(host, key) && (label.is_empty() || s.ipam_label == label)));
        if ipam.spec.host_specs.len() != before {
            self.client.update(&ipam).await?;
            info!(host, key, label, ip = ip.as_deref().unwrap_or(""), "Released address");
        }
        Ok(ip)
    }
}
