//! Mock LeaseClient for unit testing
//!
//! Stores IPAM objects in memory, enforces resourceVersion checks on update
//! like the API server does, and exposes helpers that let a test play the
//! external allocator.

use crate::error::LeaseError;
use crate::lease_trait::LeaseClientTrait;
use crds::{HostSpec, IPAMSpec, IPAMStatus, IPSpec, IPAM};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock LeaseClient for testing
#[derive(Clone, Debug, Default)]
pub struct MockLeaseClient {
    objects: Arc<Mutex<HashMap<(String, String), IPAM>>>,
    next_version: Arc<Mutex<u64>>,
    update_calls: Arc<Mutex<u32>>,
    fail_gets: Arc<Mutex<bool>>,
    conflict_next_update: Arc<Mutex<bool>>,
}

impl MockLeaseClient {
    /// Create an empty mock (no IPAM object present)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock holding an empty IPAM object
    pub fn with_object(namespace: &str, name: &str) -> Self {
        let mock = Self::new();
        mock.insert(IPAM {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: IPAMSpec::default(),
            status: None,
        });
        mock
    }

    fn bump_version(&self) -> String {
        let mut version = self.next_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    /// Insert or replace an IPAM object (for test setup)
    pub fn insert(&self, mut ipam: IPAM) {
        let key = (
            ipam.metadata.namespace.clone().unwrap_or_default(),
            ipam.metadata.name.clone().unwrap_or_default(),
        );
        ipam.metadata.resource_version = Some(self.bump_version());
        self.objects.lock().unwrap().insert(key, ipam);
    }

    /// Current state of an IPAM object
    pub fn object(&self, namespace: &str, name: &str) -> Option<IPAM> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Current spec entries of an IPAM object
    pub fn host_specs(&self, namespace: &str, name: &str) -> Vec<HostSpec> {
        self.object(namespace, name)
            .map(|o| o.spec.host_specs)
            .unwrap_or_default()
    }

    /// Number of successful update calls
    pub fn update_calls(&self) -> u32 {
        *self.update_calls.lock().unwrap()
    }

    /// Play the allocator: write an IP into the status for a request
    pub fn allocate(&self, namespace: &str, name: &str, host: &str, key: &str, label: &str, ip: &str) {
        let version = self.bump_version();
        let mut objects = self.objects.lock().unwrap();
        if let Some(ipam) = objects.get_mut(&(namespace.to_string(), name.to_string())) {
            let status = ipam.status.get_or_insert_with(IPAMStatus::default);
            status.ip_status.retain(|s| !s.is_for(host, key));
            status.ip_status.push(IPSpec {
                host: host.to_string(),
                key: key.to_string(),
                ipam_label: label.to_string(),
                ip: ip.to_string(),
            });
            ipam.metadata.resource_version = Some(version);
        }
    }

    /// Play the allocator: drop status entries for a host or key
    pub fn deallocate(&self, namespace: &str, name: &str, host: &str, key: &str) {
        let version = self.bump_version();
        let mut objects = self.objects.lock().unwrap();
        if let Some(ipam) = objects.get_mut(&(namespace.to_string(), name.to_string())) {
            if let Some(status) = ipam.status.as_mut() {
                status.ip_status.retain(|s| !s.is_for(host, key));
            }
            ipam.metadata.resource_version = Some(version);
        }
    }

    /// Make every subsequent `get` fail as if the API server were unreachable
    pub fn set_fail_gets(&self, fail: bool) {
        *self.fail_gets.lock().unwrap() = fail;
    }

    /// Make the next `update` fail with a conflict
    pub fn conflict_next_update(&self) {
        *self.conflict_next_update.lock().unwrap() = true;
    }
}

#[async_trait::async_trait]
impl LeaseClientTrait for MockLeaseClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<IPAM, LeaseError> {
        if *self.fail_gets.lock().unwrap() {
            return Err(LeaseError::Unavailable(format!("{}/{}", namespace, name)));
        }
        self.object(namespace, name)
            .ok_or_else(|| LeaseError::NotFound(format!("{}/{}", namespace, name)))
    }

    async fn update(&self, ipam: &IPAM) -> Result<IPAM, LeaseError> {
        let namespace = ipam.metadata.namespace.clone().unwrap_or_default();
        let name = ipam.metadata.name.clone().ok_or_else(|| {
            LeaseError::InvalidReference("IPAM object has no name".to_string())
        })?;
        let what = format!("{}/{}", namespace, name);

        {
            let mut conflict = self.conflict_next_update.lock().unwrap();
            if *conflict {
                *conflict = false;
                return Err(LeaseError::Conflict(what));
            }
        }

        let version = self.bump_version();
        let mut objects = self.objects.lock().unwrap();
        let current = objects
            .get_mut(&(namespace, name))
            .ok_or_else(|| LeaseError::NotFound(what.clone()))?;
        if current.metadata.resource_version != ipam.metadata.resource_version {
            return Err(LeaseError::Conflict(what));
        }

        current.spec = ipam.spec.clone();
        current.metadata.resource_version = Some(version);
        *self.update_calls.lock().unwrap() += 1;
        Ok(current.clone())
    }
}
