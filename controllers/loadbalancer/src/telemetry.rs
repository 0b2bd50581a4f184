//! Resource counters.
//!
//! Written by the worker and read by the metrics endpoint, so every
//! read-modify-write happens under one mutex.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// What a counter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CounterKind {
    VirtualServer,
    TransportServer,
    IngressLink,
    ExternalDns,
    IpamVirtualServer,
    IpamTransportServer,
    IpamLoadBalancerService,
}

impl CounterKind {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::VirtualServer => "virtual_server",
            CounterKind::TransportServer => "transport_server",
            CounterKind::IngressLink => "ingress_link",
            CounterKind::ExternalDns => "external_dns",
            CounterKind::IpamVirtualServer => "ipam_virtual_server",
            CounterKind::IpamTransportServer => "ipam_transport_server",
            CounterKind::IpamLoadBalancerService => "ipam_lb_service",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    resources: BTreeMap<(CounterKind, String), i64>,
    publishes: u64,
    publish_failures: u64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub resources: BTreeMap<(CounterKind, String), i64>,
    pub publishes: u64,
    pub publish_failures: u64,
}

/// Counters shared by the worker and the metrics endpoint
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: Mutex<Counters>,
}

impl Telemetry {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overwrite the count of a kind in a namespace
    pub fn set(&self, kind: CounterKind, namespace: &str, count: usize) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.lock().resources.insert((kind, namespace.to_string()), count);
    }

    /// Decrement, never below zero
    pub fn decrement(&self, kind: CounterKind, namespace: &str) {
        let mut counters = self.lock();
        let entry = counters.resources.entry((kind, namespace.to_string())).or_insert(0);
        *entry = (*entry - 1).max(0);
    }

    /// Current count, zero when never set
    pub fn get(&self, kind: CounterKind, namespace: &str) -> i64 {
        self.lock()
            .resources
            .get(&(kind, namespace.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Count one publish attempt
    pub fn record_publish(&self, ok: bool) {
        let mut counters = self.lock();
        if ok {
            counters.publishes += 1;
        } else {
            counters.publish_failures += 1;
        }
    }

    /// Copy of all counters
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let counters = self.lock();
        TelemetrySnapshot {
            resources: counters.resources.clone(),
            publishes: counters.publishes,
            publish_failures: counters.publish_failures,
        }
    }
}
