//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Reporting controller name on Kubernetes events
pub const CONTROLLER_NAME: &str = "lbops-loadbalancer-controller";

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

/// Sink for Kubernetes events about intent resources
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, object: &ObjectReference, severity: Severity, reason: &str, message: &str);
}

/// Recorder backed by `kube::runtime::events`
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    /// Recorder reporting as [`CONTROLLER_NAME`]
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, object: &ObjectReference, severity: Severity, reason: &str, message: &str) {
        let event = Event {
            type_: severity.into(),
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons
pub mod reasons {
    /// Address written to a LoadBalancer Service
    pub const EXTERNAL_IP: &str = "ExternalIP";
    /// Service status could not be updated
    pub const STATUS_IP_ERROR: &str = "StatusIPError";
    /// Group members disagree on address or lease label
    pub const GROUP_CONFLICT: &str = "GroupConflict";
    /// Policy or TLS problem for one listener
    pub const LISTENER_ERROR: &str = "ListenerError";
}
