//! Kubernetes Event recording for stowage controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "MissedTime")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "stowage-run-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Run finished
    pub const COMPLETED: &str = "Completed";
    /// Resource lost readiness
    pub const UNHEALTHY: &str = "Unhealthy";
    /// Child object created
    pub const CREATED: &str = "Created";
    /// Child object deleted
    pub const DELETED: &str = "Deleted";
    /// A lifecycle hook failed
    pub const FAILED: &str = "Failed";
    /// Spec rejected by validation
    pub const INVALID: &str = "Invalid";
    /// Destructor is holding deletion back
    pub const FINALIZING: &str = "Finalizing";
    /// Run is configured with encryption
    pub const ENCRYPTION: &str = "Encryption";
    /// Run is configured with compression
    pub const COMPRESSION: &str = "Compression";
    /// Schedule fire time passed beyond its starting deadline
    pub const MISSED_TIME: &str = "MissedTime";
    /// Storage provider rebuilt after a configuration change
    pub const RECONFIGURED: &str = "Reconfigured";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// One-time initialization
    pub const INITIALIZE: &str = "Initialize";
    /// Creating a BackupRun from a schedule
    pub const SCHEDULE: &str = "Schedule";
    /// Streaming a backup into storage
    pub const BACKUP: &str = "Backup";
    /// Streaming a backup out of storage
    pub const RESTORE: &str = "Restore";
    /// Configuring a storage provider
    pub const CONFIGURE: &str = "Configure";
    /// Tearing a resource down
    pub const DELETE: &str = "Delete";
}
