//! Common types for stowage: CRDs, errors, and controller plumbing

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod lifecycle;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// API group shared by every stowage resource
pub const API_GROUP: &str = "backup-operator.io";

/// API version shared by every stowage resource
pub const API_VERSION: &str = "v1";

/// Finalizer guarding deletion of every stowage resource
pub const FINALIZER: &str = "backup-operator.io/v1";

/// Field manager used for patches issued by the operator
pub const FIELD_MANAGER: &str = "stowage-operator";

/// Requeue interval for healthy resources that still want periodic refresh (5 minutes)
pub const REQUEUE_SUCCESS_SECS: u64 = 300;

/// Requeue interval after a reconcile error (60 seconds)
pub const REQUEUE_ERROR_SECS: u64 = 60;

/// Annotation keys recognized on stowage resources.
pub mod annotations {
    /// Exempts a finished BackupRun from history-limit rotation
    pub const KEEP: &str = "backup-operator.io/keep";
    /// Requests (re-)restoration of a BackupRun
    pub const RESTORE: &str = "backup-operator.io/restore";
    /// Written by the operator once a restoration completed
    pub const RESTORED_AT: &str = "backup-operator.io/restored-at";
    /// Fires a BackupSchedule immediately, cleared once consumed
    pub const TRIGGER: &str = "backup-operator.io/trigger";
    /// Blocks BackupStorage deletion until removed by hand
    pub const DELETION_PROTECTION: &str = "backup-operator.io/deletion-protection";
}
