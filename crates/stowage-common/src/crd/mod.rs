//! Custom Resource Definitions for stowage
//!
//! This module contains all CRD definitions used by the stowage operator.

mod backup_run;
mod backup_schedule;
mod backup_storage;
mod types;

pub use backup_run::{
    BackupRun, BackupRunSpec, BackupRunStatus, CompressionAlgorithm, CompressionSpec,
    EncryptionSpec, PodTemplate, RetainPolicy, RunAction, RunCondition, StorageTarget,
};
pub use backup_schedule::{
    BackupSchedule, BackupScheduleSpec, BackupScheduleStatus, ConcurrencyPolicy, RunTemplate,
};
pub use backup_storage::{BackupStorage, BackupStorageSpec, BackupStorageStatus, STORAGE_READY};
pub use types::{
    add_condition_if_missing, find_condition, is_condition_true, set_condition, Condition,
    ConditionStatus, SecretKeyReference, SecretReference, TemplateMetadata,
};
