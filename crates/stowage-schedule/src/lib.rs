//! BackupSchedule handling for stowage
//!
//! - **engine**: cron evaluation with missed-run detection
//! - **policy**: run phase, history rotation, concurrency victims, status summary
//! - **controller**: the BackupSchedule reconciler

#![deny(missing_docs)]

pub mod controller;
pub mod engine;
pub mod policy;

pub use controller::{error_policy, reconcile, Context};
pub use engine::{evaluate, Fire, ScheduleError, ScheduleInput};
