//! BackupRun execution for stowage
//!
//! - **state**: flag derivation, transitions and interruption detection
//! - **codec**: gzip and age stream stages
//! - **exec**: streaming exec into the run pod
//! - **pipeline**: wiring exec, codecs and storage into one transfer
//! - **pod**: execution pod construction and readiness
//! - **controller**: the BackupRun reconciler

#![deny(missing_docs)]

pub mod codec;
pub mod controller;
pub mod exec;
pub mod pipeline;
pub mod pod;
pub mod state;

pub use controller::{error_policy, reconcile, Context};
pub use state::{LivenessSet, Phase, RunState};
