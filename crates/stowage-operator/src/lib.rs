//! stowage operator: CLI wiring, CRD installation and controller startup

#![deny(missing_docs)]

pub mod controller_runner;
pub mod crds;
