//! BackupStorage Custom Resource Definition
//!
//! A BackupStorage binds a name to an object-store provider configuration and
//! its credentials. It is cluster-scoped so runs in any namespace can use it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretReference};

/// Condition type reported by the storage controller
pub const STORAGE_READY: &str = "Ready";

/// Specification for a BackupStorage
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup-operator.io",
    version = "v1",
    kind = "BackupStorage",
    plural = "backupstorages",
    shortname = "bt",
    status = "BackupStorageStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Schedules","type":"integer","jsonPath":".status.schedules"}"#,
    printcolumn = r#"{"name":"Runs","type":"integer","jsonPath":".status.runs"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".status.size"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageSpec {
    /// Provider type (currently `s3`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Provider-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Secret holding provider credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<SecretReference>,
}

/// Status of a BackupStorage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageStatus {
    /// Readiness condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Schedules controlled by this storage
    #[serde(default)]
    pub schedules: u32,

    /// Runs stored in this storage
    #[serde(default)]
    pub runs: u32,

    /// Human-readable occupied size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Occupied size in bytes
    #[serde(default)]
    pub size_in_bytes: u64,
}
