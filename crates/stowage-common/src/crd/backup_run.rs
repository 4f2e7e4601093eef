//! BackupRun Custom Resource Definition
//!
//! A BackupRun is one concrete backup or restore execution. The operator
//! launches a pod from `spec.template`, execs the configured command inside
//! it and streams the bytes through optional compression and encryption into
//! (or out of) the BackupStorage named in `spec.storage`.

use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretKeyReference, TemplateMetadata};
use crate::Error;

/// Whether the backup object outlives its BackupRun
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RetainPolicy {
    /// Delete the object from storage together with the run
    Delete,
    /// Keep the object in storage
    #[default]
    Retain,
}

/// Command executed inside the run pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunAction {
    /// Container to exec into
    pub container: String,

    /// Command to execute; a backup command must stream to stdout, a restore
    /// command must read from stdin
    pub command: Vec<String>,

    /// Arguments appended to the command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Deadline for the command to complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<u64>,
}

impl RunAction {
    /// Full argv: command followed by args
    pub fn argv(&self) -> Vec<String> {
        self.command.iter().chain(self.args.iter()).cloned().collect()
    }
}

/// Where the backup object lives
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageTarget {
    /// Name of the BackupStorage
    pub name: String,

    /// Object path inside the storage
    pub path: String,
}

/// Compression algorithm
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// gzip (RFC 1952)
    #[default]
    Gzip,
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

/// Compression settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSpec {
    /// Algorithm to use
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,

    /// Level from -2 (huffman only) and -1 (default) up to 9 (best)
    #[serde(default)]
    pub level: i8,
}

/// Encryption settings (age X25519)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    /// age recipients (`age1...`)
    pub recipients: Vec<String>,

    /// Secret key holding the age identity, required for automatic restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_key: Option<SecretKeyReference>,
}

/// Pod used as the execution sandbox
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Extra labels and annotations for the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,

    /// Pod specification; containers must stay alive long enough to be exec'd into
    pub spec: PodSpec,
}

/// Specification for a BackupRun
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup-operator.io",
    version = "v1",
    kind = "BackupRun",
    plural = "backupruns",
    shortname = "backr",
    namespaced,
    status = "BackupRunStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Restorable","type":"string","jsonPath":".status.conditions[?(@.type==\"Restorable\")].status","priority":1}"#,
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.storage.path","priority":1}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".status.size","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupRunSpec {
    /// What happens to the backup object when the run is deleted
    #[serde(default)]
    pub retain_policy: RetainPolicy,

    /// Backup action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<RunAction>,

    /// Restore action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RunAction>,

    /// Storage binding
    pub storage: StorageTarget,

    /// Optional compression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionSpec>,

    /// Optional encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSpec>,

    /// Execution pod template
    pub template: PodTemplate,
}

impl BackupRunSpec {
    /// Restore-only mode: restore configured without a backup action
    pub fn is_restore_only(&self) -> bool {
        self.backup.is_none() && self.restore.is_some()
    }

    /// Validate cross-field constraints the schema cannot express
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        if self.backup.is_none() && self.restore.is_none() {
            return Err(Error::validation_for_field(
                name,
                "spec",
                "at least one of backup or restore must be set",
            ));
        }
        if self.is_restore_only() && self.retain_policy == RetainPolicy::Delete {
            return Err(Error::validation_for_field(
                name,
                "spec.retainPolicy",
                "restore-only runs must use the Retain policy",
            ));
        }
        for (field, action) in [("spec.backup", &self.backup), ("spec.restore", &self.restore)] {
            if let Some(action) = action {
                if action.command.is_empty() {
                    return Err(Error::validation_for_field(name, field, "command must not be empty"));
                }
            }
        }
        if let Some(compression) = &self.compression {
            if !(-2..=9).contains(&compression.level) {
                return Err(Error::validation_for_field(
                    name,
                    "spec.compression.level",
                    "level must be between -2 and 9",
                ));
            }
        }
        if let Some(encryption) = &self.encryption {
            if encryption.recipients.is_empty() {
                return Err(Error::validation_for_field(
                    name,
                    "spec.encryption.recipients",
                    "at least one recipient is required",
                ));
            }
        }
        Ok(())
    }
}

/// Condition types maintained on a BackupRun
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunCondition {
    /// Last action finished successfully
    Ready,
    /// Neither in progress nor finished
    NeverRun,
    /// An action is executing
    InProgress,
    /// Last action succeeded
    Successful,
    /// Last action failed
    Failed,
    /// Backup can be restored automatically
    Restorable,
    /// Backup is encrypted
    Encrypted,
    /// Backup is compressed
    Compressed,
}

impl RunCondition {
    /// Every condition type, in the order they are written
    pub const ALL: [RunCondition; 8] = [
        RunCondition::Ready,
        RunCondition::NeverRun,
        RunCondition::InProgress,
        RunCondition::Failed,
        RunCondition::Successful,
        RunCondition::Restorable,
        RunCondition::Encrypted,
        RunCondition::Compressed,
    ];

    /// The `type` string stored in the condition
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NeverRun => "NeverRun",
            Self::InProgress => "InProgress",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
            Self::Restorable => "Restorable",
            Self::Encrypted => "Encrypted",
            Self::Compressed => "Compressed",
        }
    }
}

impl std::fmt::Display for RunCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a BackupRun
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRunStatus {
    /// Condition set keyed by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Free-text state label (Backuping, BackupSuccessful, StorageError, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Name of the launched pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Human-readable backup size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Backup size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<u64>,
}

impl BackupRun {
    /// Conditions of the run, empty when status was never written
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// True when the given condition is present and True
    pub fn condition_is_true(&self, condition: RunCondition) -> bool {
        super::types::is_condition_true(self.conditions(), condition.as_str())
    }
}
