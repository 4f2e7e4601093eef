//! BackupSchedule Custom Resource Definition
//!
//! A BackupSchedule stamps out BackupRuns from a template on a cron cadence,
//! applies a concurrency policy to overlapping runs and rotates finished runs
//! according to the history limits.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup_run::BackupRunSpec;
use super::types::{Condition, TemplateMetadata};

/// How overlapping runs of one schedule are handled
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Runs may overlap
    Allow,
    /// Skip the new run while another one is in progress
    Forbid,
    /// Delete in-progress and never-run runs before creating the new one
    #[default]
    Replace,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "Allow"),
            Self::Forbid => write!(f, "Forbid"),
            Self::Replace => write!(f, "Replace"),
        }
    }
}

/// Template BackupRuns are created from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunTemplate {
    /// Labels and annotations copied onto each created run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,

    /// Spec of each created run
    pub spec: BackupRunSpec,
}

fn default_successful_limit() -> u32 {
    3
}

fn default_failed_limit() -> u32 {
    1
}

/// Specification for a BackupSchedule
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup-operator.io",
    version = "v1",
    kind = "BackupSchedule",
    plural = "backupschedules",
    shortname = "bs",
    namespaced,
    status = "BackupScheduleStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Suspend","type":"boolean","jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".status.inProgress"}"#,
    printcolumn = r#"{"name":"Last Schedule","type":"date","jsonPath":".status.lastScheduleTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Standard 5-field cron expression
    pub schedule: String,

    /// IANA time zone name the expression is evaluated in (default UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,

    /// Seconds after a missed fire time during which a run may still start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    /// Overlap handling
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Stop creating new runs; in-flight runs are unaffected
    #[serde(default)]
    pub suspend: bool,

    /// Run template
    pub template: RunTemplate,

    /// Successful runs kept before rotation
    #[serde(default = "default_successful_limit")]
    pub successful_runs_history_limit: u32,

    /// Failed runs kept before rotation
    #[serde(default = "default_failed_limit")]
    pub failed_runs_history_limit: u32,
}

/// Status of a BackupSchedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleStatus {
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Number of initialized runs owned by this schedule
    #[serde(default)]
    pub total: u32,

    /// Runs that finished successfully
    #[serde(default)]
    pub successful: u32,

    /// Runs that failed
    #[serde(default)]
    pub failed: u32,

    /// Runs currently executing
    #[serde(default)]
    pub in_progress: u32,

    /// References to runs currently executing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<ObjectReference>,

    /// Fire time of the most recently created run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,

    /// Creation time of the latest successful run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<DateTime<Utc>>,
}

impl BackupSchedule {
    /// Last fire time recorded in status
    pub fn last_schedule_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.last_schedule_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let spec: BackupScheduleSpec = serde_yaml::from_str(
            r#"
schedule: "*/5 * * * *"
template:
  metadata:
    labels: {team: db}
  spec:
    backup:
      container: pg
      command: ["pg_dumpall"]
    storage: {name: minio, path: /pg/dump.sql}
    template:
      spec:
        containers: []
"#,
        )
        .expect("parse schedule");
        assert_eq!(spec.concurrency_policy, ConcurrencyPolicy::Replace);
        assert!(!spec.suspend);
        assert_eq!(spec.successful_runs_history_limit, 3);
        assert_eq!(spec.failed_runs_history_limit, 1);
        assert!(spec.time_zone.is_none());
        assert_eq!(
            spec.template.metadata.unwrap().labels.get("team").map(String::as_str),
            Some("db")
        );
    }

    #[test]
    fn test_status_round_trips_camel_case() {
        let status = BackupScheduleStatus {
            in_progress: 1,
            last_schedule_time: Some(Utc::now()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["inProgress"], 1);
        assert!(value.get("lastScheduleTime").is_some());
        assert!(value.get("active").is_none());
    }

    #[test]
    fn test_policy_display() {
        assert_eq!(ConcurrencyPolicy::Forbid.to_string(), "Forbid");
    }
}
