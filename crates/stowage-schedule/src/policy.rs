//! Run selection for a schedule
//!
//! Pure functions over the runs a schedule owns: phase detection, history
//! rotation, concurrency-policy victims, status summary and the run stamped
//! out for a fire time.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use stowage_common::crd::{
    is_condition_true, BackupRun, BackupSchedule, BackupScheduleStatus, ConditionStatus,
    RunCondition,
};
use stowage_common::kube_utils::{annotation, controller_owner_ref};
use stowage_common::{annotations, Error, API_GROUP, API_VERSION};

/// Where a run is in its life, as seen by its schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    /// Not processed by the run controller yet
    Uninitialized,
    /// Executing
    InProgress,
    /// Finished successfully
    Successful,
    /// Finished with an error
    Failed,
}

/// Phase of a run: the first true condition among Failed, Successful and
/// InProgress, in the order the conditions are stored
pub fn run_phase(run: &BackupRun) -> RunPhase {
    run.conditions()
        .iter()
        .filter(|c| c.status == ConditionStatus::True)
        .find_map(|c| match c.type_.as_str() {
            t if t == RunCondition::Failed.as_str() => Some(RunPhase::Failed),
            t if t == RunCondition::Successful.as_str() => Some(RunPhase::Successful),
            t if t == RunCondition::InProgress.as_str() => Some(RunPhase::InProgress),
            _ => None,
        })
        .unwrap_or(RunPhase::Uninitialized)
}

fn created_at(run: &BackupRun) -> Option<DateTime<Utc>> {
    run.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Runs to delete so that at most `limit` runs with the terminal `condition`
/// remain. Runs carrying the keep annotation neither count nor get deleted.
pub fn runs_above_limit(runs: &[BackupRun], condition: RunCondition, limit: u32) -> Vec<&BackupRun> {
    let mut matching: Vec<&BackupRun> = runs
        .iter()
        .filter(|r| is_condition_true(r.conditions(), condition.as_str()))
        .filter(|r| annotation(*r, annotations::KEEP).is_none())
        .collect();
    let limit = limit as usize;
    if matching.is_empty() || matching.len() < limit {
        return Vec::new();
    }
    matching.sort_by_key(|r| created_at(r));
    let excess = matching.len() - limit;
    matching.truncate(excess);
    matching
}

/// Runs currently executing
pub fn in_progress(runs: &[BackupRun]) -> Vec<&BackupRun> {
    runs.iter()
        .filter(|r| r.condition_is_true(RunCondition::InProgress))
        .collect()
}

/// Runs replaced by a new one: executing, or never picked up
pub fn runs_to_replace(runs: &[BackupRun]) -> Vec<&BackupRun> {
    runs.iter()
        .filter(|r| {
            r.condition_is_true(RunCondition::InProgress) || r.condition_is_true(RunCondition::NeverRun)
        })
        .collect()
}

fn reference(run: &BackupRun) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/{}", API_GROUP, API_VERSION)),
        kind: Some("BackupRun".to_string()),
        name: run.metadata.name.clone(),
        namespace: run.metadata.namespace.clone(),
        uid: run.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Recompute counters, active runs and the last successful time.
/// Uninitialized runs are left out.
pub fn summarize(runs: &[BackupRun], status: &mut BackupScheduleStatus) {
    let mut active = Vec::new();
    let (mut successful, mut failed) = (0u32, 0u32);
    let mut last_successful: Option<DateTime<Utc>> = None;

    for run in runs {
        match run_phase(run) {
            RunPhase::Uninitialized => {}
            RunPhase::InProgress => active.push(reference(run)),
            RunPhase::Failed => failed += 1,
            RunPhase::Successful => {
                successful += 1;
                last_successful = last_successful.max(created_at(run));
            }
        }
    }

    status.in_progress = active.len() as u32;
    status.successful = successful;
    status.failed = failed;
    status.total = status.in_progress + successful + failed;
    status.active = active;
    status.last_successful_time = last_successful;
}

/// Name of the run created for a fire time
pub fn run_name(schedule: &BackupSchedule, fire: DateTime<Utc>) -> String {
    format!("{}-{}", schedule.name_any(), fire.timestamp())
}

/// Run stamped out from the schedule's template for a fire time
pub fn run_from_schedule(schedule: &BackupSchedule, fire: DateTime<Utc>) -> Result<BackupRun, Error> {
    let template = &schedule.spec.template;
    let metadata = template.metadata.clone().unwrap_or_default();
    let non_empty = |m: std::collections::BTreeMap<String, String>| (!m.is_empty()).then_some(m);
    Ok(BackupRun {
        metadata: ObjectMeta {
            name: Some(run_name(schedule, fire)),
            namespace: schedule.namespace(),
            labels: non_empty(metadata.labels),
            annotations: non_empty(metadata.annotations),
            owner_references: Some(vec![controller_owner_ref(schedule)?]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;
    use stowage_common::crd::{
        BackupRunSpec, BackupRunStatus, BackupScheduleSpec, Condition, RunTemplate,
        StorageTarget, TemplateMetadata,
    };

    fn minute(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, 10, m, 0).unwrap()
    }

    fn run(name: &str, created: u32, conditions: &[(RunCondition, bool)]) -> BackupRun {
        let mut run = BackupRun::new(name, BackupRunSpec::default());
        run.metadata.namespace = Some("db".to_string());
        run.metadata.uid = Some(format!("{}-uid", name));
        run.metadata.creation_timestamp = Some(Time(minute(created)));
        run.status = Some(BackupRunStatus {
            conditions: conditions
                .iter()
                .map(|(c, v)| Condition::new(c.as_str(), ConditionStatus::from(*v), "Test", "test"))
                .collect(),
            ..Default::default()
        });
        run
    }

    fn kept(mut run: BackupRun) -> BackupRun {
        run.metadata.annotations = Some(BTreeMap::from([(
            annotations::KEEP.to_string(),
            "true".to_string(),
        )]));
        run
    }

    fn names(runs: Vec<&BackupRun>) -> Vec<String> {
        runs.into_iter().map(|r| r.name_any()).collect()
    }

    fn sample_schedule() -> BackupSchedule {
        let mut schedule = BackupSchedule::new(
            "pg",
            BackupScheduleSpec {
                schedule: "*/5 * * * *".to_string(),
                time_zone: None,
                starting_deadline_seconds: None,
                concurrency_policy: Default::default(),
                suspend: false,
                template: RunTemplate {
                    metadata: Some(TemplateMetadata {
                        labels: BTreeMap::from([("team".to_string(), "db".to_string())]),
                        annotations: BTreeMap::new(),
                    }),
                    spec: BackupRunSpec {
                        storage: StorageTarget {
                            name: "minio".to_string(),
                            path: "/pg/dump.sql".to_string(),
                        },
                        ..Default::default()
                    },
                },
                successful_runs_history_limit: 3,
                failed_runs_history_limit: 1,
            },
        );
        schedule.metadata.namespace = Some("db".to_string());
        schedule.metadata.uid = Some("schedule-uid".to_string());
        schedule
    }

    #[test]
    fn test_phase_follows_condition_order() {
        assert_eq!(run_phase(&run("a", 0, &[])), RunPhase::Uninitialized);
        assert_eq!(
            run_phase(&run("b", 0, &[(RunCondition::Ready, true), (RunCondition::NeverRun, true)])),
            RunPhase::Uninitialized
        );
        assert_eq!(
            run_phase(&run("c", 0, &[(RunCondition::InProgress, true)])),
            RunPhase::InProgress
        );
        assert_eq!(
            run_phase(&run(
                "d",
                0,
                &[(RunCondition::Ready, true), (RunCondition::Successful, true)]
            )),
            RunPhase::Successful
        );
        assert_eq!(
            run_phase(&run("e", 0, &[(RunCondition::Failed, true), (RunCondition::InProgress, false)])),
            RunPhase::Failed
        );
    }

    #[test]
    fn test_retention_deletes_oldest_above_limit() {
        let runs = vec![
            run("s3", 3, &[(RunCondition::Successful, true)]),
            run("s1", 1, &[(RunCondition::Successful, true)]),
            run("s4", 4, &[(RunCondition::Successful, true)]),
            run("s2", 2, &[(RunCondition::Successful, true)]),
            run("f1", 0, &[(RunCondition::Failed, true)]),
        ];
        assert_eq!(
            names(runs_above_limit(&runs, RunCondition::Successful, 2)),
            vec!["s1", "s2"]
        );
        assert!(runs_above_limit(&runs, RunCondition::Failed, 1).is_empty());
        assert!(runs_above_limit(&runs, RunCondition::Successful, 4).is_empty());
        assert_eq!(runs_above_limit(&runs, RunCondition::Successful, 0).len(), 4);
    }

    #[test]
    fn test_retention_ignores_kept_runs() {
        let runs = vec![
            kept(run("old", 0, &[(RunCondition::Failed, true)])),
            run("mid", 1, &[(RunCondition::Failed, true)]),
            run("new", 2, &[(RunCondition::Failed, true)]),
        ];
        assert_eq!(names(runs_above_limit(&runs, RunCondition::Failed, 1)), vec!["mid"]);
    }

    #[test]
    fn test_replace_targets_running_and_stale_runs() {
        let runs = vec![
            run("running", 0, &[(RunCondition::InProgress, true)]),
            run("stale", 1, &[(RunCondition::NeverRun, true)]),
            run("done", 2, &[(RunCondition::Successful, true)]),
            run("fresh", 3, &[]),
        ];
        assert_eq!(names(runs_to_replace(&runs)), vec!["running", "stale"]);
        assert_eq!(names(in_progress(&runs)), vec!["running"]);
    }

    #[test]
    fn test_summary_counts_initialized_runs() {
        let runs = vec![
            run("a", 0, &[(RunCondition::Successful, true)]),
            run("b", 5, &[(RunCondition::Successful, true)]),
            run("c", 7, &[(RunCondition::Failed, true)]),
            run("d", 9, &[(RunCondition::InProgress, true)]),
            run("e", 9, &[]),
        ];
        let mut status = BackupScheduleStatus {
            last_schedule_time: Some(minute(9)),
            ..Default::default()
        };
        summarize(&runs, &mut status);

        assert_eq!(status.total, 4);
        assert_eq!(status.successful, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.in_progress, 1);
        assert_eq!(status.active[0].name.as_deref(), Some("d"));
        assert_eq!(status.active[0].kind.as_deref(), Some("BackupRun"));
        assert_eq!(status.last_successful_time, Some(minute(5)));
        assert_eq!(status.last_schedule_time, Some(minute(9)));
    }

    #[test]
    fn test_run_is_stamped_from_template() {
        let schedule = sample_schedule();
        let run = run_from_schedule(&schedule, minute(10)).unwrap();

        assert_eq!(run.name_any(), format!("pg-{}", minute(10).timestamp()));
        assert_eq!(run.namespace().as_deref(), Some("db"));
        assert_eq!(run.labels().get("team").map(String::as_str), Some("db"));
        assert!(run.metadata.annotations.is_none());
        assert_eq!(run.spec.storage.name, "minio");

        let owner = &run.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "BackupSchedule");
        assert_eq!(owner.uid, "schedule-uid");
        assert_eq!(owner.controller, Some(true));
    }
}
