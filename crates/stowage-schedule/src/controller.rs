//! BackupSchedule controller
//!
//! Each reconcile refreshes the status, rotates finished runs, evaluates the
//! cron expression and, when a fire time was missed, creates the run for it
//! under the schedule's concurrency policy. The reconcile is requeued for the
//! next fire time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stowage_common::crd::{
    BackupRun, BackupSchedule, BackupScheduleStatus, BackupStorage, ConcurrencyPolicy,
    RunCondition,
};
use stowage_common::events::{actions, reasons, EventPublisher};
use stowage_common::kube_utils::{annotation, controller_owner_ref, controller_uid, is_controlled_by};
use stowage_common::lifecycle::{KubeFinalizerGuard, Lifecycle, LifecycleHooks, Outcome};
use stowage_common::retry::retry_on_conflict;
use stowage_common::{annotations, Error, FIELD_MANAGER, REQUEUE_ERROR_SECS};

use crate::engine::{evaluate, ScheduleInput};
use crate::policy::{in_progress, run_from_schedule, runs_above_limit, runs_to_replace, summarize};

/// A run recorded less than this long ago blocks another one
const DOUBLE_FIRE_GUARD_SECS: i64 = 60;

/// Kubernetes operations needed by the schedule controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScheduleClient: Send + Sync {
    /// Get a BackupSchedule
    async fn get_schedule(&self, namespace: &str, name: &str)
        -> Result<Option<BackupSchedule>, Error>;

    /// Replace the status of `schedule`, conditional on its resourceVersion
    async fn patch_status(
        &self,
        schedule: &BackupSchedule,
        status: &BackupScheduleStatus,
    ) -> Result<(), Error>;

    /// Replace the owner references of a schedule, conditional on its resourceVersion
    async fn patch_owners(
        &self,
        schedule: &BackupSchedule,
        owners: &[OwnerReference],
    ) -> Result<(), Error>;

    /// Remove an annotation from a schedule
    async fn remove_annotation(&self, namespace: &str, name: &str, key: &str)
        -> Result<(), Error>;

    /// Get a BackupStorage by name
    async fn get_storage(&self, name: &str) -> Result<Option<BackupStorage>, Error>;

    /// List BackupRuns in a namespace
    async fn list_runs(&self, namespace: &str) -> Result<Vec<BackupRun>, Error>;

    /// Create a BackupRun
    async fn create_run(&self, run: &BackupRun) -> Result<(), Error>;

    /// Delete a BackupRun in the background, ignoring a missing run
    async fn delete_run(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`ScheduleClient`] backed by the Kubernetes API
pub struct ScheduleClientImpl {
    client: Client,
}

impl ScheduleClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn schedules(&self, namespace: &str) -> Api<BackupSchedule> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ScheduleClient for ScheduleClientImpl {
    async fn get_schedule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupSchedule>, Error> {
        Ok(self.schedules(namespace).get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        schedule: &BackupSchedule,
        status: &BackupScheduleStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": schedule.resource_version() },
            "status": status,
        });
        self.schedules(&schedule.namespace().unwrap_or_default())
            .patch_status(
                &schedule.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_owners(
        &self,
        schedule: &BackupSchedule,
        owners: &[OwnerReference],
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": schedule.resource_version(),
                "ownerReferences": owners,
            }
        });
        self.schedules(&schedule.namespace().unwrap_or_default())
            .patch(
                &schedule.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_annotation(&self, namespace: &str, name: &str, key: &str) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: null } }
        });
        self.schedules(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_storage(&self, name: &str) -> Result<Option<BackupStorage>, Error> {
        let api: Api<BackupStorage> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_runs(&self, namespace: &str) -> Result<Vec<BackupRun>, Error> {
        let api: Api<BackupRun> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_run(&self, run: &BackupRun) -> Result<(), Error> {
        let api: Api<BackupRun> =
            Api::namespaced(self.client.clone(), &run.namespace().unwrap_or_default());
        api.create(&PostParams::default(), run).await?;
        Ok(())
    }

    async fn delete_run(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<BackupRun> = Api::namespaced(self.client.clone(), namespace);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &dp).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Shared state of the schedule controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn ScheduleClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    lifecycle: Lifecycle,
}

impl Context {
    /// Create a context talking to the cluster through `client`
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        let guard = Arc::new(KubeFinalizerGuard::<BackupSchedule>::namespaced(client.clone()));
        Self {
            kube: Arc::new(ScheduleClientImpl::new(client)),
            lifecycle: Lifecycle::new(guard, events.clone()),
            events,
        }
    }

    /// Create a context for tests with a mocked client and no-op finalizers
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ScheduleClient>, events: Arc<dyn EventPublisher>) -> Self {
        use stowage_common::lifecycle::NoopFinalizerGuard;
        Self {
            kube,
            lifecycle: Lifecycle::new(Arc::new(NoopFinalizerGuard), events.clone()),
            events,
        }
    }

    async fn update_status(
        &self,
        schedule: &BackupSchedule,
        mutate: impl Fn(&mut BackupScheduleStatus) + Send + Sync,
    ) -> Result<(), Error> {
        let namespace = schedule.namespace().unwrap_or_default();
        let name = schedule.name_any();
        let (namespace, name, mutate) = (&namespace, &name, &mutate);
        retry_on_conflict("schedule_status", move || async move {
            let Some(fresh) = self.kube.get_schedule(namespace, name).await? else {
                return Ok(());
            };
            let current = fresh.status.clone().unwrap_or_default();
            let mut next = current.clone();
            mutate(&mut next);
            if next == current {
                return Ok(());
            }
            self.kube.patch_status(&fresh, &next).await
        })
        .await
    }

    /// Runs controlled by the schedule
    async fn owned_runs(&self, schedule: &BackupSchedule) -> Result<Vec<BackupRun>, Error> {
        let uid = schedule.uid().unwrap_or_default();
        Ok(self
            .kube
            .list_runs(&schedule.namespace().unwrap_or_default())
            .await?
            .into_iter()
            .filter(|r| is_controlled_by(r, &uid))
            .collect())
    }

    async fn refresh_status(&self, schedule: &BackupSchedule) -> Result<BackupScheduleStatus, Error> {
        let runs = self.owned_runs(schedule).await?;
        let mut summary = schedule.status.clone().unwrap_or_default();
        summarize(&runs, &mut summary);
        self.update_status(schedule, |status| summarize(&runs, status))
            .await?;
        debug!(
            schedule = %schedule.name_any(),
            total = summary.total,
            in_progress = summary.in_progress,
            successful = summary.successful,
            failed = summary.failed,
            "runs count"
        );
        Ok(summary)
    }

    async fn rotate(
        &self,
        schedule: &BackupSchedule,
        condition: RunCondition,
        limit: u32,
    ) -> Result<(), Error> {
        let runs = self.owned_runs(schedule).await?;
        let victims = runs_above_limit(&runs, condition, limit);
        for run in &victims {
            self.kube
                .delete_run(&run.namespace().unwrap_or_default(), &run.name_any())
                .await?;
        }
        if !victims.is_empty() {
            info!(
                schedule = %schedule.name_any(),
                condition = condition.as_str(),
                count = victims.len(),
                "deleted runs above the history limit"
            );
        }
        Ok(())
    }

    async fn publish(&self, schedule: &BackupSchedule, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(
                &schedule.object_ref(&()),
                type_,
                reason,
                actions::SCHEDULE,
                Some(note),
            )
            .await;
    }

    /// Process the schedule as of `now`
    pub async fn process_at(
        &self,
        schedule: &BackupSchedule,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        let name = schedule.name_any();
        let spec = &schedule.spec;
        let status = self.refresh_status(schedule).await?;

        if spec.suspend {
            debug!(schedule = %name, "schedule is suspended, skipping");
            return Ok(Outcome::Done);
        }

        self.rotate(schedule, RunCondition::Failed, spec.failed_runs_history_limit)
            .await?;
        self.rotate(schedule, RunCondition::Successful, spec.successful_runs_history_limit)
            .await?;

        let triggered = annotation(schedule, annotations::TRIGGER).is_some();
        let input = ScheduleInput {
            expression: &spec.schedule,
            time_zone: spec.time_zone.as_deref(),
            starting_deadline_seconds: spec.starting_deadline_seconds,
            last_schedule_time: status.last_schedule_time,
            triggered,
        };
        let fire = match evaluate(&input, now) {
            Ok(fire) => fire,
            Err(e) => {
                // waits for a spec change, which triggers a reconcile anyway
                error!(schedule = %name, error = %e, "unable to figure out next schedule run time");
                self.publish(schedule, EventType::Warning, reasons::INVALID, e.to_string())
                    .await;
                return Ok(Outcome::Done);
            }
        };

        if triggered {
            let namespace = schedule.namespace().unwrap_or_default();
            let (namespace, name) = (&namespace, &name);
            retry_on_conflict("schedule_trigger", move || async move {
                self.kube
                    .remove_annotation(namespace, name, annotations::TRIGGER)
                    .await
            })
            .await?;
        }

        let requeue = Outcome::RequeueAfter(
            (fire.next - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1)),
        );

        let Some(missed) = fire.missed else {
            debug!(schedule = %name, next = %fire.next, "no missed run, sleeping until the next");
            return Ok(requeue);
        };
        if let Some(last) = status.last_schedule_time {
            if now - last < chrono::Duration::seconds(DOUBLE_FIRE_GUARD_SECS) {
                debug!(schedule = %name, last_schedule_time = %last, "scheduled less than a minute ago");
                return Ok(requeue);
            }
        }

        if let Some(deadline) = spec.starting_deadline_seconds {
            if missed + chrono::Duration::seconds(deadline) < now {
                let msg = "missed starting deadline for last run, sleeping till next";
                warn!(schedule = %name, missed = %missed, "{}", msg);
                self.publish(schedule, EventType::Warning, reasons::MISSED_TIME, msg.to_string())
                    .await;
                return Ok(requeue);
            }
        }

        match spec.concurrency_policy {
            ConcurrencyPolicy::Allow => {}
            ConcurrencyPolicy::Forbid => {
                let runs = self.owned_runs(schedule).await?;
                let running = in_progress(&runs).len();
                if running > 0 {
                    debug!(schedule = %name, running, "concurrency policy blocks concurrent runs, skipping");
                    return Ok(requeue);
                }
            }
            ConcurrencyPolicy::Replace => {
                let runs = self.owned_runs(schedule).await?;
                for run in runs_to_replace(&runs) {
                    info!(schedule = %name, backup_run = %run.name_any(), "replacing run");
                    self.kube
                        .delete_run(&run.namespace().unwrap_or_default(), &run.name_any())
                        .await?;
                }
            }
        }

        let run = run_from_schedule(schedule, missed)?;
        let run_name = run.name_any();
        match self.kube.create_run(&run).await {
            Ok(()) => {
                info!(schedule = %name, backup_run = %run_name, "created run");
                self.publish(
                    schedule,
                    EventType::Normal,
                    reasons::CREATED,
                    format!("created run {}", run_name),
                )
                .await;
            }
            Err(e) if e.is_conflict() => {
                debug!(schedule = %name, backup_run = %run_name, "run already exists");
            }
            Err(e) => {
                // the next reconcile retries the same fire time
                error!(schedule = %name, backup_run = %run_name, error = %e, "failed to create a BackupRun");
                return Ok(requeue);
            }
        }

        self.update_status(schedule, |status| {
            status.last_schedule_time = Some(missed);
        })
        .await?;
        self.refresh_status(schedule).await?;
        Ok(requeue)
    }
}

#[async_trait]
impl LifecycleHooks<BackupSchedule> for Context {
    async fn construct(&self, schedule: &BackupSchedule) -> Result<(), Error> {
        let name = schedule.name_any();
        let namespace = schedule.namespace().unwrap_or_default();
        let storage_name = &schedule.spec.template.spec.storage.name;
        let (name, namespace) = (&name, &namespace);

        retry_on_conflict("schedule_owner", move || async move {
            let storage = self.kube.get_storage(storage_name).await?.ok_or_else(|| {
                Error::validation_for_field(
                    name.as_str(),
                    "spec.template.spec.storage.name",
                    format!("BackupStorage {} not found", storage_name),
                )
            })?;
            let Some(fresh) = self.kube.get_schedule(namespace, name).await? else {
                return Ok(());
            };
            let owner = controller_owner_ref(&storage)?;
            match controller_uid(&fresh) {
                Some(uid) if uid == owner.uid => return Ok(()),
                Some(uid) => {
                    return Err(Error::validation(format!(
                        "schedule {} is already controlled by {}",
                        name, uid
                    )))
                }
                None => {}
            }
            let mut owners = fresh.metadata.owner_references.clone().unwrap_or_default();
            owners.push(owner);
            self.kube.patch_owners(&fresh, &owners).await
        })
        .await?;
        debug!(schedule = %name, storage = %storage_name, "storage referenced as owner");
        Ok(())
    }

    async fn process(&self, schedule: &BackupSchedule) -> Result<Outcome, Error> {
        self.process_at(schedule, Utc::now()).await
    }
}

/// Reconcile a BackupSchedule
#[instrument(skip(schedule, ctx), fields(schedule = %schedule.name_any()))]
pub async fn reconcile(schedule: Arc<BackupSchedule>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.lifecycle.manage(schedule.as_ref(), ctx.as_ref()).await
}

/// Requeue policy for failed reconciles
pub fn error_policy(schedule: Arc<BackupSchedule>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, schedule = %schedule.name_any(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    }
}
