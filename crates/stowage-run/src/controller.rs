//! BackupRun controller
//!
//! Drives a run through the state machine: detect interruption, pick the due
//! action, launch the execution pod, stream the data and record the result.
//! Every status write goes through a conflict-retried read-modify-write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use age::x25519;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stowage_common::crd::{BackupRun, BackupRunStatus, RetainPolicy, RunAction};
use stowage_common::events::{actions, reasons, EventPublisher};
use stowage_common::kube_utils::{format_bytes, get_secret_data};
use stowage_common::lifecycle::{KubeFinalizerGuard, Lifecycle, LifecycleHooks, Outcome};
use stowage_common::retry::retry_on_conflict;
use stowage_common::{annotations, Error, FIELD_MANAGER, REQUEUE_ERROR_SECS};
use stowage_storage::{ProviderRegistry, StorageProvider};

use crate::codec::parse_identity;
use crate::exec::{ExecTarget, KubePodExec, RemoteExec};
use crate::pipeline::Pipeline;
use crate::pod::{build_pod, KubePodLauncher, PodLauncher};
use crate::state::{initialize_conditions, LivenessSet, Phase, RunState};

/// Requeue interval while the storage provider is not registered yet
const REQUEUE_NO_PROVIDER_SECS: u64 = 20;

/// Requeue interval for the destructor while the provider is missing
const REQUEUE_DESTRUCT_NO_PROVIDER_SECS: u64 = 5;

/// How long a terminating run may hold its finalizer to remove the backup
const CLEANUP_WINDOW_SECS: i64 = 300;

/// True once the run has been terminating for longer than the cleanup window
fn cleanup_window_exhausted(run: &BackupRun, now: DateTime<Utc>) -> bool {
    run.metadata
        .deletion_timestamp
        .as_ref()
        .is_some_and(|t| now - t.0 > chrono::Duration::seconds(CLEANUP_WINDOW_SECS))
}

/// Kubernetes operations needed by the run controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunClient: Send + Sync {
    /// Get a BackupRun
    async fn get_run(&self, namespace: &str, name: &str) -> Result<Option<BackupRun>, Error>;

    /// Replace the status of `run`, conditional on its resourceVersion
    async fn patch_status(&self, run: &BackupRun, status: &BackupRunStatus) -> Result<(), Error>;

    /// Set (`Some`) or remove (`None`) annotations on a BackupRun
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error>;

    /// Read one key of a Secret
    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Vec<u8>, Error>;
}

/// [`RunClient`] backed by the Kubernetes API
pub struct RunClientImpl {
    client: Client,
}

impl RunClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunClient for RunClientImpl {
    async fn get_run(&self, namespace: &str, name: &str) -> Result<Option<BackupRun>, Error> {
        let api: Api<BackupRun> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(&self, run: &BackupRun, status: &BackupRunStatus) -> Result<(), Error> {
        let api: Api<BackupRun> =
            Api::namespaced(self.client.clone(), &run.namespace().unwrap_or_default());
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": run.resource_version() },
            "status": status,
        });
        api.patch_status(
            &run.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let api: Api<BackupRun> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret_data(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Vec<u8>, Error> {
        get_secret_data(&self.client, name, namespace, key).await
    }
}

/// Shared state of the run controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn RunClient>,
    /// Execution pod management
    pub pods: Arc<dyn PodLauncher>,
    /// Exec primitive
    pub exec: Arc<dyn RemoteExec>,
    /// Live storage providers, filled by the storage controller
    pub registry: Arc<ProviderRegistry>,
    /// Runs started by this process
    pub liveness: Arc<LivenessSet>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    lifecycle: Lifecycle,
}

impl Context {
    /// Create a context talking to the cluster through `client`
    pub fn new(
        client: Client,
        registry: Arc<ProviderRegistry>,
        liveness: Arc<LivenessSet>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let guard = Arc::new(KubeFinalizerGuard::<BackupRun>::namespaced(client.clone()));
        Self {
            kube: Arc::new(RunClientImpl::new(client.clone())),
            pods: Arc::new(KubePodLauncher::new(client.clone())),
            exec: Arc::new(KubePodExec::new(client)),
            registry,
            liveness,
            lifecycle: Lifecycle::new(guard, events.clone()),
            events,
        }
    }

    /// Create a context for tests with mocked collaborators and no-op finalizers
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn RunClient>,
        pods: Arc<dyn PodLauncher>,
        exec: Arc<dyn RemoteExec>,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        use stowage_common::lifecycle::NoopFinalizerGuard;
        Self {
            kube,
            pods,
            exec,
            registry,
            liveness: Arc::new(LivenessSet::new()),
            lifecycle: Lifecycle::new(Arc::new(NoopFinalizerGuard), events.clone()),
            events,
        }
    }

    /// Read-modify-write the status; returns whether anything was written
    async fn update_status(
        &self,
        run: &BackupRun,
        mutate: impl Fn(&mut BackupRunStatus) + Send + Sync,
    ) -> Result<bool, Error> {
        let namespace = run.namespace().unwrap_or_default();
        let name = run.name_any();
        let (namespace, name, mutate) = (&namespace, &name, &mutate);
        retry_on_conflict("run_status", move || async move {
            let Some(fresh) = self.kube.get_run(namespace, name).await? else {
                return Ok(false);
            };
            let current = fresh.status.clone().unwrap_or_default();
            let mut next = current.clone();
            mutate(&mut next);
            if next == current {
                return Ok(false);
            }
            self.kube.patch_status(&fresh, &next).await?;
            Ok(true)
        })
        .await
    }

    async fn patch_annotations(
        &self,
        run: &BackupRun,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let namespace = run.namespace().unwrap_or_default();
        let name = run.name_any();
        let (namespace, name, changes) = (&namespace, &name, &changes);
        retry_on_conflict("run_annotations", move || async move {
            self.kube.patch_annotations(namespace, name, changes).await
        })
        .await
    }

    async fn transition(
        &self,
        run: &BackupRun,
        state: &mut RunState,
        phase: Phase,
    ) -> Result<(), Error> {
        let transition = state.enter(phase);
        if phase == Phase::InProgress {
            self.liveness.insert(&run.uid().unwrap_or_default());
        }
        let generation = run.metadata.generation;
        self.update_status(run, |status| transition.apply(status, generation))
            .await?;
        info!(backup_run = %run.name_any(), state = transition.state, "run state changed");
        Ok(())
    }

    async fn publish(&self, run: &BackupRun, type_: EventType, reason: &str, action: &str, note: String) {
        self.events
            .publish(&run.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }

    async fn load_identity(&self, run: &BackupRun) -> Result<Option<x25519::Identity>, Error> {
        let Some(key_ref) = run
            .spec
            .encryption
            .as_ref()
            .and_then(|e| e.decryption_key.as_ref())
        else {
            return Ok(None);
        };
        let namespace = key_ref
            .namespace
            .clone()
            .unwrap_or_else(|| run.namespace().unwrap_or_default());
        let key = self
            .kube
            .get_secret_data(&key_ref.name, &namespace, &key_ref.key)
            .await?;
        parse_identity(&key).map(Some).map_err(|e| {
            Error::pipeline(
                run.name_any(),
                "decrypt",
                format!("secret {}/{} key {}: {}", namespace, key_ref.name, key_ref.key, e),
            )
        })
    }

    /// Launch the pod, stream the data and always remove the pod again
    async fn execute(
        &self,
        run: &BackupRun,
        state: &RunState,
        provider: &dyn StorageProvider,
    ) -> Result<(), Error> {
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();
        let backup = state.have_to_backup;
        let action = if backup {
            run.spec.backup.as_ref()
        } else {
            run.spec.restore.as_ref()
        }
        .ok_or_else(|| Error::internal_with_context("execute", "due action is not configured"))?;

        let identity = if backup {
            None
        } else {
            self.load_identity(run).await?
        };

        let pod = build_pod(run)?;
        self.pods.launch(&pod).await?;
        let pod_name = pod.name_any();
        self.update_status(run, |status| status.pod_name = Some(pod_name.clone()))
            .await?;

        let result = async {
            self.pods.wait_ready(&namespace, &pod_name).await?;
            if backup {
                self.backup(run, action, &pod_name, provider).await
            } else {
                self.restore(run, action, &pod_name, provider, identity).await
            }
        }
        .await;

        if let Err(e) = self.pods.delete(&namespace, &pod_name).await {
            warn!(backup_run = %name, pod = %pod_name, error = %e, "failed to delete run pod");
        }
        result
    }

    /// Release the run while leaving its backup object in storage
    async fn abandon_backup(&self, run: &BackupRun, cause: &str) -> Outcome {
        let storage = &run.spec.storage.name;
        let path = &run.spec.storage.path;
        error!(
            backup_run = %run.name_any(),
            storage = %storage,
            path = %path,
            cause = %cause,
            "cleanup window exhausted, backup left in storage"
        );
        self.publish(
            run,
            EventType::Warning,
            reasons::FAILED,
            actions::DELETE,
            format!("backup {} in storage {} was not deleted: {}", path, storage, cause),
        )
        .await;
        Outcome::Done
    }

    fn pipeline<'a>(
        &'a self,
        run: &'a BackupRun,
        action: &RunAction,
        pod: &str,
        provider: &'a dyn StorageProvider,
    ) -> Pipeline<'a> {
        Pipeline {
            run: run.meta().name.as_deref().unwrap_or_default(),
            exec: self.exec.as_ref(),
            provider,
            path: &run.spec.storage.path,
            target: ExecTarget {
                namespace: run.namespace().unwrap_or_default(),
                pod: pod.to_string(),
                container: action.container.clone(),
                command: action.argv(),
            },
            deadline: action.deadline_seconds.map(Duration::from_secs),
        }
    }

    async fn backup(
        &self,
        run: &BackupRun,
        action: &RunAction,
        pod: &str,
        provider: &dyn StorageProvider,
    ) -> Result<(), Error> {
        let path = &run.spec.storage.path;
        self.pipeline(run, action, pod, provider)
            .backup(run.spec.compression.as_ref(), run.spec.encryption.as_ref())
            .await?;

        match provider.size(path).await {
            Ok(size) => {
                self.update_status(run, |status| {
                    status.size_in_bytes = Some(size);
                    status.size = Some(format_bytes(size));
                })
                .await?;
            }
            Err(e) => {
                warn!(backup_run = %run.name_any(), path = %path, error = %e, "failed to read backup size");
            }
        }
        Ok(())
    }

    async fn restore(
        &self,
        run: &BackupRun,
        action: &RunAction,
        pod: &str,
        provider: &dyn StorageProvider,
        identity: Option<x25519::Identity>,
    ) -> Result<(), Error> {
        self.patch_annotations(
            run,
            BTreeMap::from([
                (annotations::RESTORE.to_string(), None),
                (annotations::RESTORED_AT.to_string(), None),
            ]),
        )
        .await?;

        self.pipeline(run, action, pod, provider)
            .restore(
                run.spec.compression.as_ref(),
                run.spec.encryption.as_ref(),
                identity,
            )
            .await?;

        self.patch_annotations(
            run,
            BTreeMap::from([(
                annotations::RESTORED_AT.to_string(),
                Some(Utc::now().to_rfc3339()),
            )]),
        )
        .await
    }
}

#[async_trait]
impl LifecycleHooks<BackupRun> for Context {
    async fn construct(&self, run: &BackupRun) -> Result<(), Error> {
        let name = run.name_any();
        run.spec.validate(&name)?;

        // no liveness bookkeeping here, or a restart would hide interruptions
        let state = RunState::derive(run, false);
        let generation = run.metadata.generation;
        let added = self
            .update_status(run, |status| initialize_conditions(status, &state, generation))
            .await?;
        if !added {
            debug!(backup_run = %name, "conditions already present");
            return Ok(());
        }

        if let Some(encryption) = &run.spec.encryption {
            self.publish(
                run,
                EventType::Normal,
                reasons::ENCRYPTION,
                actions::INITIALIZE,
                format!("recipients count {}", encryption.recipients.len()),
            )
            .await;
        }
        if let Some(compression) = &run.spec.compression {
            self.publish(
                run,
                EventType::Normal,
                reasons::COMPRESSION,
                actions::INITIALIZE,
                format!("{} with level {}", compression.algorithm, compression.level),
            )
            .await;
        }
        debug!(backup_run = %name, "run initialized");
        Ok(())
    }

    async fn process(&self, run: &BackupRun) -> Result<Outcome, Error> {
        let name = run.name_any();
        let mut state = RunState::analyze(run, &self.liveness);

        if state.interrupted {
            warn!(backup_run = %name, "run was in progress when the operator stopped");
            self.transition(run, &mut state, Phase::Failed).await?;
            self.publish(
                run,
                EventType::Warning,
                reasons::FAILED,
                actions::RECONCILE,
                "run has been interrupted and considered as failed".to_string(),
            )
            .await;
            return Ok(Outcome::Done);
        }

        if !state.have_to_backup && !state.have_to_restore {
            debug!(backup_run = %name, "nothing to do");
            return Ok(Outcome::Done);
        }

        if state.have_to_restore && !state.restorable {
            // no key will appear by waiting, so this is not a storage error
            state.never_run = false;
            self.transition(run, &mut state, Phase::Failed).await?;
            self.publish(
                run,
                EventType::Warning,
                reasons::FAILED,
                actions::RESTORE,
                "backup is not restorable, but restore has been requested".to_string(),
            )
            .await;
            return Ok(Outcome::Done);
        }

        let storage = &run.spec.storage.name;
        let Some(provider) = self.registry.get(storage) else {
            warn!(backup_run = %name, storage = %storage, "storage provider not registered yet");
            self.transition(run, &mut state, Phase::Failed).await?;
            self.publish(
                run,
                EventType::Warning,
                reasons::FAILED,
                actions::RECONCILE,
                format!(
                    "no storage provider with name {} found, ignore if operator has restarted recently",
                    storage
                ),
            )
            .await;
            return Ok(Outcome::RequeueAfter(Duration::from_secs(REQUEUE_NO_PROVIDER_SECS)));
        };

        let action = if state.have_to_backup {
            actions::BACKUP
        } else {
            actions::RESTORE
        };
        self.transition(run, &mut state, Phase::InProgress).await?;

        match self.execute(run, &state, provider.as_ref()).await {
            Ok(()) => {
                self.transition(run, &mut state, Phase::Successful).await?;
                self.publish(
                    run,
                    EventType::Normal,
                    reasons::COMPLETED,
                    action,
                    format!("{} finished", action.to_lowercase()),
                )
                .await;
            }
            Err(e) => {
                error!(
                    backup_run = %name,
                    storage = %storage,
                    path = %run.spec.storage.path,
                    error = %e,
                    "run failed"
                );
                self.transition(run, &mut state, Phase::Failed).await?;
                self.publish(run, EventType::Warning, reasons::FAILED, action, e.to_string())
                    .await;
            }
        }
        Ok(Outcome::Done)
    }

    async fn destruct(&self, run: &BackupRun) -> Result<Outcome, Error> {
        let state = RunState::derive(run, false);
        if run.spec.retain_policy != RetainPolicy::Delete || !state.completed {
            return Ok(Outcome::Done);
        }

        let storage = &run.spec.storage.name;
        let path = &run.spec.storage.path;
        let exhausted = cleanup_window_exhausted(run, Utc::now());
        let Some(provider) = self.registry.get(storage) else {
            if exhausted {
                return Ok(self.abandon_backup(run, "storage provider not found").await);
            }
            warn!(
                backup_run = %run.name_any(),
                storage = %storage,
                "no storage provider found, ignore if operator has restarted recently"
            );
            return Ok(Outcome::RequeueAfter(Duration::from_secs(
                REQUEUE_DESTRUCT_NO_PROVIDER_SECS,
            )));
        };

        if let Err(e) = provider.delete(path).await {
            if exhausted {
                return Ok(self.abandon_backup(run, &e.to_string()).await);
            }
            error!(backup_run = %run.name_any(), storage = %storage, path = %path, error = %e, "failed to delete the backup from storage");
            return Ok(Outcome::RequeueAfter(Duration::from_secs(REQUEUE_ERROR_SECS)));
        }
        info!(backup_run = %run.name_any(), storage = %storage, path = %path, "backup deleted from storage");
        self.publish(
            run,
            EventType::Normal,
            reasons::DELETED,
            actions::DELETE,
            format!("deleted backup at {}", path),
        )
        .await;
        Ok(Outcome::Done)
    }
}

/// Reconcile a BackupRun
#[instrument(skip(run, ctx), fields(backup_run = %run.name_any()))]
pub async fn reconcile(run: Arc<BackupRun>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.lifecycle.manage(run.as_ref(), ctx.as_ref()).await
}

/// Requeue policy for failed reconciles
pub fn error_policy(run: Arc<BackupRun>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, backup_run = %run.name_any(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BoxWriter;
    use crate::exec::MockRemoteExec;
    use crate::pod::MockPodLauncher;
    use age::secrecy::ExposeSecret;
    use std::sync::Mutex;
    use stowage_common::crd::{
        BackupRunSpec, CompressionSpec, Condition, ConditionStatus, EncryptionSpec, RunCondition,
        SecretKeyReference, StorageTarget,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use stowage_common::FINALIZER;
    use stowage_storage::{BoxReader, ObjectStoreProvider, ProviderKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct RecordingPublisher {
        reasons: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &k8s_openapi::api::core::v1::ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.reasons
                .lock()
                .unwrap()
                .push((reason.to_string(), note));
        }
    }

    impl RecordingPublisher {
        fn has(&self, reason: &str) -> bool {
            self.reasons.lock().unwrap().iter().any(|(r, _)| r == reason)
        }
    }

    /// Exec double: prints `output` on stdout, records stdin, optionally fails
    struct EchoExec {
        output: Vec<u8>,
        fail: bool,
        stdin: Mutex<Vec<u8>>,
    }

    impl EchoExec {
        fn new(output: &[u8], fail: bool) -> Self {
            Self {
                output: output.to_vec(),
                fail,
                stdin: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteExec for EchoExec {
        async fn exec(
            &self,
            target: &ExecTarget,
            stdin: Option<BoxReader>,
            stdout: Option<BoxWriter>,
        ) -> Result<(), Error> {
            assert_eq!(target.container, "pg");
            if let Some(mut out) = stdout {
                out.write_all(&self.output).await.unwrap();
                out.shutdown().await.unwrap();
            }
            if let Some(mut input) = stdin {
                let mut buf = Vec::new();
                input.read_to_end(&mut buf).await.unwrap();
                *self.stdin.lock().unwrap() = buf;
            }
            if self.fail {
                Err(Error::pipeline(&target.pod, "exec", "command terminated with exit code 2"))
            } else {
                Ok(())
            }
        }
    }

    fn action(command: &str) -> RunAction {
        RunAction {
            container: "pg".to_string(),
            command: vec![command.to_string()],
            ..Default::default()
        }
    }

    fn sample_run(backup: bool, restore: bool) -> BackupRun {
        let mut run = BackupRun::new(
            "pg-1700000000",
            BackupRunSpec {
                backup: backup.then(|| action("pg_dumpall")),
                restore: restore.then(|| action("psql")),
                storage: StorageTarget {
                    name: "minio".to_string(),
                    path: "/pg/1700000000.sql".to_string(),
                },
                ..Default::default()
            },
        );
        run.metadata.namespace = Some("db".to_string());
        run.metadata.uid = Some("run-uid".to_string());
        run.metadata.generation = Some(1);
        run
    }

    fn with_conditions(mut run: BackupRun, conditions: &[(RunCondition, bool)]) -> BackupRun {
        run.status = Some(BackupRunStatus {
            conditions: conditions
                .iter()
                .map(|(c, v)| Condition::new(c.as_str(), ConditionStatus::from(*v), "Test", "test"))
                .collect(),
            ..Default::default()
        });
        run
    }

    /// Mock client whose get_run and patch_status share one stored object
    fn stateful_client(
        stored: Arc<Mutex<BackupRun>>,
        annotation_patches: Arc<Mutex<Vec<BTreeMap<String, Option<String>>>>>,
    ) -> MockRunClient {
        let mut mock = MockRunClient::new();
        let get = stored.clone();
        mock.expect_get_run()
            .returning(move |_, _| Ok(Some(get.lock().unwrap().clone())));
        let put = stored.clone();
        mock.expect_patch_status().returning(move |_, status| {
            put.lock().unwrap().status = Some(status.clone());
            Ok(())
        });
        mock.expect_patch_annotations()
            .returning(move |ns, name, changes| {
                assert_eq!((ns, name), ("db", "pg-1700000000"));
                annotation_patches.lock().unwrap().push(changes.clone());
                Ok(())
            });
        mock
    }

    /// Store that refuses every deletion
    struct UndeletableStore;

    #[async_trait]
    impl StorageProvider for UndeletableStore {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Memory
        }
        async fn put(&self, _path: &str, _reader: BoxReader) -> Result<u64, Error> {
            Ok(0)
        }
        async fn get(&self, path: &str) -> Result<BoxReader, Error> {
            Err(Error::provider_for("minio", "memory", format!("{} not found", path)))
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }
        async fn delete(&self, _path: &str) -> Result<(), Error> {
            Err(Error::provider_for("minio", "memory", "access denied"))
        }
        async fn size(&self, _path: &str) -> Result<u64, Error> {
            Ok(0)
        }
    }

    /// A finished Delete-policy run whose deletion started `age` ago
    fn terminating_run(age: chrono::Duration) -> BackupRun {
        let mut run = with_conditions(sample_run(true, false), &[(RunCondition::Successful, true)]);
        run.spec.retain_policy = RetainPolicy::Delete;
        run.metadata.deletion_timestamp = Some(Time(Utc::now() - age));
        run.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        run
    }

    fn pods_that_work() -> MockPodLauncher {
        let mut pods = MockPodLauncher::new();
        pods.expect_launch().times(1).returning(|pod| {
            assert_eq!(pod.metadata.name.as_deref(), Some("pg-1700000000"));
            Ok(())
        });
        pods.expect_wait_ready().times(1).returning(|_, _| Ok(()));
        pods.expect_delete().times(1).returning(|ns, name| {
            assert_eq!((ns, name), ("db", "pg-1700000000"));
            Ok(())
        });
        pods
    }

    fn registry_with_memory() -> (Arc<ProviderRegistry>, Arc<ObjectStoreProvider>) {
        let registry = Arc::new(ProviderRegistry::new());
        let provider = Arc::new(ObjectStoreProvider::in_memory("minio"));
        registry.register("minio", provider.clone(), "hash".to_string());
        (registry, provider)
    }

    fn status_of(stored: &Arc<Mutex<BackupRun>>) -> BackupRunStatus {
        stored.lock().unwrap().status.clone().unwrap_or_default()
    }

    fn condition(status: &BackupRunStatus, c: RunCondition) -> Condition {
        status
            .conditions
            .iter()
            .find(|x| x.type_ == c.as_str())
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn story_constructor_initializes_conditions_and_announces_codecs() {
        let mut run = sample_run(true, true);
        run.spec.compression = Some(CompressionSpec {
            level: 7,
            ..Default::default()
        });
        run.spec.encryption = Some(EncryptionSpec {
            recipients: vec!["age1a".to_string(), "age1b".to_string()],
            decryption_key: None,
        });
        let stored = Arc::new(Mutex::new(run.clone()));
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            events.clone(),
        );

        ctx.construct(&run).await.unwrap();

        let status = status_of(&stored);
        assert_eq!(status.conditions.len(), 8);
        assert_eq!(condition(&status, RunCondition::NeverRun).status, ConditionStatus::True);
        assert_eq!(condition(&status, RunCondition::Encrypted).status, ConditionStatus::True);
        assert_eq!(condition(&status, RunCondition::Restorable).status, ConditionStatus::False);
        assert_eq!(condition(&status, RunCondition::Ready).reason, "Initializing");

        let recorded = events.reasons.lock().unwrap().clone();
        assert!(recorded.contains(&(
            reasons::ENCRYPTION.to_string(),
            Some("recipients count 2".to_string())
        )));
        assert!(recorded.contains(&(
            reasons::COMPRESSION.to_string(),
            Some("gzip with level 7".to_string())
        )));
    }

    #[tokio::test]
    async fn story_constructor_rejects_run_without_actions() {
        let run = sample_run(false, false);
        let ctx = Context::for_testing(
            Arc::new(MockRunClient::new()),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            Arc::new(RecordingPublisher::default()),
        );
        let err = ctx.construct(&run).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn story_interrupted_run_is_marked_failed() {
        let run = with_conditions(
            sample_run(true, false),
            &[(RunCondition::InProgress, true), (RunCondition::NeverRun, false)],
        );
        let stored = Arc::new(Mutex::new(run.clone()));
        let events = Arc::new(RecordingPublisher::default());
        let (registry, _) = registry_with_memory();
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            registry,
            events.clone(),
        );

        let outcome = ctx.process(&run).await.unwrap();

        assert_eq!(outcome, Outcome::Done);
        let status = status_of(&stored);
        assert_eq!(status.state.as_deref(), Some("InterruptedFailed"));
        let failed = condition(&status, RunCondition::Failed);
        assert_eq!(failed.status, ConditionStatus::True);
        assert_eq!(failed.reason, "Interrupted");
        assert_eq!(condition(&status, RunCondition::InProgress).status, ConditionStatus::False);
        assert!(events.has(reasons::FAILED));
    }

    #[tokio::test]
    async fn story_missing_provider_keeps_run_eligible() {
        let run = sample_run(true, false);
        let stored = Arc::new(Mutex::new(run.clone()));
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            Arc::new(RecordingPublisher::default()),
        );

        let outcome = ctx.process(&run).await.unwrap();

        assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(20)));
        let status = status_of(&stored);
        assert_eq!(status.state.as_deref(), Some("StorageError"));
        assert_eq!(condition(&status, RunCondition::NeverRun).status, ConditionStatus::True);
        assert_eq!(condition(&status, RunCondition::Failed).status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn story_backup_streams_into_storage_and_records_size() {
        let run = sample_run(true, false);
        let stored = Arc::new(Mutex::new(run.clone()));
        let (registry, provider) = registry_with_memory();
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(pods_that_work()),
            Arc::new(EchoExec::new(&[7u8; 2048], false)),
            registry,
            events.clone(),
        );

        assert_eq!(ctx.process(&run).await.unwrap(), Outcome::Done);

        let status = status_of(&stored);
        assert_eq!(status.state.as_deref(), Some("BackupSuccessful"));
        assert_eq!(condition(&status, RunCondition::Ready).status, ConditionStatus::True);
        assert_eq!(status.pod_name.as_deref(), Some("pg-1700000000"));
        assert_eq!(status.size_in_bytes, Some(2048));
        assert_eq!(status.size.as_deref(), Some("2.0 KiB"));
        assert_eq!(provider.size("/pg/1700000000.sql").await.unwrap(), 2048);
        assert!(ctx.liveness.contains("run-uid"));
        assert!(events.has(reasons::COMPLETED));
    }

    #[tokio::test]
    async fn story_failed_backup_is_terminal_and_pod_is_removed() {
        let run = sample_run(true, false);
        let stored = Arc::new(Mutex::new(run.clone()));
        let (registry, provider) = registry_with_memory();
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(pods_that_work()),
            Arc::new(EchoExec::new(b"half a dump", true)),
            registry,
            Arc::new(RecordingPublisher::default()),
        );

        assert_eq!(ctx.process(&run).await.unwrap(), Outcome::Done);

        let status = status_of(&stored);
        assert_eq!(status.state.as_deref(), Some("BackupFailed"));
        assert_eq!(condition(&status, RunCondition::Failed).status, ConditionStatus::True);
        assert_eq!(condition(&status, RunCondition::NeverRun).status, ConditionStatus::False);
        assert!(status.size_in_bytes.is_none());
        assert!(provider.size("/pg/1700000000.sql").await.is_err());

        // a finished backup is never attempted again
        let again = stored.lock().unwrap().clone();
        assert_eq!(ctx.process(&again).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn story_restore_on_demand_stamps_restored_at() {
        let mut run = with_conditions(
            sample_run(true, true),
            &[(RunCondition::Successful, true), (RunCondition::Ready, true)],
        );
        run.metadata.annotations = Some(BTreeMap::from([(
            annotations::RESTORE.to_string(),
            "true".to_string(),
        )]));
        let stored = Arc::new(Mutex::new(run.clone()));
        let patches = Arc::new(Mutex::new(Vec::new()));
        let (registry, provider) = registry_with_memory();
        provider
            .put("/pg/1700000000.sql", Box::new(&b"CREATE TABLE t;"[..]))
            .await
            .unwrap();
        let exec = Arc::new(EchoExec::new(b"", false));
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), patches.clone())),
            Arc::new(pods_that_work()),
            exec.clone(),
            registry,
            Arc::new(RecordingPublisher::default()),
        );

        assert_eq!(ctx.process(&run).await.unwrap(), Outcome::Done);

        assert_eq!(*exec.stdin.lock().unwrap(), b"CREATE TABLE t;");
        assert_eq!(status_of(&stored).state.as_deref(), Some("RestoreSuccessful"));
        let patches = patches.lock().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].get(annotations::RESTORE), Some(&None));
        assert_eq!(patches[0].get(annotations::RESTORED_AT), Some(&None));
        let stamp = patches[1].get(annotations::RESTORED_AT).cloned().flatten().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    #[tokio::test]
    async fn story_encrypted_restore_without_key_never_launches_pod() {
        let mut run = sample_run(false, true);
        run.spec.encryption = Some(EncryptionSpec {
            recipients: vec!["age1x".to_string()],
            decryption_key: None,
        });
        let stored = Arc::new(Mutex::new(run.clone()));
        let (registry, _) = registry_with_memory();
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            registry,
            events.clone(),
        );

        assert_eq!(ctx.process(&run).await.unwrap(), Outcome::Done);

        let status = status_of(&stored);
        assert_eq!(status.state.as_deref(), Some("RestoreFailed"));
        let notes = events.reasons.lock().unwrap().clone();
        assert!(notes
            .iter()
            .any(|(r, n)| r == reasons::FAILED
                && n.as_deref().is_some_and(|n| n.contains("not restorable"))));
    }

    #[tokio::test]
    async fn story_encrypted_restore_reads_identity_from_secret() {
        let identity = x25519::Identity::generate();
        let mut run = sample_run(false, true);
        run.spec.encryption = Some(EncryptionSpec {
            recipients: vec![identity.to_public().to_string()],
            decryption_key: Some(SecretKeyReference {
                name: "age-key".to_string(),
                namespace: None,
                key: "key.txt".to_string(),
            }),
        });
        let stored = Arc::new(Mutex::new(run.clone()));
        let (registry, provider) = registry_with_memory();

        // seed storage with an encrypted object
        let seed_exec = EchoExec::new(b"secret rows", false);
        Pipeline {
            run: "seed",
            exec: &seed_exec,
            provider: provider.as_ref(),
            path: "/pg/1700000000.sql",
            target: ExecTarget {
                namespace: "db".to_string(),
                pod: "seed".to_string(),
                container: "pg".to_string(),
                command: vec![],
            },
            deadline: None,
        }
        .backup(None, run.spec.encryption.as_ref())
        .await
        .unwrap();

        let secret = identity.to_string().expose_secret().to_string();
        let mut client = stateful_client(stored.clone(), Arc::default());
        client
            .expect_get_secret_data()
            .times(1)
            .returning(move |name, ns, key| {
                assert_eq!((name, ns, key), ("age-key", "db", "key.txt"));
                Ok(secret.clone().into_bytes())
            });
        let exec = Arc::new(EchoExec::new(b"", false));
        let ctx = Context::for_testing(
            Arc::new(client),
            Arc::new(pods_that_work()),
            exec.clone(),
            registry,
            Arc::new(RecordingPublisher::default()),
        );

        assert_eq!(ctx.process(&run).await.unwrap(), Outcome::Done);
        assert_eq!(*exec.stdin.lock().unwrap(), b"secret rows");
        assert_eq!(status_of(&stored).state.as_deref(), Some("RestoreSuccessful"));
    }

    #[tokio::test]
    async fn story_destructor_honours_retain_policy() {
        let (registry, provider) = registry_with_memory();
        provider
            .put("/pg/1700000000.sql", Box::new(&b"x"[..]))
            .await
            .unwrap();
        let ctx = Context::for_testing(
            Arc::new(MockRunClient::new()),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            registry,
            Arc::new(RecordingPublisher::default()),
        );

        let retained = with_conditions(sample_run(true, false), &[(RunCondition::Successful, true)]);
        assert_eq!(ctx.destruct(&retained).await.unwrap(), Outcome::Done);
        assert!(provider.size("/pg/1700000000.sql").await.is_ok());

        let mut deleted = retained.clone();
        deleted.spec.retain_policy = RetainPolicy::Delete;
        assert_eq!(ctx.destruct(&deleted).await.unwrap(), Outcome::Done);
        assert!(provider.size("/pg/1700000000.sql").await.is_err());
    }

    #[tokio::test]
    async fn story_destructor_waits_for_provider() {
        let ctx = Context::for_testing(
            Arc::new(MockRunClient::new()),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            Arc::new(RecordingPublisher::default()),
        );
        let mut run = with_conditions(sample_run(true, false), &[(RunCondition::Failed, true)]);
        run.spec.retain_policy = RetainPolicy::Delete;
        assert_eq!(
            ctx.destruct(&run).await.unwrap(),
            Outcome::RequeueAfter(Duration::from_secs(5))
        );

        // freshly terminating runs keep waiting
        let fresh = terminating_run(chrono::Duration::seconds(30));
        assert_eq!(
            ctx.destruct(&fresh).await.unwrap(),
            Outcome::RequeueAfter(Duration::from_secs(5))
        );

        // runs that never finished leave storage alone
        let mut pending = sample_run(true, false);
        pending.spec.retain_policy = RetainPolicy::Delete;
        assert_eq!(ctx.destruct(&pending).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn story_missing_provider_stops_holding_finalizer_after_cleanup_window() {
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(MockRunClient::new()),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            events.clone(),
        );
        let run = terminating_run(chrono::Duration::days(1));

        let action = ctx.lifecycle.manage(&run, &ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let notes = events.reasons.lock().unwrap().clone();
        assert!(notes.iter().any(|(r, n)| r == reasons::FAILED
            && n.as_deref().is_some_and(|n| n.contains("/pg/1700000000.sql") && n.contains("minio"))));
    }

    #[tokio::test]
    async fn story_failing_delete_is_retried_then_abandoned() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register("minio", Arc::new(UndeletableStore), "hash".to_string());
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(MockRunClient::new()),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            registry,
            events.clone(),
        );

        let fresh = terminating_run(chrono::Duration::seconds(30));
        assert_eq!(
            ctx.destruct(&fresh).await.unwrap(),
            Outcome::RequeueAfter(Duration::from_secs(60))
        );
        assert!(!events.has(reasons::FAILED));

        let stale = terminating_run(chrono::Duration::minutes(10));
        assert_eq!(
            ctx.lifecycle.manage(&stale, &ctx).await.unwrap(),
            Action::await_change()
        );
        let notes = events.reasons.lock().unwrap().clone();
        assert!(notes.iter().any(|(r, n)| r == reasons::FAILED
            && n.as_deref().is_some_and(|n| n.contains("access denied"))));
    }

    #[tokio::test]
    async fn story_unrestorable_run_fails_without_waiting_for_storage() {
        let mut run = sample_run(false, true);
        run.spec.encryption = Some(EncryptionSpec {
            recipients: vec!["age1x".to_string()],
            decryption_key: None,
        });
        let stored = Arc::new(Mutex::new(run.clone()));
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            Arc::new(RecordingPublisher::default()),
        );

        assert_eq!(ctx.process(&run).await.unwrap(), Outcome::Done);

        let status = status_of(&stored);
        assert_eq!(status.state.as_deref(), Some("RestoreFailed"));
        assert_eq!(condition(&status, RunCondition::Failed).status, ConditionStatus::True);
        assert_eq!(condition(&status, RunCondition::NeverRun).status, ConditionStatus::False);

        // terminal: the next reconcile has nothing left to do
        let again = stored.lock().unwrap().clone();
        assert_eq!(ctx.process(&again).await.unwrap(), Outcome::Done);
        assert_eq!(status_of(&stored).state.as_deref(), Some("RestoreFailed"));
    }

    #[tokio::test]
    async fn story_constructor_is_quiet_for_initialized_runs() {
        let mut run = sample_run(true, false);
        run.spec.compression = Some(CompressionSpec::default());
        let stored = Arc::new(Mutex::new(run.clone()));
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(stateful_client(stored.clone(), Arc::default())),
            Arc::new(MockPodLauncher::new()),
            Arc::new(MockRemoteExec::new()),
            Arc::new(ProviderRegistry::new()),
            events.clone(),
        );

        ctx.construct(&run).await.unwrap();
        assert!(events.has(reasons::COMPRESSION));

        // an operator restart constructs the same run again
        events.reasons.lock().unwrap().clear();
        let initialized = stored.lock().unwrap().clone();
        ctx.construct(&initialized).await.unwrap();
        assert!(events.reasons.lock().unwrap().is_empty());
        assert_eq!(status_of(&stored).conditions.len(), 8);
    }
}
