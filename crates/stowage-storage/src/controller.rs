//! BackupStorage controller
//!
//! Keeps one live provider per BackupStorage in the shared
//! [`ProviderRegistry`], rebuilding it only when the parameters or the
//! credentials changed, and reports readiness plus aggregate usage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use stowage_common::crd::{
    set_condition, BackupRun, BackupSchedule, BackupStorage, BackupStorageStatus, Condition,
    ConditionStatus, STORAGE_READY,
};
use stowage_common::events::{actions, reasons, EventPublisher};
use stowage_common::kube_utils::{annotation, format_bytes, is_controlled_by, secret_string_data};
use stowage_common::lifecycle::{KubeFinalizerGuard, Lifecycle, LifecycleHooks, Outcome};
use stowage_common::retry::retry_on_conflict;
use stowage_common::{annotations, Error, FIELD_MANAGER, REQUEUE_ERROR_SECS, REQUEUE_SUCCESS_SECS};

use crate::provider::ProviderKind;
use crate::registry::{config_hash, ProviderRegistry};

/// Requeue interval while deletion protection holds a storage back
const REQUEUE_PROTECTED_SECS: u64 = 30;

/// Kubernetes operations needed by the storage controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Get a BackupStorage by name
    async fn get_storage(&self, name: &str) -> Result<Option<BackupStorage>, Error>;

    /// Replace the status of `storage`, conditional on its resourceVersion
    async fn patch_status(
        &self,
        storage: &BackupStorage,
        status: &BackupStorageStatus,
    ) -> Result<(), Error>;

    /// Set an annotation on a BackupStorage
    async fn set_annotation(&self, name: &str, key: &str, value: &str) -> Result<(), Error>;

    /// Read every key of a Secret as UTF-8
    async fn get_secret_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>, Error>;

    /// List BackupSchedules in all namespaces
    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>, Error>;

    /// List BackupRuns in all namespaces
    async fn list_runs(&self) -> Result<Vec<BackupRun>, Error>;
}

/// [`StorageClient`] backed by the Kubernetes API
pub struct StorageClientImpl {
    client: Client,
}

impl StorageClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StorageClient for StorageClientImpl {
    async fn get_storage(&self, name: &str) -> Result<Option<BackupStorage>, Error> {
        let api: Api<BackupStorage> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        storage: &BackupStorage,
        status: &BackupStorageStatus,
    ) -> Result<(), Error> {
        let api: Api<BackupStorage> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": storage.resource_version() },
            "status": status,
        });
        api.patch_status(
            &storage.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn set_annotation(&self, name: &str, key: &str, value: &str) -> Result<(), Error> {
        let api: Api<BackupStorage> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret_map(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        secret_string_data(&secret)
    }

    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>, Error> {
        let api: Api<BackupSchedule> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_runs(&self) -> Result<Vec<BackupRun>, Error> {
        let api: Api<BackupRun> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Shared state of the storage controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn StorageClient>,
    /// Live providers, shared with the run controller
    pub registry: Arc<ProviderRegistry>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    lifecycle: Lifecycle,
}

impl Context {
    /// Create a context talking to the cluster through `client`
    pub fn new(
        client: Client,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let guard = Arc::new(KubeFinalizerGuard::<BackupStorage>::cluster(client.clone()));
        Self {
            kube: Arc::new(StorageClientImpl::new(client)),
            registry,
            lifecycle: Lifecycle::new(guard, events.clone()),
            events,
        }
    }

    /// Create a context for tests with a mocked client and no-op finalizers
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn StorageClient>,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        use stowage_common::lifecycle::NoopFinalizerGuard;
        Self {
            kube,
            registry,
            lifecycle: Lifecycle::new(Arc::new(NoopFinalizerGuard), events.clone()),
            events,
        }
    }

    async fn update_status(
        &self,
        name: &str,
        mutate: impl Fn(&mut BackupStorageStatus) + Send + Sync,
    ) -> Result<(), Error> {
        let mutate = &mutate;
        retry_on_conflict("storage_status", move || async move {
            let Some(fresh) = self.kube.get_storage(name).await? else {
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

    async fn set_ready(
        &self,
        storage: &BackupStorage,
        ready: bool,
        reason: &str,
        message: String,
    ) -> Result<(), Error> {
        let generation = storage.metadata.generation;
        self.update_status(&storage.name_any(), |status| {
            set_condition(
                &mut status.conditions,
                Condition::new(STORAGE_READY, ConditionStatus::from(ready), reason, message.clone())
                    .observed(generation),
            );
        })
        .await
    }

    async fn drop_provider(&self, name: &str) {
        if let Some(provider) = self.registry.unregister(name) {
            if let Err(e) = provider.destruct().await {
                warn!(storage = %name, error = %e, "provider destructor failed");
            }
        }
    }

    async fn aggregate(&self, storage: &BackupStorage) -> Result<(u32, u32, u64), Error> {
        let name = storage.name_any();
        let uid = storage.uid().unwrap_or_default();
        let schedules = self
            .kube
            .list_schedules()
            .await?
            .iter()
            .filter(|s| is_controlled_by(*s, &uid))
            .count() as u32;
        let runs: Vec<BackupRun> = self
            .kube
            .list_runs()
            .await?
            .into_iter()
            .filter(|r| r.spec.storage.name == name)
            .collect();
        let size = runs
            .iter()
            .filter_map(|r| r.status.as_ref().and_then(|s| s.size_in_bytes))
            .sum();
        Ok((schedules, runs.len() as u32, size))
    }
}

#[async_trait]
impl LifecycleHooks<BackupStorage> for Context {
    async fn construct(&self, storage: &BackupStorage) -> Result<(), Error> {
        // only brand-new objects get protected; a removed marker stays removed
        if storage.status.is_none()
            && annotation(storage, annotations::DELETION_PROTECTION).is_none()
        {
            info!(storage = %storage.name_any(), "enabling deletion protection");
            self.kube
                .set_annotation(&storage.name_any(), annotations::DELETION_PROTECTION, "true")
                .await?;
        }
        Ok(())
    }

    async fn process(&self, storage: &BackupStorage) -> Result<Outcome, Error> {
        let name = storage.name_any();
        let obj_ref = storage.object_ref(&());

        let credentials = match &storage.spec.credentials {
            Some(secret) => {
                self.kube
                    .get_secret_map(&secret.name, &secret.namespace)
                    .await?
            }
            None => BTreeMap::new(),
        };

        let kind: ProviderKind = match storage.spec.type_.parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(storage = %name, type_ = %storage.spec.type_, "unknown provider type");
                self.drop_provider(&name).await;
                self.set_ready(storage, false, "UnknownType", e.to_string())
                    .await?;
                self.events
                    .publish(&obj_ref, EventType::Warning, reasons::INVALID, actions::CONFIGURE, Some(e.to_string()))
                    .await;
                return Ok(Outcome::RequeueAfter(Duration::from_secs(REQUEUE_SUCCESS_SECS)));
            }
        };

        let hash = config_hash(&storage.spec.parameters, &credentials);
        if self.registry.needs_rebuild(&name, &hash) {
            match kind
                .construct(&name, &storage.spec.parameters, &credentials)
                .await
            {
                Ok(provider) => {
                    self.drop_provider(&name).await;
                    self.registry.register(&name, provider, hash);
                    info!(storage = %name, provider = %kind, "storage provider configured");
                    self.events
                        .publish(
                            &obj_ref,
                            EventType::Normal,
                            reasons::RECONFIGURED,
                            actions::CONFIGURE,
                            Some(format!("{} provider configured", kind)),
                        )
                        .await;
                }
                Err(e) => {
                    error!(storage = %name, error = %e, "failed to configure storage provider");
                    self.drop_provider(&name).await;
                    self.set_ready(storage, false, "ConfigurationFailed", e.to_string())
                        .await?;
                    self.events
                        .publish(&obj_ref, EventType::Warning, reasons::UNHEALTHY, actions::CONFIGURE, Some(e.to_string()))
                        .await;
                    return Ok(Outcome::RequeueAfter(Duration::from_secs(REQUEUE_ERROR_SECS)));
                }
            }
        } else {
            debug!(storage = %name, "provider configuration unchanged");
        }

        let (schedules, runs, size) = self.aggregate(storage).await?;
        let generation = storage.metadata.generation;
        self.update_status(&name, |status| {
            set_condition(
                &mut status.conditions,
                Condition::new(STORAGE_READY, ConditionStatus::True, "Configured", "Storage provider is configured")
                    .observed(generation),
            );
            status.schedules = schedules;
            status.runs = runs;
            status.size_in_bytes = size;
            status.size = Some(format_bytes(size));
        })
        .await?;

        Ok(Outcome::RequeueAfter(Duration::from_secs(REQUEUE_SUCCESS_SECS)))
    }

    async fn destruct(&self, storage: &BackupStorage) -> Result<Outcome, Error> {
        let name = storage.name_any();
        if annotation(storage, annotations::DELETION_PROTECTION).is_some() {
            warn!(storage = %name, "deletion blocked by protection annotation");
            self.events
                .publish(
                    &storage.object_ref(&()),
                    EventType::Warning,
                    reasons::FINALIZING,
                    actions::DELETE,
                    Some(format!(
                        "remove the {} annotation to allow deletion",
                        annotations::DELETION_PROTECTION
                    )),
                )
                .await;
            return Ok(Outcome::RequeueAfter(Duration::from_secs(REQUEUE_PROTECTED_SECS)));
        }
        self.drop_provider(&name).await;
        info!(storage = %name, "storage provider released");
        Ok(Outcome::Done)
    }
}

/// BackupStorage whose usage a run counts towards, for watching runs
pub fn storage_for_run(run: BackupRun) -> Option<ObjectRef<BackupStorage>> {
    let name = run.spec.storage.name;
    (!name.is_empty()).then(|| ObjectRef::new(&name))
}

/// Reconcile a BackupStorage
#[instrument(skip(storage, ctx), fields(storage = %storage.name_any()))]
pub async fn reconcile(storage: Arc<BackupStorage>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.lifecycle.manage(storage.as_ref(), ctx.as_ref()).await
}

/// Requeue policy for failed reconciles
pub fn error_policy(storage: Arc<BackupStorage>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, storage = %storage.name_any(), "reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::sync::Mutex;
    use stowage_common::crd::{
        BackupRunSpec, BackupRunStatus, BackupScheduleSpec, BackupStorageSpec, RunTemplate,
        SecretReference, StorageTarget,
    };
    use stowage_common::events::NoopEventPublisher;

    #[derive(Default)]
    struct RecordingPublisher {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &k8s_openapi::api::core::v1::ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    fn sample_storage(type_: &str, params: &[(&str, &str)]) -> BackupStorage {
        let mut storage = BackupStorage::new(
            "minio",
            BackupStorageSpec {
                type_: type_.to_string(),
                parameters: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                credentials: None,
            },
        );
        storage.metadata.uid = Some("storage-uid".to_string());
        storage.metadata.generation = Some(2);
        storage
    }

    fn schedule_owned_by(uid: &str) -> BackupSchedule {
        let mut schedule = BackupSchedule::new(
            "nightly",
            BackupScheduleSpec {
                schedule: "0 0 * * *".to_string(),
                time_zone: None,
                starting_deadline_seconds: None,
                concurrency_policy: Default::default(),
                suspend: false,
                template: RunTemplate::default(),
                successful_runs_history_limit: 3,
                failed_runs_history_limit: 1,
            },
        );
        schedule.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "backup-operator.io/v1".to_string(),
            kind: "BackupStorage".to_string(),
            name: "minio".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
        schedule
    }

    fn run_in(storage: &str, size: Option<u64>) -> BackupRun {
        let mut run = BackupRun::new(
            "run",
            BackupRunSpec {
                storage: StorageTarget {
                    name: storage.to_string(),
                    path: "/x".to_string(),
                },
                ..Default::default()
            },
        );
        run.status = Some(BackupRunStatus {
            size_in_bytes: size,
            ..Default::default()
        });
        run
    }

    /// Mock whose get_storage returns `storage` and whose patch_status stores
    /// the last written status
    fn mock_client(
        storage: BackupStorage,
        written: Arc<Mutex<Option<BackupStorageStatus>>>,
    ) -> MockStorageClient {
        let mut mock = MockStorageClient::new();
        mock.expect_get_storage()
            .returning(move |_| Ok(Some(storage.clone())));
        mock.expect_patch_status().returning(move |_, status| {
            *written.lock().unwrap() = Some(status.clone());
            Ok(())
        });
        mock.expect_list_schedules().returning(|| {
            Ok(vec![
                schedule_owned_by("storage-uid"),
                schedule_owned_by("someone-else"),
            ])
        });
        mock.expect_list_runs().returning(|| {
            Ok(vec![
                run_in("minio", Some(1024)),
                run_in("minio", Some(2048)),
                run_in("minio", None),
                run_in("aws", Some(1 << 30)),
            ])
        });
        mock
    }

    fn ready(status: &BackupStorageStatus) -> Option<&Condition> {
        status.conditions.iter().find(|c| c.type_ == STORAGE_READY)
    }

    #[test]
    fn runs_map_to_the_storage_they_use() {
        assert_eq!(
            storage_for_run(run_in("minio", Some(1))),
            Some(ObjectRef::<BackupStorage>::new("minio"))
        );
        assert_eq!(storage_for_run(run_in("", None)), None);
    }

    #[tokio::test]
    async fn story_first_reconcile_builds_provider_and_reports_usage() {
        let storage = sample_storage("memory", &[]);
        let written = Arc::new(Mutex::new(None));
        let registry = Arc::new(ProviderRegistry::new());
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Context::for_testing(
            Arc::new(mock_client(storage.clone(), written.clone())),
            registry.clone(),
            events.clone(),
        );

        let outcome = ctx.process(&storage).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::RequeueAfter(Duration::from_secs(REQUEUE_SUCCESS_SECS))
        );
        let first = registry.get("minio").expect("provider registered");

        let status = written.lock().unwrap().clone().unwrap();
        assert_eq!(ready(&status).unwrap().status, ConditionStatus::True);
        assert_eq!(ready(&status).unwrap().observed_generation, Some(2));
        assert_eq!(status.schedules, 1);
        assert_eq!(status.runs, 3);
        assert_eq!(status.size_in_bytes, 3072);
        assert_eq!(status.size.as_deref(), Some("3.0 KiB"));

        // same configuration: the live instance is reused
        ctx.process(&storage).await.unwrap();
        assert!(Arc::ptr_eq(&first, &registry.get("minio").unwrap()));
        assert_eq!(
            *events.reasons.lock().unwrap(),
            vec![reasons::RECONFIGURED.to_string()]
        );
    }

    #[tokio::test]
    async fn story_parameter_change_rebuilds_provider() {
        let storage = sample_storage("memory", &[("bucket", "a")]);
        let registry = Arc::new(ProviderRegistry::new());
        let ctx = Context::for_testing(
            Arc::new(mock_client(storage.clone(), Arc::new(Mutex::new(None)))),
            registry.clone(),
            Arc::new(NoopEventPublisher),
        );
        ctx.process(&storage).await.unwrap();
        let first = registry.get("minio").unwrap();

        let changed = sample_storage("memory", &[("bucket", "b")]);
        ctx.process(&changed).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &registry.get("minio").unwrap()));
    }

    #[tokio::test]
    async fn story_unknown_type_reports_not_ready() {
        let storage = sample_storage("nfs", &[]);
        let written = Arc::new(Mutex::new(None));
        let registry = Arc::new(ProviderRegistry::new());
        let ctx = Context::for_testing(
            Arc::new(mock_client(storage.clone(), written.clone())),
            registry.clone(),
            Arc::new(NoopEventPublisher),
        );

        ctx.process(&storage).await.unwrap();

        let status = written.lock().unwrap().clone().unwrap();
        let cond = ready(&status).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, "UnknownType");
        assert!(registry.get("minio").is_none());
    }

    #[tokio::test]
    async fn story_missing_bucket_removes_live_provider() {
        let storage = sample_storage("s3", &[("region", "eu-west-1")]);
        let written = Arc::new(Mutex::new(None));
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(
            "minio",
            Arc::new(crate::provider::ObjectStoreProvider::in_memory("minio")),
            "stale".to_string(),
        );
        let ctx = Context::for_testing(
            Arc::new(mock_client(storage.clone(), written.clone())),
            registry.clone(),
            Arc::new(NoopEventPublisher),
        );

        let outcome = ctx.process(&storage).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::RequeueAfter(Duration::from_secs(REQUEUE_ERROR_SECS))
        );
        let status = written.lock().unwrap().clone().unwrap();
        let cond = ready(&status).unwrap();
        assert_eq!(cond.reason, "ConfigurationFailed");
        assert!(cond.message.contains("mandatory bucket parameter is not defined"));
        assert!(registry.get("minio").is_none());
    }

    #[tokio::test]
    async fn story_credentials_secret_is_read_from_its_namespace() {
        let mut storage = sample_storage("memory", &[]);
        storage.spec.credentials = Some(SecretReference {
            name: "minio-creds".to_string(),
            namespace: "backup-system".to_string(),
        });
        let mut mock = mock_client(storage.clone(), Arc::new(Mutex::new(None)));
        mock.expect_get_secret_map()
            .times(1)
            .returning(|name, namespace| {
                assert_eq!(name, "minio-creds");
                assert_eq!(namespace, "backup-system");
                Ok(BTreeMap::from([("k".to_string(), "v".to_string())]))
            });
        let ctx = Context::for_testing(
            Arc::new(mock),
            Arc::new(ProviderRegistry::new()),
            Arc::new(NoopEventPublisher),
        );
        ctx.process(&storage).await.unwrap();
    }

    #[tokio::test]
    async fn story_deletion_protection_blocks_destructor() {
        let mut storage = sample_storage("memory", &[]);
        storage.metadata.annotations = Some(BTreeMap::from([(
            annotations::DELETION_PROTECTION.to_string(),
            "true".to_string(),
        )]));
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(
            "minio",
            Arc::new(crate::provider::ObjectStoreProvider::in_memory("minio")),
            "h".to_string(),
        );
        let ctx = Context::for_testing(
            Arc::new(MockStorageClient::new()),
            registry.clone(),
            Arc::new(NoopEventPublisher),
        );

        let outcome = ctx.destruct(&storage).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::RequeueAfter(Duration::from_secs(REQUEUE_PROTECTED_SECS))
        );
        assert!(registry.get("minio").is_some());

        storage.metadata.annotations = None;
        assert_eq!(ctx.destruct(&storage).await.unwrap(), Outcome::Done);
        assert!(registry.get("minio").is_none());
    }

    #[tokio::test]
    async fn story_new_storage_gets_protection_once() {
        let mut mock = MockStorageClient::new();
        mock.expect_set_annotation()
            .times(1)
            .returning(|name, key, value| {
                assert_eq!(name, "minio");
                assert_eq!(key, annotations::DELETION_PROTECTION);
                assert_eq!(value, "true");
                Ok(())
            });
        let ctx = Context::for_testing(
            Arc::new(mock),
            Arc::new(ProviderRegistry::new()),
            Arc::new(NoopEventPublisher),
        );

        let fresh = sample_storage("s3", &[]);
        ctx.construct(&fresh).await.unwrap();

        // already reconciled before: protection was removed on purpose
        let mut seen = sample_storage("s3", &[]);
        seen.status = Some(BackupStorageStatus::default());
        ctx.construct(&seen).await.unwrap();
    }

    #[tokio::test]
    async fn story_reconcile_goes_through_lifecycle() {
        let storage = Arc::new(sample_storage("memory", &[]));
        let ctx = Arc::new(Context::for_testing(
            Arc::new({
                let mut mock = mock_client((*storage).clone(), Arc::new(Mutex::new(None)));
                mock.expect_set_annotation().returning(|_, _, _| Ok(()));
                mock
            }),
            Arc::new(ProviderRegistry::new()),
            Arc::new(NoopEventPublisher),
        ));

        let action = reconcile(storage, ctx).await.unwrap();
        assert_eq!(
            action,
            Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS))
        );
    }

    #[test]
    fn test_error_policy_backs_off_less_for_retryable() {
        let storage = Arc::new(sample_storage("s3", &[]));
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MockStorageClient::new()),
            Arc::new(ProviderRegistry::new()),
            Arc::new(NoopEventPublisher),
        ));
        assert_eq!(
            error_policy(storage.clone(), &Error::internal("x"), ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(storage, &Error::validation("bad"), ctx),
            Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
        );
    }
}
