//! Finalizer-guarded resource lifecycle shared by every stowage controller
//!
//! Each reconcile of a resource goes through [`Lifecycle::manage`]:
//!
//! - Active: the finalizer is ensured, the constructor runs once per object
//!   lifetime, then the processor runs on every event.
//! - Terminating: the destructor runs; the finalizer is only released once it
//!   reports [`Outcome::Done`], so the API server cannot erase the object
//!   before cleanup completed.
//!
//! Which objects were already constructed is tracked in memory by
//! [`InitTracker`]. The tracker is empty after a restart, so constructors must
//! be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::events::{actions, reasons, EventPublisher};
use crate::kube_utils::has_finalizer;
use crate::retry::retry_on_conflict;
use crate::{Error, FIELD_MANAGER, FINALIZER};

/// Namespace/name of an object, as needed to address it through the API
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Adds and removes the stowage finalizer on one resource kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FinalizerGuard: Send + Sync {
    /// Ensure the finalizer is present
    async fn add(&self, key: &ObjectKey) -> Result<(), Error>;

    /// Ensure the finalizer is absent; a vanished object counts as success
    async fn remove(&self, key: &ObjectKey) -> Result<(), Error>;
}

type ApiFor<K> = Box<dyn Fn(&ObjectKey) -> Api<K> + Send + Sync>;

/// [`FinalizerGuard`] backed by the Kubernetes API
pub struct KubeFinalizerGuard<K> {
    api_for: ApiFor<K>,
}

impl<K> KubeFinalizerGuard<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    /// Guard for a namespaced kind
    pub fn namespaced(client: Client) -> Self {
        Self {
            api_for: Box::new(move |key: &ObjectKey| {
                Api::namespaced(client.clone(), key.namespace.as_deref().unwrap_or("default"))
            }),
        }
    }
}

impl<K> KubeFinalizerGuard<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    /// Guard for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            api_for: Box::new(move |_: &ObjectKey| Api::all(client.clone())),
        }
    }
}

impl<K> KubeFinalizerGuard<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync,
{
    /// Rewrite the finalizer list with optimistic locking on resourceVersion
    async fn write_finalizers(
        &self,
        key: &ObjectKey,
        edit: impl Fn(&mut Vec<String>) -> bool + Send + Sync,
    ) -> Result<(), Error> {
        let api = &(self.api_for)(key);
        let edit = &edit;
        retry_on_conflict("finalizer", move || async move {
            let obj = api.get(&key.name).await?;
            let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
            if !edit(&mut finalizers) {
                return Ok(());
            }
            let patch = serde_json::json!({
                "metadata": {
                    "resourceVersion": obj.resource_version(),
                    "finalizers": finalizers,
                }
            });
            api.patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl<K> FinalizerGuard for KubeFinalizerGuard<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync,
{
    async fn add(&self, key: &ObjectKey) -> Result<(), Error> {
        self.write_finalizers(key, |f| {
            if f.iter().any(|x| x == FINALIZER) {
                return false;
            }
            f.push(FINALIZER.to_string());
            true
        })
        .await
    }

    async fn remove(&self, key: &ObjectKey) -> Result<(), Error> {
        let result = self
            .write_finalizers(key, |f| {
                let before = f.len();
                f.retain(|x| x != FINALIZER);
                f.len() != before
            })
            .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Guard that never touches the API, for tests of code built on [`Lifecycle`]
pub struct NoopFinalizerGuard;

#[async_trait]
impl FinalizerGuard for NoopFinalizerGuard {
    async fn add(&self, _key: &ObjectKey) -> Result<(), Error> {
        Ok(())
    }

    async fn remove(&self, _key: &ObjectKey) -> Result<(), Error> {
        Ok(())
    }
}

/// What a hook wants to happen after it ran
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing pending; wait for the next change
    Done,
    /// Run again after the given delay
    RequeueAfter(Duration),
}

impl Outcome {
    /// Controller action for this outcome
    pub fn into_action(self) -> Action {
        match self {
            Outcome::Done => Action::await_change(),
            Outcome::RequeueAfter(d) => Action::requeue(d),
        }
    }
}

/// Per-kind constructor, processor and destructor
#[async_trait]
pub trait LifecycleHooks<K: Send + Sync>: Send + Sync {
    /// One-time initialization after the object was first observed
    async fn construct(&self, _obj: &K) -> Result<(), Error> {
        Ok(())
    }

    /// Regular reconciliation
    async fn process(&self, obj: &K) -> Result<Outcome, Error>;

    /// Cleanup before the finalizer is released
    async fn destruct(&self, _obj: &K) -> Result<Outcome, Error> {
        Ok(Outcome::Done)
    }
}

/// Objects whose constructor already ran, keyed by uid, valued by the
/// resourceVersion seen at that time
#[derive(Debug, Default)]
pub struct InitTracker {
    seen: DashMap<String, String>,
}

impl InitTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the constructor already ran for this uid
    pub fn is_initialized(&self, uid: &str) -> bool {
        self.seen.contains_key(uid)
    }

    /// Record a successful constructor run
    pub fn mark(&self, uid: &str, resource_version: &str) {
        self.seen.insert(uid.to_string(), resource_version.to_string());
    }

    /// Drop the record once the object is gone
    pub fn forget(&self, uid: &str) {
        self.seen.remove(uid);
    }

    /// Number of tracked objects
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Lifecycle harness for one resource kind
pub struct Lifecycle {
    guard: Arc<dyn FinalizerGuard>,
    tracker: InitTracker,
    events: Arc<dyn EventPublisher>,
}

impl Lifecycle {
    /// Create a harness from a finalizer guard and an event publisher
    pub fn new(guard: Arc<dyn FinalizerGuard>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            guard,
            tracker: InitTracker::new(),
            events,
        }
    }

    /// Initialization tracker of this harness
    pub fn tracker(&self) -> &InitTracker {
        &self.tracker
    }

    /// Drive one reconcile of `obj` through its hooks
    pub async fn manage<K, H>(&self, obj: &K, hooks: &H) -> Result<Action, Error>
    where
        K: Resource<DynamicType = ()> + Send + Sync,
        H: LifecycleHooks<K> + ?Sized,
    {
        let key = ObjectKey::of(obj);
        let uid = obj.uid().unwrap_or_default();

        if obj.meta().deletion_timestamp.is_some() {
            if !has_finalizer(obj, FINALIZER) {
                return Ok(Action::await_change());
            }
            let outcome = self.run_hook(obj, actions::DELETE, hooks.destruct(obj)).await?;
            if let Outcome::RequeueAfter(_) = outcome {
                debug!(object = %key, "destructor asked for a retry, keeping finalizer");
                return Ok(outcome.into_action());
            }
            self.guard.remove(&key).await?;
            self.tracker.forget(&uid);
            info!(object = %key, "finalizer released");
            return Ok(Action::await_change());
        }

        if !has_finalizer(obj, FINALIZER) {
            self.guard.add(&key).await?;
        }

        if !self.tracker.is_initialized(&uid) {
            self.run_hook(obj, actions::INITIALIZE, hooks.construct(obj))
                .await?;
            self.tracker
                .mark(&uid, &obj.resource_version().unwrap_or_default());
        }

        let outcome = self
            .run_hook(obj, actions::RECONCILE, hooks.process(obj))
            .await?;
        Ok(outcome.into_action())
    }

    async fn run_hook<K, T>(
        &self,
        obj: &K,
        action: &str,
        hook: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error>
    where
        K: Resource<DynamicType = ()>,
    {
        match hook.await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(object = %ObjectKey::of(obj), action, error = %e, "lifecycle hook failed");
                self.events
                    .publish(
                        &obj.object_ref(&()),
                        EventType::Warning,
                        reasons::FAILED,
                        action,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }
}
