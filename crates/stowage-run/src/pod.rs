//! Execution pod for a BackupRun
//!
//! The pod is named after the run, owned by it and built from
//! `spec.template`. Any leftover pod of the same name is removed before the
//! new one is created, and the pod is always deleted once the transfer ended.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use stowage_common::crd::BackupRun;
use stowage_common::kube_utils::controller_owner_ref;
use stowage_common::retry::{retry_with_backoff_if, RetryConfig};
use stowage_common::Error;

/// Transient watch errors tolerated while waiting for readiness
pub const WATCH_ERROR_TOLERANCE: u32 = 3;

/// Upper bound for a pod to become ready
pub const READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Pod operations used by the run controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLauncher: Send + Sync {
    /// Replace any pod of the same name with `pod`
    async fn launch(&self, pod: &Pod) -> Result<(), Error>;

    /// Block until the pod reports Ready
    async fn wait_ready(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete the pod and its dependents, ignoring a missing pod
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Build the execution pod for a run
pub fn build_pod(run: &BackupRun) -> Result<Pod, Error> {
    let template = run.spec.template.metadata.clone().unwrap_or_default();
    let non_empty = |m: std::collections::BTreeMap<String, String>| (!m.is_empty()).then_some(m);
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(run.name_any()),
            namespace: run.namespace(),
            labels: non_empty(template.labels),
            annotations: non_empty(template.annotations),
            owner_references: Some(vec![controller_owner_ref(run)?]),
            ..Default::default()
        },
        spec: Some(run.spec.template.spec.clone()),
        ..Default::default()
    })
}

/// True when the pod's Ready condition is True
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Outcome of one watch event
#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Pod is ready
    Ready,
    /// Keep watching
    Waiting,
    /// Watch window expired, start a new one
    Expired,
    /// Pod will not become ready
    Failed(String),
}

/// Tracks readiness across the events of a single-pod watch
#[derive(Debug, Default)]
pub struct ReadinessWatch {
    transient_errors: u32,
}

impl ReadinessWatch {
    /// Fold one watch event into the readiness verdict
    pub fn observe(&mut self, event: &WatchEvent<Pod>) -> Readiness {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                if is_pod_ready(pod) {
                    Readiness::Ready
                } else {
                    Readiness::Waiting
                }
            }
            WatchEvent::Bookmark(_) => Readiness::Waiting,
            WatchEvent::Deleted(_) => Readiness::Failed("pod was deleted".to_string()),
            WatchEvent::Error(e) if e.code == 410 => Readiness::Expired,
            WatchEvent::Error(e) if e.code >= 500 => self.transient(&e.message),
            WatchEvent::Error(e) => Readiness::Failed(format!("watch error: {}", e.message)),
        }
    }

    /// Count a transient failure, giving up once the tolerance is reached
    pub fn transient(&mut self, message: &str) -> Readiness {
        self.transient_errors += 1;
        if self.transient_errors < WATCH_ERROR_TOLERANCE {
            warn!(errors = self.transient_errors, message, "transient error while watching pod");
            Readiness::Waiting
        } else {
            Readiness::Failed(format!(
                "pod is in the wrong state after {} watch errors: {}",
                self.transient_errors, message
            ))
        }
    }
}

/// [`PodLauncher`] backed by the Kubernetes API
pub struct KubePodLauncher {
    client: Client,
}

impl KubePodLauncher {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn watch_until_ready(&self, pods: &Api<Pod>, name: &str) -> Result<(), Error> {
        let mut watch = ReadinessWatch::default();
        loop {
            // a fresh get covers readiness reached between two watch windows
            let pod = pods.get(name).await?;
            if is_pod_ready(&pod) {
                return Ok(());
            }
            let params = WatchParams::default()
                .fields(&format!("metadata.name={}", name))
                .timeout(290);
            let mut stream = pods
                .watch(&params, &pod.resource_version().unwrap_or_default())
                .await?
                .boxed();
            loop {
                let verdict = match stream.try_next().await {
                    Ok(Some(event)) => watch.observe(&event),
                    Ok(None) => break,
                    Err(e) => watch.transient(&e.to_string()),
                };
                match verdict {
                    Readiness::Ready => return Ok(()),
                    Readiness::Waiting => continue,
                    Readiness::Expired => break,
                    Readiness::Failed(msg) => {
                        return Err(Error::pipeline(name, "pod", msg));
                    }
                }
            }
            debug!(pod = %name, "watch window closed, re-watching");
        }
    }
}

#[async_trait]
impl PodLauncher for KubePodLauncher {
    async fn launch(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let pods = &pods;
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match pods.delete(&name, &dp).await.map_err(Error::from) {
            Ok(_) => debug!(pod = %name, "removed leftover pod"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // a terminating pod of the same name still blocks creation
        retry_with_backoff_if(
            &RetryConfig::with_max_attempts(10),
            "create_run_pod",
            Error::is_conflict,
            move || async move {
                pods.create(&PostParams::default(), pod)
                    .await
                    .map(|_| ())
                    .map_err(Error::from)
            },
        )
        .await?;
        info!(pod = %name, namespace = %namespace, "run pod created");
        Ok(())
    }

    async fn wait_ready(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        tokio::time::timeout(READY_TIMEOUT, self.watch_until_ready(&pods, name))
            .await
            .map_err(|_| {
                Error::pipeline(
                    name,
                    "pod",
                    format!("pod not ready after {}s", READY_TIMEOUT.as_secs()),
                )
            })?
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(Error::from)
        {
            Ok(_) => {
                debug!(pod = %name, "run pod deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
