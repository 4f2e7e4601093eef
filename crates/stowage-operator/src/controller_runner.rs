//! Controller runner - builds one controller future per resource kind
//!
//! The provider registry and the liveness set are created once and shared:
//! the storage controller fills the registry, the run controller reads it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use stowage_common::crd::{BackupRun, BackupSchedule, BackupStorage};
use stowage_common::events::KubeEventPublisher;
use stowage_run::LivenessSet;
use stowage_storage::ProviderRegistry;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Process-wide state shared by the controllers
#[derive(Default)]
pub struct Shared {
    /// Live storage providers
    pub registry: Arc<ProviderRegistry>,
    /// Runs started by this process
    pub liveness: Arc<LivenessSet>,
}

fn controller_config(concurrency: u16) -> ControllerConfig {
    ControllerConfig::default().concurrency(concurrency)
}

/// Build the BackupStorage controller; owned schedules and runs naming the
/// storage refresh its usage
pub fn build_storage_controller(client: Client, shared: &Shared, concurrency: u16) -> ControllerFuture {
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "stowage-storage-controller"));
    let ctx = Arc::new(stowage_storage::controller::Context::new(
        client.clone(),
        shared.registry.clone(),
        events,
    ));
    let storages: Api<BackupStorage> = Api::all(client.clone());
    let schedules: Api<BackupSchedule> = Api::all(client.clone());
    let runs: Api<BackupRun> = Api::all(client);

    tracing::info!("- BackupStorage controller");
    Box::pin(
        Controller::new(storages, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(schedules, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .watches(
                runs,
                WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
                stowage_storage::controller::storage_for_run,
            )
            .with_config(controller_config(concurrency))
            .shutdown_on_signal()
            .run(
                stowage_storage::controller::reconcile,
                stowage_storage::controller::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("BackupStorage")),
    )
}

/// Build the BackupSchedule controller; owned runs trigger their schedule
pub fn build_schedule_controller(client: Client, concurrency: u16) -> ControllerFuture {
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "stowage-schedule-controller"));
    let ctx = Arc::new(stowage_schedule::Context::new(client.clone(), events));
    let schedules: Api<BackupSchedule> = Api::all(client.clone());
    let runs: Api<BackupRun> = Api::all(client);

    tracing::info!("- BackupSchedule controller");
    Box::pin(
        Controller::new(schedules, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(runs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(controller_config(concurrency))
            .shutdown_on_signal()
            .run(stowage_schedule::reconcile, stowage_schedule::error_policy, ctx)
            .for_each(log_reconcile_result("BackupSchedule")),
    )
}

/// Build the BackupRun controller
pub fn build_run_controller(client: Client, shared: &Shared, concurrency: u16) -> ControllerFuture {
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "stowage-run-controller"));
    let ctx = Arc::new(stowage_run::Context::new(
        client.clone(),
        shared.registry.clone(),
        shared.liveness.clone(),
        events,
    ));
    let runs: Api<BackupRun> = Api::all(client);

    tracing::info!("- BackupRun controller");
    Box::pin(
        Controller::new(runs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(controller_config(concurrency))
            .shutdown_on_signal()
            .run(stowage_run::reconcile, stowage_run::error_policy, ctx)
            .for_each(log_reconcile_result("BackupRun")),
    )
}

/// Build every controller
pub fn build_controllers(client: Client, concurrency: u16) -> Vec<ControllerFuture> {
    let shared = Shared::default();
    vec![
        build_storage_controller(client.clone(), &shared, concurrency),
        build_schedule_controller(client.clone(), concurrency),
        build_run_controller(client, &shared, concurrency),
    ]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
