//! Cluster Synchro Manager
//!
//! Drives the reconciler from a `kube::runtime::Controller` fed by a filtered
//! ClusterRegistration watch. Failures are retried with capped exponential backoff
//! and dropped after a fixed number of requeues until the object changes again.

use crate::controllers::cluster::ClusterSynchroReconciler;
use crate::controllers::status::KubeClusterStore;
use crate::controllers::Reconcile;
use crate::crd::ClusterRegistration;
use crate::error::{OperatorError, Result};
use crate::storage::ClusterStorage;
use crate::synchro::SynchroFactory;
use chrono::Utc;
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requeues allowed for a failing cluster before it is dropped.
pub const MAX_CLUSTER_SYNCHRO_RETRY: u32 = 5;
/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);
/// Default retry delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Runtime knobs for [`ClusterSynchroManager`].
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub workers: usize,
    /// Capability gate for the all-resources wildcard group.
    pub allow_sync_all_resources: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            allow_sync_all_resources: false,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Per-cluster failure counts and the requeue decision derived from them.
pub struct RetryPolicy {
    failures: Mutex<HashMap<String, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reset the failure count for `name`.
    pub fn forget(&self, name: &str) {
        self.failures().remove(name);
    }

    /// Times `name` has been requeued since it last succeeded or was dropped.
    pub fn num_requeues(&self, name: &str) -> u32 {
        self.failures().get(name).copied().unwrap_or(0)
    }

    /// Requeue `name` with backoff, or drop it once the retry ceiling is reached.
    pub fn on_error(&self, name: &str, error: &OperatorError) -> Action {
        let mut failures = self.failures();
        let retries = failures.get(name).copied().unwrap_or(0);
        if retries >= MAX_CLUSTER_SYNCHRO_RETRY {
            failures.remove(name);
            warn!(
                cluster = %name,
                "Dropping cluster out of the queue after {} retries: {}", retries, error
            );
            return Action::await_change();
        }

        failures.insert(name.to_string(), retries + 1);
        let delay = backoff(self.base_delay, self.max_delay, retries);
        error!(
            cluster = %name,
            retries,
            ?delay,
            "Reconciliation failed, requeue: {}", error
        );
        Action::requeue(delay)
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

/// Shared state handed to every reconcile call.
pub struct Context {
    reconciler: Arc<ClusterSynchroReconciler>,
    retries: RetryPolicy,
}

impl Context {
    pub fn new(reconciler: Arc<ClusterSynchroReconciler>, retries: RetryPolicy) -> Self {
        Self {
            reconciler,
            retries,
        }
    }
}

async fn reconcile(cluster: Arc<ClusterRegistration>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    ctx.reconciler.reconcile(&name).await?;
    ctx.retries.forget(&name);
    Ok(Action::await_change())
}

fn error_policy(cluster: Arc<ClusterRegistration>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    ctx.retries.on_error(&cluster.name_any(), error)
}

/// Hash of what a reconcile depends on: the spec and whether deletion started.
///
/// Status writes and finalizer updates leave it unchanged, so they do not trigger
/// another reconcile.
pub fn spec_changes(cluster: &ClusterRegistration) -> Option<u64> {
    let spec = serde_json::to_vec(&cluster.spec).ok()?;
    let mut hasher = DefaultHasher::new();
    spec.hash(&mut hasher);
    cluster.is_deleting().hash(&mut hasher);
    Some(hasher.finish())
}

/// Give removed objects a deletion marker so [`spec_changes`] always lets them through.
fn mark_removed(event: watcher::Event<ClusterRegistration>) -> watcher::Event<ClusterRegistration> {
    match event {
        watcher::Event::Delete(mut cluster) => {
            cluster
                .metadata
                .deletion_timestamp
                .get_or_insert_with(|| Time(Utc::now()));
            watcher::Event::Delete(cluster)
        }
        other => other,
    }
}

/// Run the controller over `trigger` until `stop` fires, then wait for in-flight
/// reconciles and every synchro task to exit.
async fn serve<S>(
    trigger: S,
    reader: Store<ClusterRegistration>,
    ctx: Arc<Context>,
    workers: usize,
    stop: CancellationToken,
) where
    S: Stream<Item = std::result::Result<ClusterRegistration, watcher::Error>> + Send + 'static,
{
    let concurrency = u16::try_from(workers.max(1)).unwrap_or(u16::MAX);
    let reconciler = ctx.reconciler.name();
    info!(controller = reconciler, concurrency, "Starting controller");
    Controller::for_stream(trigger, reader)
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(stop.cancelled_owned())
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((cluster, _)) => {
                        debug!(controller = reconciler, cluster = %cluster.name, "Reconciled cluster")
                    }
                    Err(controller::Error::ObjectNotFound(cluster)) => {
                        // Gone from the cache: tear down anything still running for it.
                        if let Err(e) = ctx.reconciler.reconcile(&cluster.name).await {
                            warn!(cluster = %cluster.name, "Failed to clean up removed cluster: {}", e);
                        }
                    }
                    // Logged by the error policy.
                    Err(controller::Error::ReconcilerFailed(_, _)) => {}
                    Err(e) => warn!("Cluster controller error: {}", e),
                }
            }
        })
        .await;

    ctx.reconciler.wait_synchros().await;
    let clusters = ctx.reconciler.registry().names().await;
    info!(clusters = ?clusters, "Cluster synchros stopped");
}

/// Keeps one synchro running per registered cluster.
pub struct ClusterSynchroManager {
    api: Api<ClusterRegistration>,
    storage: Arc<dyn ClusterStorage>,
    factory: Arc<dyn SynchroFactory>,
    settings: ManagerSettings,
    running: AtomicBool,
}

impl ClusterSynchroManager {
    pub fn new(
        client: Client,
        storage: Arc<dyn ClusterStorage>,
        factory: Arc<dyn SynchroFactory>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            api: Api::all(client),
            storage,
            factory,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the manager with `workers` concurrent reconciles until `stop` is cancelled.
    ///
    /// Returns after every in-flight reconcile and every synchro task has exited. May
    /// only be called once.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OperatorError::InvalidState(
                "cluster synchro manager is already running".to_string(),
            ));
        }

        let (reader, writer) = reflector::store::<ClusterRegistration>();
        let trigger = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .map_ok(mark_removed)
            .touched_objects()
            .predicate_filter(spec_changes);

        let store = Arc::new(KubeClusterStore::new(self.api.clone(), reader.clone()));
        let reconciler = Arc::new(ClusterSynchroReconciler::new(
            store,
            self.storage.clone(),
            self.factory.clone(),
            self.settings.allow_sync_all_resources,
            stop.clone(),
        ));
        let ctx = Arc::new(Context::new(
            reconciler,
            RetryPolicy::new(self.settings.base_delay, self.settings.max_delay),
        ));

        let serving = serve(trigger, reader.clone(), ctx, workers, stop.clone());
        tokio::select! {
            _ = serving => {}
            _ = stopped_before_sync(stop, reader) => {
                info!("Stopped before the ClusterRegistration cache synced");
            }
        }

        info!("Cluster synchro manager stopped");
        Ok(())
    }
}

/// Completes when `stop` fires while the cache has not synced yet. The controller
/// holds all work until then, so nothing is in flight to drain.
async fn stopped_before_sync(stop: CancellationToken, reader: Store<ClusterRegistration>) {
    stop.cancelled().await;
    if reader.wait_until_ready().now_or_never().is_none() {
        return;
    }
    std::future::pending::<()>().await
}
