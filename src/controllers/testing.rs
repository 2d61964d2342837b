//! In-memory collaborators for controller tests.

use crate::connection::ConnectionConfig;
use crate::controllers::status::ClusterStore;
use crate::crd::{ClusterGroupResources, ClusterRegistration, ClusterRegistrationSpec};
use crate::error::{OperatorError, Result};
use crate::storage::ClusterStorage;
use crate::synchro::{StatusCallback, SynchroFactory, SynchroWorker};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Ordered record of side effects across collaborators.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

struct Failures {
    remaining: usize,
    make: fn() -> OperatorError,
}

impl Failures {
    fn none() -> Self {
        Self {
            remaining: 0,
            make: || OperatorError::KubeApi("injected".to_string()),
        }
    }

    fn take(&mut self) -> Option<OperatorError> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some((self.make)())
    }
}

/// [`ClusterStore`] over a map, enforcing `resourceVersion` on writes.
pub struct FakeClusterStore {
    clusters: Mutex<HashMap<String, ClusterRegistration>>,
    next_version: AtomicUsize,
    update_failures: Mutex<Failures>,
    status_failures: Mutex<Failures>,
    updates: AtomicUsize,
    status_writes: AtomicUsize,
    status_write_attempts: AtomicUsize,
    journal: Journal,
}

impl FakeClusterStore {
    pub fn new() -> Self {
        Self::with_journal(Journal::default())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            next_version: AtomicUsize::new(1),
            update_failures: Mutex::new(Failures::none()),
            status_failures: Mutex::new(Failures::none()),
            updates: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
            status_write_attempts: AtomicUsize::new(0),
            journal,
        }
    }

    fn bump(&self, cluster: &mut ClusterRegistration) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        cluster.metadata.resource_version = Some(version.to_string());
    }

    pub fn insert(&self, mut cluster: ClusterRegistration) {
        self.bump(&mut cluster);
        self.clusters
            .lock()
            .unwrap()
            .insert(cluster.name_any(), cluster);
    }

    pub fn cluster(&self, name: &str) -> Option<ClusterRegistration> {
        self.clusters.lock().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        self.clusters.lock().unwrap().remove(name);
    }

    /// Replace the spec, as a user edit would.
    pub fn set_spec(&self, name: &str, spec: ClusterRegistrationSpec) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(cluster) = clusters.get_mut(name) {
            cluster.spec = spec;
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            cluster.metadata.resource_version = Some(version.to_string());
        }
    }

    /// Set the deletion marker, as the API server does on delete.
    pub fn mark_deleting(&self, name: &str) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(cluster) = clusters.get_mut(name) {
            cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    pub fn fail_updates(&self, count: usize, make: fn() -> OperatorError) {
        *self.update_failures.lock().unwrap() = Failures {
            remaining: count,
            make,
        };
    }

    pub fn fail_status_updates(&self, count: usize, make: fn() -> OperatorError) {
        *self.status_failures.lock().unwrap() = Failures {
            remaining: count,
            make,
        };
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn status_write_attempts(&self) -> usize {
        self.status_write_attempts.load(Ordering::SeqCst)
    }

    fn write(&self, cluster: &ClusterRegistration, status_only: bool) -> Result<ClusterRegistration> {
        let name = cluster.name_any();
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters
            .get_mut(&name)
            .ok_or_else(|| OperatorError::NotFound(name.clone()))?;
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            return Err(OperatorError::Conflict(format!("{} has changed", name)));
        }

        if status_only {
            stored.status = cluster.status.clone();
        } else {
            stored.metadata = cluster.metadata.clone();
            stored.spec = cluster.spec.clone();
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        stored.metadata.resource_version = Some(version.to_string());

        if !status_only && stored.is_deleting() && stored.metadata.finalizers.as_deref().unwrap_or_default().is_empty() {
            let removed = clusters.remove(&name);
            return removed.ok_or_else(|| OperatorError::NotFound(name));
        }
        Ok(stored.clone())
    }
}

#[async_trait]
impl ClusterStore for FakeClusterStore {
    async fn get(&self, name: &str) -> Result<Option<ClusterRegistration>> {
        Ok(self.cluster(name))
    }

    async fn update(&self, cluster: &ClusterRegistration) -> Result<ClusterRegistration> {
        if let Some(err) = self.update_failures.lock().unwrap().take() {
            return Err(err);
        }
        let updated = self.write(cluster, false)?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!(
            "update:{}:finalizers={}",
            cluster.name_any(),
            cluster.finalizers().len()
        ));
        Ok(updated)
    }

    async fn update_status(&self, cluster: &ClusterRegistration) -> Result<ClusterRegistration> {
        self.status_write_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.status_failures.lock().unwrap().take() {
            return Err(err);
        }
        let updated = self.write(cluster, true)?;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

/// [`ClusterStorage`] that records cleanups.
#[derive(Default)]
pub struct RecordingStorage {
    cleaned: Mutex<Vec<String>>,
    failures: Mutex<usize>,
    journal: Journal,
}

impl RecordingStorage {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn fail_cleanups(&self, count: usize) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterStorage for RecordingStorage {
    async fn clean_cluster(&self, cluster: &str) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(OperatorError::Storage("injected".to_string()));
            }
        }
        self.cleaned.lock().unwrap().push(cluster.to_string());
        self.journal.record(format!("clean:{}", cluster));
        Ok(())
    }

    async fn upsert(&self, _cluster: &str, _key: &str, _value: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Worker that only records what the manager asks of it.
pub struct FakeWorker {
    pub cluster: String,
    pub config: ConnectionConfig,
    shutdowns: Mutex<Vec<bool>>,
    resources: Mutex<Vec<(Vec<ClusterGroupResources>, bool)>>,
    halt: CancellationToken,
    started: AtomicBool,
    exited: AtomicBool,
    journal: Journal,
}

impl FakeWorker {
    pub fn shutdowns(&self) -> Vec<bool> {
        self.shutdowns.lock().unwrap().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        !self.shutdowns.lock().unwrap().is_empty()
    }

    pub fn resources(&self) -> Vec<(Vec<ClusterGroupResources>, bool)> {
        self.resources.lock().unwrap().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynchroWorker for FakeWorker {
    async fn run(&self, stop: CancellationToken) {
        self.started.store(true, Ordering::SeqCst);
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = self.halt.cancelled() => {}
        }
        self.exited.store(true, Ordering::SeqCst);
    }

    async fn shutdown(&self, delete_data: bool) {
        self.shutdowns.lock().unwrap().push(delete_data);
        self.journal
            .record(format!("shutdown:{}:delete={}", self.cluster, delete_data));
        self.halt.cancel();
    }

    async fn set_resources(
        &self,
        resources: Vec<ClusterGroupResources>,
        sync_all_custom_resources: bool,
    ) {
        self.resources
            .lock()
            .unwrap()
            .push((resources, sync_all_custom_resources));
    }
}

/// Factory handing out [`FakeWorker`]s, optionally failing.
#[derive(Default)]
pub struct FakeFactory {
    workers: Mutex<Vec<Arc<FakeWorker>>>,
    failures: Mutex<usize>,
    attempts: AtomicUsize,
    journal: Journal,
}

impl FakeFactory {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn fail_creates(&self, count: usize) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
        self.workers.lock().unwrap().clone()
    }

    /// Calls to `create`, failed ones included.
    pub fn create_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Workers for `cluster` that have not been shut down.
    pub fn live_workers(&self, cluster: &str) -> Vec<Arc<FakeWorker>> {
        self.workers()
            .into_iter()
            .filter(|w| w.cluster == cluster && !w.is_shut_down())
            .collect()
    }
}

#[async_trait]
impl SynchroFactory for FakeFactory {
    async fn create(
        &self,
        cluster: &str,
        config: ConnectionConfig,
        _storage: Arc<dyn ClusterStorage>,
        _status: StatusCallback,
    ) -> Result<Arc<dyn SynchroWorker>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(OperatorError::KubeApi(format!("{} unreachable", cluster)));
            }
        }
        let worker = Arc::new(FakeWorker {
            cluster: cluster.to_string(),
            config,
            shutdowns: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            halt: CancellationToken::new(),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            journal: self.journal.clone(),
        });
        self.journal.record(format!("create:{}", cluster));
        self.workers.lock().unwrap().push(worker.clone());
        Ok(worker)
    }
}
