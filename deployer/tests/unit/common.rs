//! Shared fixtures: a scripted build provider and an orchestrator over a
//! temporary directory

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use deployer::deploy::extract::ExtractOptions;
use deployer::deploy::orchestrator::{Orchestrator, OrchestratorSettings};
use deployer::errors::DeployError;
use deployer::models::deployment::{
    ArtifactDescriptor, DeploymentLock, DeploymentPatch, DeploymentRecord,
};
use deployer::retrieval::{OutcomeReport, Retrieval, RunState, RunStatus, TriggerOutcome};
use deployer::storage::memory::MemoryStore;
use deployer::storage::settings::PlacementMode;
use deployer::storage::store::{DeploymentFilter, DeploymentStore, LockAcquire};
use deployer::tasks::queue::TaskQueue;

/// Build provider whose answers are set by the test
pub struct FakeRetrieval {
    next_run: Mutex<u64>,
    pub bind_runs: Mutex<bool>,
    pub trigger_error: Mutex<Option<String>>,
    pub statuses: Mutex<HashMap<String, RunStatus>>,
    pub recent: Mutex<Vec<RunStatus>>,
    pub artifacts: Mutex<Vec<ArtifactDescriptor>>,
    pub archive: Mutex<Vec<u8>>,
    pub triggered: Mutex<Vec<String>>,
    pub fetched: Mutex<Vec<ArtifactDescriptor>>,
    pub snapshots: Mutex<Vec<(String, Option<String>)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub reports: Mutex<Vec<OutcomeReport>>,
}

impl Default for FakeRetrieval {
    fn default() -> Self {
        Self {
            next_run: Mutex::new(1000),
            bind_runs: Mutex::new(true),
            trigger_error: Mutex::new(None),
            statuses: Mutex::new(HashMap::new()),
            recent: Mutex::new(Vec::new()),
            artifacts: Mutex::new(Vec::new()),
            archive: Mutex::new(Vec::new()),
            triggered: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRetrieval {
    pub fn set_archive(&self, bytes: Vec<u8>) {
        *self.archive.lock().unwrap() = bytes;
    }

    pub fn set_status(&self, run: &str, state: RunState, conclusion: Option<&str>) {
        self.statuses.lock().unwrap().insert(
            run.to_string(),
            RunStatus {
                correlation_id: run.to_string(),
                state,
                conclusion: conclusion.map(str::to_string),
                url: Some(format!("https://ci.example.com/runs/{run}")),
                head_sha: None,
                created_at: None,
            },
        );
    }

    pub fn reports(&self) -> Vec<OutcomeReport> {
        self.reports.lock().unwrap().clone()
    }

    fn write_archive(&self, dest: &Path) -> Result<u64, DeployError> {
        let bytes = self.archive.lock().unwrap().clone();
        std::fs::write(dest, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

#[async_trait]
impl Retrieval for FakeRetrieval {
    async fn trigger_build(&self, _branch: &str, sha: &str) -> Result<TriggerOutcome, DeployError> {
        if let Some(message) = self.trigger_error.lock().unwrap().clone() {
            return Err(DeployError::RemoteTrigger(message));
        }
        self.triggered.lock().unwrap().push(sha.to_string());
        if !*self.bind_runs.lock().unwrap() {
            return Ok(TriggerOutcome::default());
        }
        let mut next = self.next_run.lock().unwrap();
        *next += 1;
        Ok(TriggerOutcome {
            correlation_id: Some(next.to_string()),
            build_url: Some(format!("https://ci.example.com/runs/{}", next)),
        })
    }

    async fn poll_status(&self, correlation_id: &str) -> Result<RunStatus, DeployError> {
        self.statuses
            .lock()
            .unwrap()
            .get(correlation_id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("run {correlation_id}")))
    }

    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<RunStatus>, DeployError> {
        let runs = self.recent.lock().unwrap().clone();
        Ok(runs.into_iter().take(limit as usize).collect())
    }

    async fn list_artifacts(
        &self,
        _correlation_id: &str,
    ) -> Result<Vec<ArtifactDescriptor>, DeployError> {
        Ok(self.artifacts.lock().unwrap().clone())
    }

    async fn fetch_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        dest: &Path,
    ) -> Result<u64, DeployError> {
        self.fetched.lock().unwrap().push(artifact.clone());
        self.write_archive(dest)
    }

    async fn fetch_source_snapshot(
        &self,
        git_ref: &str,
        url: Option<&str>,
        dest: &Path,
    ) -> Result<u64, DeployError> {
        self.snapshots
            .lock()
            .unwrap()
            .push((git_ref.to_string(), url.map(str::to_string)));
        self.write_archive(dest)
    }

    async fn cancel(&self, correlation_id: &str) -> Result<(), DeployError> {
        self.cancelled.lock().unwrap().push(correlation_id.to_string());
        Ok(())
    }

    async fn report_outcome(&self, report: &OutcomeReport) -> Result<(), DeployError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Memory store whose commit lookups fail a set number of times
pub struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl DeploymentStore for FlakyStore {
    async fn insert(&self, record: &DeploymentRecord) -> Result<String, DeployError> {
        self.inner.insert(record).await
    }

    async fn update(
        &self,
        id: &str,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, DeployError> {
        self.inner.update(id, patch).await
    }

    async fn get(&self, id: &str) -> Result<Option<DeploymentRecord>, DeployError> {
        self.inner.get(id).await
    }

    async fn get_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        self.inner.get_by_correlation(correlation_id).await
    }

    async fn get_by_commit(
        &self,
        site: &str,
        sha: &str,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeployError::StorageError("store unavailable".to_string()));
        }
        self.inner.get_by_commit(site, sha).await
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<DeploymentRecord>, DeployError> {
        self.inner.list(filter).await
    }

    async fn lock_acquire(
        &self,
        site: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockAcquire, DeployError> {
        self.inner.lock_acquire(site, holder, ttl).await
    }

    async fn lock_read(&self, site: &str) -> Result<Option<DeploymentLock>, DeployError> {
        self.inner.lock_read(site).await
    }

    async fn lock_release(&self, site: &str, holder: &str) -> Result<bool, DeployError> {
        self.inner.lock_release(site, holder).await
    }
}

/// Zip archive holding `files`
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<dyn DeploymentStore>,
    pub retrieval: Arc<FakeRetrieval>,
    pub queue: Arc<TaskQueue>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(configure: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), configure)
    }

    pub fn with_store(
        store: Arc<dyn DeploymentStore>,
        configure: impl FnOnce(&mut OrchestratorSettings),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = OrchestratorSettings {
            extract: ExtractOptions {
                unit_name: "mytheme".to_string(),
                marker_files: vec!["style.css".to_string()],
                placement: PlacementMode::Swap,
            },
            live_dir: dir.path().join("live"),
            backup_dir: dir.path().join("backups"),
            scratch_dir: dir.path().join("scratch"),
            ..Default::default()
        };
        configure(&mut settings);

        let retrieval = Arc::new(FakeRetrieval::default());
        let queue = Arc::new(TaskQueue::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            retrieval.clone(),
            queue.clone(),
            settings,
        ));

        Self {
            dir,
            store,
            retrieval,
            queue,
            orchestrator,
        }
    }

    pub fn live(&self) -> PathBuf {
        self.dir.path().join("live")
    }

    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }
}
