//! Deployment orchestrator.
//!
//! Owns every status change of a deployment record. Inbound notifications
//! may arrive duplicated or out of order, so each operation re-reads the
//! record, checks the move against the state machine, and writes with a
//! compare-and-set on the status it observed. Losing a race is a no-op,
//! never a second transition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::deploy::backup::{create_backup, prune_backups, restore_backup};
use crate::deploy::extract::{extract_and_place, ExtractOptions};
use crate::deploy::fsm::{next_status, DeploymentEvent};
use crate::deploy::lock::{with_lock, LockOutcome};
use crate::diagnostics::{collect_diagnostics, FailureContext};
use crate::errors::DeployError;
use crate::models::deployment::{
    ArtifactDescriptor, DeploymentMethod, DeploymentPatch, DeploymentRecord, DeploymentStatus,
    FailurePoint, StartRequest, TriggerType,
};
use crate::retrieval::{OutcomeReport, Retrieval};
use crate::storage::store::{DeploymentFilter, DeploymentStore};
use crate::tasks::queue::{ScheduledTask, TaskKind, TaskQueue};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Name of the fetched archive inside a deployment's scratch directory
pub const DOWNLOAD_FILE: &str = "download";

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub site: String,

    /// Branch built and deployed
    pub branch: String,

    pub method: DeploymentMethod,

    /// Non-manual deployments wait for an approval
    pub require_approval: bool,

    pub backup_enabled: bool,
    pub backup_retention: usize,

    pub lock_ttl: Duration,

    /// Backoff for contended processing attempts
    pub reschedule: CooldownOptions,

    /// Deliveries of a failing task before it is dropped. Lock contention
    /// does not count against it.
    pub max_attempts: u32,

    pub extract: ExtractOptions,

    pub live_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub scratch_dir: PathBuf,

    /// Runs scanned when binding a run to a commit
    pub recent_runs_limit: u32,

    /// How long a started CI record may sit in pending before the
    /// sweep starts it again
    pub pending_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            site: "default".to_string(),
            branch: "main".to_string(),
            method: DeploymentMethod::Ci,
            require_approval: false,
            backup_enabled: true,
            backup_retention: 5,
            lock_ttl: Duration::from_secs(300),
            reschedule: CooldownOptions {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(900),
                multiplier: 2.0,
            },
            max_attempts: 5,
            extract: ExtractOptions::default(),
            live_dir: PathBuf::from("live"),
            backup_dir: PathBuf::from("backups"),
            scratch_dir: PathBuf::from("scratch"),
            recent_runs_limit: 10,
            pending_grace: Duration::from_secs(120),
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A new deployment was created and set in motion
    Started(DeploymentRecord),

    /// The commit already has an active or successful deployment
    Existing(DeploymentRecord),

    /// Created, waiting for a manual approval
    AwaitingApproval(DeploymentRecord),

    /// A deployment is mid-processing; the start was queued
    Deferred { blocking: DeploymentRecord },
}

impl StartOutcome {
    pub fn record(&self) -> &DeploymentRecord {
        match self {
            StartOutcome::Started(record)
            | StartOutcome::Existing(record)
            | StartOutcome::AwaitingApproval(record) => record,
            StartOutcome::Deferred { blocking } => blocking,
        }
    }
}

/// Result of a build notification
#[derive(Debug, Clone)]
pub enum NotificationOutcome {
    /// The record advanced
    Advanced(DeploymentRecord),

    /// The record took the new data without changing status
    Updated(DeploymentRecord),

    /// Nothing to do for the record's current status
    Ignored(DeploymentRecord),
}

impl NotificationOutcome {
    pub fn record(&self) -> &DeploymentRecord {
        match self {
            NotificationOutcome::Advanced(record)
            | NotificationOutcome::Updated(record)
            | NotificationOutcome::Ignored(record) => record,
        }
    }
}

/// Result of one processing attempt
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Nothing to do (terminal, not ready, or already running)
    Skipped(String),

    /// Lock was held by another deployment; retried later
    Rescheduled { attempt: u32, delay: Duration },

    Succeeded(DeploymentRecord),
    Failed(DeploymentRecord),
}

/// Counters for a polling sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub advanced: usize,
    pub failed: usize,
    pub recovered: usize,
}

/// Processing work implied by a record's current state, if any
pub fn continuation_for(record: &DeploymentRecord) -> Option<TaskKind> {
    let ready = match (record.method, record.status) {
        (_, DeploymentStatus::Queued) => true,
        (DeploymentMethod::Direct, DeploymentStatus::Pending) => !record.requires_approval,
        _ => false,
    };
    ready.then(|| TaskKind::process(record.id.clone()))
}

/// Deployment orchestrator
pub struct Orchestrator {
    store: Arc<dyn DeploymentStore>,
    retrieval: Arc<dyn Retrieval>,
    queue: Arc<TaskQueue>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        retrieval: Arc<dyn Retrieval>,
        queue: Arc<TaskQueue>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            retrieval,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    // ------------------------------ QUERIES ------------------------------- //

    pub async fn get(&self, id: &str) -> Result<DeploymentRecord, DeployError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {id}")))
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<DeploymentRecord>, DeployError> {
        self.store
            .list(&DeploymentFilter::new().site(&self.settings.site).limit(limit))
            .await
    }

    async fn active(&self) -> Result<Vec<DeploymentRecord>, DeployError> {
        self.store
            .list(&DeploymentFilter::new().site(&self.settings.site).active())
            .await
    }

    /// Record for a notification: by run id first, then by commit
    async fn locate(
        &self,
        correlation_id: Option<&str>,
        sha: Option<&str>,
    ) -> Result<DeploymentRecord, DeployError> {
        if let Some(correlation_id) = correlation_id {
            if let Some(record) = self.store.get_by_correlation(correlation_id).await? {
                return Ok(record);
            }
        }
        if let Some(sha) = sha {
            if let Some(record) = self.store.get_by_commit(&self.settings.site, sha).await? {
                return Ok(record);
            }
        }
        Err(DeployError::MissingCorrelation(
            correlation_id
                .map(|c| format!("run {c}"))
                .or_else(|| sha.map(|s| format!("commit {s}")))
                .unwrap_or_else(|| "an event without run id or commit".to_string()),
        ))
    }

    // ---------------------------- TRANSITIONS ----------------------------- //

    /// Patch for a legal move from `from` on `event`
    fn transition(from: DeploymentStatus, event: &DeploymentEvent) -> Result<DeploymentPatch, DeployError> {
        let to = next_status(from, event)?;
        Ok(DeploymentPatch::transition(from, to))
    }

    async fn note(&self, id: &str, line: impl Into<String>) {
        if let Err(e) = self.store.update(id, DeploymentPatch::new().log(line)).await {
            warn!("Failed to append to deployment {} log: {}", id, e);
        }
    }

    /// Move a record to failed and notify upstream. Losing the race to
    /// another transition is logged and the current record returned.
    async fn fail(
        &self,
        id: &str,
        message: &str,
        point: FailurePoint,
    ) -> Result<DeploymentRecord, DeployError> {
        let current = self.get(id).await?;
        let patch = match Self::transition(current.status, &DeploymentEvent::Failed(message.to_string())) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Not failing deployment {}: {}", id, e);
                return Ok(current);
            }
        };

        let record = match self
            .store
            .update(
                id,
                patch
                    .error(message, point)
                    .log(format!("Failed at {}: {}", point, message)),
            )
            .await
        {
            Ok(record) => record,
            Err(DeployError::StaleRecord { .. }) => {
                warn!("Deployment {} changed while failing it", id);
                return self.get(id).await;
            }
            Err(e) => return Err(e),
        };

        error!(
            "Deployment {} ({}) failed at {}: {}",
            record.id,
            record.commit.short_sha(),
            point,
            message
        );
        self.report(&record, false, Some(message.to_string())).await;
        Ok(record)
    }

    /// Best-effort upstream report
    async fn report(&self, record: &DeploymentRecord, success: bool, message: Option<String>) {
        let context = if success {
            None
        } else {
            let disk_paths = vec![
                self.settings.live_dir.clone(),
                self.settings.scratch_dir.clone(),
                self.settings.backup_dir.clone(),
            ];
            let work_dir = self.work_dir(&record.id);
            let mut file_paths = vec![
                work_dir.join(DOWNLOAD_FILE),
                work_dir,
                self.settings.live_dir.clone(),
            ];
            file_paths.extend(record.backup_path.iter().cloned());

            let diagnostics = tokio::task::spawn_blocking(move || {
                collect_diagnostics(&disk_paths, &file_paths)
            })
            .await;
            match diagnostics {
                Ok(diagnostics) => Some(FailureContext::from_record(record, diagnostics)),
                Err(e) => {
                    warn!("Failed to collect diagnostics: {}", e);
                    None
                }
            }
        };

        let report = OutcomeReport {
            deployment_id: record.id.clone(),
            correlation_id: record.correlation_id.clone(),
            success,
            message,
            logs: Some(record.log.clone()),
            context,
        };
        if let Err(e) = self.retrieval.report_outcome(&report).await {
            warn!("Failed to report outcome of deployment {}: {}", record.id, e);
        }
    }

    // ------------------------------- START -------------------------------- //

    /// Start a deployment for a commit
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, DeployError> {
        let manual = request.trigger == TriggerType::Manual;

        if !manual {
            if let Some(existing) = self
                .store
                .get_by_commit(&self.settings.site, &request.commit.sha)
                .await?
            {
                if existing.status.is_active() || existing.status == DeploymentStatus::Success {
                    debug!(
                        "Commit {} already has deployment {} ({})",
                        request.commit.short_sha(),
                        existing.id,
                        existing.status
                    );
                    return Ok(StartOutcome::Existing(existing));
                }
            }
        }

        let active = self.active().await?;
        if let Some(blocking) = active.first() {
            if manual {
                return Err(DeployError::Conflict(Box::new(blocking.clone())));
            }
            if let Some(deploying) = active
                .iter()
                .find(|r| r.status == DeploymentStatus::Deploying)
            {
                return self.defer_start(request, deploying.clone()).await;
            }
            for stale in &active {
                if let Err(e) = self.supersede(stale, &request).await {
                    if matches!(e, DeployError::StaleRecord { .. }) {
                        let blocking = self.get(&stale.id).await?;
                        return self.defer_start(request, blocking).await;
                    }
                    return Err(e);
                }
            }
        }

        let mut record = DeploymentRecord::new(
            &self.settings.site,
            request.commit.clone(),
            request.trigger,
            &request.actor,
            self.settings.method,
        );
        let awaiting_approval = self.settings.require_approval && !manual;
        record.requires_approval = awaiting_approval;
        self.store.insert(&record).await?;

        info!(
            "Created deployment {} for {} ({} by {})",
            record.id,
            record.commit.short_sha(),
            record.trigger,
            record.triggered_by
        );
        self.note(
            &record.id,
            format!(
                "Deployment of {} created by {} ({})",
                record.commit.short_sha(),
                record.triggered_by,
                record.trigger
            ),
        )
        .await;

        if awaiting_approval {
            self.note(&record.id, "Waiting for approval").await;
            return Ok(StartOutcome::AwaitingApproval(self.get(&record.id).await?));
        }

        let record = self.begin(&record.id).await?;
        Ok(StartOutcome::Started(record))
    }

    async fn defer_start(
        &self,
        request: StartRequest,
        blocking: DeploymentRecord,
    ) -> Result<StartOutcome, DeployError> {
        let delay = self.settings.reschedule.base_delay;
        info!(
            "Deployment {} is {}, deferring start of {} by {:?}",
            blocking.id,
            blocking.status,
            request.commit.short_sha(),
            delay
        );
        self.queue.schedule(TaskKind::start(request), delay).await?;
        Ok(StartOutcome::Deferred { blocking })
    }

    async fn supersede(
        &self,
        stale: &DeploymentRecord,
        request: &StartRequest,
    ) -> Result<(), DeployError> {
        let patch = Self::transition(stale.status, &DeploymentEvent::Supersede)?;
        self.store
            .update(
                &stale.id,
                patch.log(format!(
                    "Superseded by commit {}",
                    request.commit.short_sha()
                )),
            )
            .await?;
        info!(
            "Deployment {} superseded by commit {}",
            stale.id,
            request.commit.short_sha()
        );

        if stale.status == DeploymentStatus::Building {
            if let Some(run) = &stale.correlation_id {
                if let Err(e) = self.retrieval.cancel(run).await {
                    warn!("Failed to cancel superseded run {}: {}", run, e);
                }
            }
        }
        Ok(())
    }

    /// Set a pending, approved record in motion
    async fn begin(&self, id: &str) -> Result<DeploymentRecord, DeployError> {
        let record = self.get(id).await?;
        let manual = record.trigger == TriggerType::Manual;

        match record.method {
            DeploymentMethod::Direct => {
                self.note(id, "Snapshot processing scheduled").await;
                self.get(id).await
            }
            DeploymentMethod::Ci => {
                let outcome = match self
                    .retrieval
                    .trigger_build(&self.settings.branch, &record.commit.sha)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let message = e.to_string();
                        let failed = self.fail(id, &message, FailurePoint::Trigger).await?;
                        return if manual {
                            Err(DeployError::RemoteTrigger(message))
                        } else {
                            Ok(failed)
                        };
                    }
                };

                if manual && outcome.correlation_id.is_none() {
                    let message = "remote build started without a run id".to_string();
                    self.fail(id, &message, FailurePoint::Trigger).await?;
                    return Err(DeployError::RemoteTrigger(message));
                }

                let line = match &outcome.correlation_id {
                    Some(run) => format!("Remote build requested (run {})", run),
                    None => "Remote build requested".to_string(),
                };
                let patch = Self::transition(record.status, &DeploymentEvent::BuildStarted)?
                    .correlation(outcome.correlation_id, outcome.build_url)
                    .log(line);
                let record = self.store.update(id, patch).await?;
                info!("Deployment {} building", record.id);
                Ok(record)
            }
        }
    }

    // ---------------------------- USER ACTIONS ---------------------------- //

    /// Approve a record waiting for approval and start it as a manual run
    pub async fn approve(&self, id: &str, actor: &str) -> Result<DeploymentRecord, DeployError> {
        let record = self.get(id).await?;
        if record.status != DeploymentStatus::Pending || !record.requires_approval {
            return Err(DeployError::InvalidTransition {
                from: record.status,
                event: "approve".to_string(),
            });
        }

        let mut patch = DeploymentPatch::new().log(format!("Approved by {}", actor));
        patch.expected_status = Some(DeploymentStatus::Pending);
        patch.trigger = Some(TriggerType::Manual);
        patch.triggered_by = Some(actor.to_string());
        patch.requires_approval = Some(false);
        self.store.update(id, patch).await?;

        info!("Deployment {} approved by {}", id, actor);
        self.begin(id).await
    }

    /// Cancel a pending or building record
    pub async fn cancel(&self, id: &str, actor: &str) -> Result<DeploymentRecord, DeployError> {
        let record = self.get(id).await?;
        let patch = Self::transition(record.status, &DeploymentEvent::Cancel)?;
        let updated = self
            .store
            .update(id, patch.log(format!("Cancelled by {}", actor)))
            .await?;
        info!("Deployment {} cancelled by {}", id, actor);

        if record.status == DeploymentStatus::Building {
            if let Some(run) = &record.correlation_id {
                if let Err(e) = self.retrieval.cancel(run).await {
                    warn!("Failed to cancel remote run {}: {}", run, e);
                }
            }
        }
        Ok(updated)
    }

    /// Restore the backup taken before a successful deployment
    pub async fn rollback(&self, id: &str, actor: &str) -> Result<DeploymentRecord, DeployError> {
        let record = self.get(id).await?;
        let patch = Self::transition(record.status, &DeploymentEvent::RollBack)?;
        let backup = record
            .backup_path
            .clone()
            .filter(|p| p.is_file())
            .ok_or_else(|| {
                DeployError::BackupError(format!("deployment {} has no backup to restore", id))
            })?;

        let work_dir = self.settings.scratch_dir.join(format!("rollback-{}", id));
        let live_dir = self.settings.live_dir.clone();
        let outcome = with_lock(
            self.store.clone(),
            &self.settings.site,
            id,
            self.settings.lock_ttl,
            restore_backup(&backup, &work_dir, &live_dir),
        )
        .await?;

        match outcome {
            LockOutcome::Completed(Ok(files)) => {
                let mut patch = patch.log(format!(
                    "Rolled back by {} from {} ({} files)",
                    actor,
                    backup.display(),
                    files.len()
                ));
                patch.files = Some(files);
                let record = self.store.update(id, patch).await?;
                info!("Deployment {} rolled back by {}", id, actor);
                Ok(record)
            }
            LockOutcome::Completed(Err(e)) => {
                self.note(id, format!("Rollback failed: {}", e)).await;
                Err(e)
            }
            LockOutcome::Contended(lock) => Err(DeployError::LockHeld {
                site: lock.site,
                holder: lock.holder,
            }),
            LockOutcome::Panicked(message) => {
                self.note(id, format!("Rollback panicked: {}", message)).await;
                Err(DeployError::Internal(format!("rollback panicked: {}", message)))
            }
        }
    }

    // --------------------------- NOTIFICATIONS ---------------------------- //

    /// A remote run started: bind its id to the building record
    pub async fn build_running(
        &self,
        correlation_id: &str,
        build_url: Option<String>,
        sha: Option<&str>,
    ) -> Result<Option<DeploymentRecord>, DeployError> {
        let record = match self.locate(Some(correlation_id), sha).await {
            Ok(record) => record,
            Err(DeployError::MissingCorrelation(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if record.status != DeploymentStatus::Building {
            return Ok(None);
        }
        if record.correlation_id.as_deref() == Some(correlation_id) && build_url.is_none() {
            return Ok(Some(record));
        }

        let patch = DeploymentPatch {
            expected_status: Some(DeploymentStatus::Building),
            ..Default::default()
        }
        .correlation(Some(correlation_id.to_string()), build_url)
        .log(format!("Remote build running (run {})", correlation_id));

        match self.store.update(&record.id, patch).await {
            Ok(record) => Ok(Some(record)),
            Err(DeployError::StaleRecord { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// An artifact is available for a run
    pub async fn artifact_ready(
        &self,
        correlation_id: Option<&str>,
        sha: Option<&str>,
        artifact: ArtifactDescriptor,
    ) -> Result<NotificationOutcome, DeployError> {
        let record = self.locate(correlation_id, sha).await?;
        self.attach_artifact(record, correlation_id, Some(artifact)).await
    }

    /// A run completed; success advances without artifact metadata
    pub async fn build_completed(
        &self,
        correlation_id: &str,
        sha: Option<&str>,
        conclusion: &str,
    ) -> Result<NotificationOutcome, DeployError> {
        if conclusion != "success" {
            return self.build_failed(Some(correlation_id), sha, conclusion).await;
        }
        let record = self.locate(Some(correlation_id), sha).await?;
        self.attach_artifact(record, Some(correlation_id), None).await
    }

    async fn attach_artifact(
        &self,
        record: DeploymentRecord,
        correlation_id: Option<&str>,
        artifact: Option<ArtifactDescriptor>,
    ) -> Result<NotificationOutcome, DeployError> {
        let correlation = correlation_id
            .filter(|_| record.correlation_id.is_none())
            .map(str::to_string);

        match record.status {
            DeploymentStatus::Building => {
                let mut patch = Self::transition(record.status, &DeploymentEvent::ArtifactReady)?
                    .correlation(correlation, None)
                    .log(match &artifact {
                        Some(a) => format!("Artifact {} ready", a.name),
                        None => "Remote build succeeded".to_string(),
                    });
                patch.artifact = artifact;

                match self.store.update(&record.id, patch).await {
                    Ok(updated) => {
                        info!("Deployment {} queued", updated.id);
                        Ok(NotificationOutcome::Advanced(updated))
                    }
                    Err(DeployError::StaleRecord { .. }) => {
                        Ok(NotificationOutcome::Ignored(self.get(&record.id).await?))
                    }
                    Err(e) => Err(e),
                }
            }
            DeploymentStatus::Queued => {
                let Some(artifact) = artifact else {
                    return Ok(NotificationOutcome::Ignored(record));
                };
                let patch = DeploymentPatch {
                    expected_status: Some(DeploymentStatus::Queued),
                    ..Default::default()
                }
                .artifact(artifact)
                .log("Artifact refreshed");

                match self.store.update(&record.id, patch).await {
                    Ok(updated) => Ok(NotificationOutcome::Updated(updated)),
                    Err(DeployError::StaleRecord { .. }) => {
                        Ok(NotificationOutcome::Ignored(self.get(&record.id).await?))
                    }
                    Err(e) => Err(e),
                }
            }
            _ => {
                debug!(
                    "Ignoring artifact notification for deployment {} ({})",
                    record.id, record.status
                );
                Ok(NotificationOutcome::Ignored(record))
            }
        }
    }

    /// A run failed; the conclusion is kept verbatim as the error
    pub async fn build_failed(
        &self,
        correlation_id: Option<&str>,
        sha: Option<&str>,
        conclusion: &str,
    ) -> Result<NotificationOutcome, DeployError> {
        let record = self.locate(correlation_id, sha).await?;
        if !matches!(
            record.status,
            DeploymentStatus::Pending | DeploymentStatus::Building | DeploymentStatus::Queued
        ) {
            return Ok(NotificationOutcome::Ignored(record));
        }

        let failed = self.fail(&record.id, conclusion, FailurePoint::RemoteBuild).await?;
        if failed.status == DeploymentStatus::Failed {
            Ok(NotificationOutcome::Advanced(failed))
        } else {
            Ok(NotificationOutcome::Ignored(failed))
        }
    }

    /// A source snapshot is available for a direct deployment
    pub async fn snapshot_ready(
        &self,
        sha: &str,
        url: Option<String>,
    ) -> Result<NotificationOutcome, DeployError> {
        let record = self.locate(None, Some(sha)).await?;
        if record.method != DeploymentMethod::Direct || record.status != DeploymentStatus::Pending {
            return Ok(NotificationOutcome::Ignored(record));
        }
        let Some(url) = url else {
            return Ok(NotificationOutcome::Ignored(record));
        };

        let patch = DeploymentPatch {
            expected_status: Some(DeploymentStatus::Pending),
            ..Default::default()
        }
        .artifact(ArtifactDescriptor {
            name: "source-snapshot".to_string(),
            download_url: Some(url),
            ..Default::default()
        })
        .log("Source snapshot ready");

        match self.store.update(&record.id, patch).await {
            Ok(updated) => Ok(NotificationOutcome::Updated(updated)),
            Err(DeployError::StaleRecord { .. }) => {
                Ok(NotificationOutcome::Ignored(self.get(&record.id).await?))
            }
            Err(e) => Err(e),
        }
    }

    // ----------------------------- PROCESSING ----------------------------- //

    fn processable(record: &DeploymentRecord) -> bool {
        match record.method {
            DeploymentMethod::Ci => record.status == DeploymentStatus::Queued,
            DeploymentMethod::Direct => {
                record.status == DeploymentStatus::Pending && !record.requires_approval
            }
        }
    }

    /// Run artifact processing for a deployment. `attempts` counts earlier
    /// contended attempts.
    pub async fn process(&self, id: &str, attempts: u32) -> Result<ProcessOutcome, DeployError> {
        let record = self.get(id).await?;
        if record.status.is_terminal() {
            return Ok(ProcessOutcome::Skipped(format!("deployment is {}", record.status)));
        }
        if !Self::processable(&record) {
            return Ok(ProcessOutcome::Skipped(format!(
                "deployment is {} and not ready",
                record.status
            )));
        }

        let outcome = with_lock(
            self.store.clone(),
            &self.settings.site,
            id,
            self.settings.lock_ttl,
            self.process_locked(id),
        )
        .await?;

        match outcome {
            LockOutcome::Completed(result) => result,
            LockOutcome::Contended(lock) if lock.holder == id => Ok(ProcessOutcome::Skipped(
                "another attempt is in progress".to_string(),
            )),
            LockOutcome::Contended(lock) => self.contended(id, attempts, &lock.holder).await,
            LockOutcome::Panicked(message) => {
                self.cleanup_scratch(id).await;
                let record = self
                    .fail(id, &format!("processing panicked: {}", message), FailurePoint::Internal)
                    .await?;
                Ok(ProcessOutcome::Failed(record))
            }
        }
    }

    async fn contended(
        &self,
        id: &str,
        attempts: u32,
        holder: &str,
    ) -> Result<ProcessOutcome, DeployError> {
        let attempt = attempts + 1;
        let delay = calc_exp_backoff(&self.settings.reschedule, attempts);
        self.queue
            .schedule_attempt(TaskKind::process(id), delay, attempt)
            .await?;
        self.note(
            id,
            format!(
                "Lock held by {}, retrying in {}s (attempt {})",
                holder,
                delay.as_secs(),
                attempt
            ),
        )
        .await;
        info!(
            "Deployment {} waiting for lock held by {}, retry in {:?}",
            id, holder, delay
        );
        Ok(ProcessOutcome::Rescheduled { attempt, delay })
    }

    /// Critical section: runs with the site lock held
    async fn process_locked(&self, id: &str) -> Result<ProcessOutcome, DeployError> {
        let record = self.get(id).await?;
        if !Self::processable(&record) {
            return Ok(ProcessOutcome::Skipped(format!(
                "deployment moved to {}",
                record.status
            )));
        }

        let patch = Self::transition(record.status, &DeploymentEvent::ProcessingStarted)?
            .log("Processing started");
        let record = match self.store.update(id, patch).await {
            Ok(record) => record,
            Err(DeployError::StaleRecord { actual, .. }) => {
                return Ok(ProcessOutcome::Skipped(format!("deployment moved to {}", actual)));
            }
            Err(e) => return Err(e),
        };
        info!("Deployment {} ({}) deploying", id, record.commit.short_sha());

        let result = self.run_pipeline(&record).await;

        match result {
            Ok((files, backup_path)) => {
                let mut patch = Self::transition(record.status, &DeploymentEvent::Succeeded)?
                    .log(format!("Deployed {} files", files.len()));
                patch.files = Some(files);
                patch.backup_path = backup_path;
                patch.deployed_at = Some(Utc::now());
                let updated = self.store.update(id, patch).await;
                self.cleanup_scratch(id).await;
                let record = updated?;
                info!("Deployment {} succeeded", id);

                if self.settings.backup_enabled {
                    match prune_backups(
                        &self.settings.backup_dir,
                        &self.settings.site,
                        self.settings.backup_retention,
                    )
                    .await
                    {
                        Ok(0) => {}
                        Ok(n) => debug!("Pruned {} old backups", n),
                        Err(e) => warn!("Failed to prune backups: {}", e),
                    }
                }

                self.report(&record, true, Some("deployed".to_string())).await;
                Ok(ProcessOutcome::Succeeded(record))
            }
            Err(e) => {
                // the failure report inspects the scratch download
                let failed = self.fail(id, &e.to_string(), e.failure_point()).await;
                self.cleanup_scratch(id).await;
                Ok(ProcessOutcome::Failed(failed?))
            }
        }
    }

    fn work_dir(&self, id: &str) -> PathBuf {
        self.settings.scratch_dir.join(id)
    }

    async fn cleanup_scratch(&self, id: &str) {
        let work_dir = self.work_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", work_dir.display(), e);
            }
        }
    }

    async fn resolve_artifact(
        &self,
        record: &DeploymentRecord,
    ) -> Result<ArtifactDescriptor, DeployError> {
        if let Some(artifact) = &record.artifact {
            if artifact.has_signed_url() || artifact.id.is_some() {
                return Ok(artifact.clone());
            }
        }

        let run = record.correlation_id.as_deref().ok_or_else(|| {
            DeployError::ArtifactNotFound("no remote run bound to the deployment".to_string())
        })?;
        let artifacts = self
            .retrieval
            .list_artifacts(run)
            .await
            .map_err(|e| DeployError::ArtifactNotFound(format!("run {}: {}", run, e)))?;

        let unit = &self.settings.extract.unit_name;
        let artifact = artifacts
            .iter()
            .find(|a| !unit.is_empty() && a.name.eq_ignore_ascii_case(unit))
            .or_else(|| artifacts.first())
            .cloned()
            .ok_or_else(|| DeployError::ArtifactNotFound(format!("run {} has no artifacts", run)))?;

        self.store
            .update(
                &record.id,
                DeploymentPatch {
                    expected_status: Some(DeploymentStatus::Deploying),
                    ..Default::default()
                }
                .artifact(artifact.clone())
                .log(format!("Resolved artifact {}", artifact.name)),
            )
            .await?;
        Ok(artifact)
    }

    async fn run_pipeline(
        &self,
        record: &DeploymentRecord,
    ) -> Result<(Vec<String>, Option<PathBuf>), DeployError> {
        let work_dir = self.work_dir(&record.id);
        self.cleanup_scratch(&record.id).await;
        tokio::fs::create_dir_all(&work_dir).await?;
        let archive = work_dir.join(DOWNLOAD_FILE);

        let size = match record.method {
            DeploymentMethod::Ci => {
                let artifact = self.resolve_artifact(record).await?;
                self.retrieval.fetch_artifact(&artifact, &archive).await?
            }
            DeploymentMethod::Direct => {
                let url = record
                    .artifact
                    .as_ref()
                    .and_then(|a| a.download_url.as_deref());
                self.retrieval
                    .fetch_source_snapshot(&record.commit.sha, url, &archive)
                    .await?
            }
        };
        self.note(&record.id, format!("Downloaded {} bytes", size)).await;

        let backup_path = if self.settings.backup_enabled {
            let backup = create_backup(
                &self.settings.live_dir,
                &self.settings.backup_dir,
                &self.settings.site,
                record.commit.short_sha(),
            )
            .await?;
            match &backup {
                Some(path) => self.note(&record.id, format!("Backup saved to {}", path.display())).await,
                None => self.note(&record.id, "Nothing live to back up").await,
            }
            backup
        } else {
            None
        };

        let files = extract_and_place(
            &archive,
            &work_dir,
            &self.settings.live_dir,
            &self.settings.extract,
        )
        .await?;

        Ok((files, backup_path))
    }

    // ------------------------------- SWEEP -------------------------------- //

    /// Reconcile every active deployment with the remote side and the lock
    pub async fn poll_sweep(&self) -> Result<SweepReport, DeployError> {
        let mut report = SweepReport::default();

        for record in self.active().await? {
            report.checked += 1;
            if let Err(e) = self.sweep_one(&record, &mut report).await {
                warn!("Sweep of deployment {} failed: {}", record.id, e);
            }
        }

        if report != SweepReport::default() {
            info!(
                "Sweep checked {}, advanced {}, failed {}, recovered {}",
                report.checked, report.advanced, report.failed, report.recovered
            );
        }
        Ok(report)
    }

    async fn ensure_processing(&self, id: &str) -> Result<bool, DeployError> {
        let kind = TaskKind::process(id);
        if self.queue.contains(&kind).await {
            return Ok(false);
        }
        self.queue.schedule(kind, Duration::ZERO).await?;
        Ok(true)
    }

    async fn sweep_one(
        &self,
        record: &DeploymentRecord,
        report: &mut SweepReport,
    ) -> Result<(), DeployError> {
        match (record.status, record.method) {
            (DeploymentStatus::Building, DeploymentMethod::Ci) => {
                let run = match &record.correlation_id {
                    Some(run) => run.clone(),
                    None => {
                        let runs = self
                            .retrieval
                            .list_recent_runs(self.settings.recent_runs_limit)
                            .await?;
                        let Some(found) = runs.into_iter().find(|run| {
                            run.is_for_commit(&record.commit.sha)
                                && run.created_since(record.created_at)
                        }) else {
                            return Ok(());
                        };
                        self.build_running(
                            &found.correlation_id,
                            found.url.clone(),
                            Some(&record.commit.sha),
                        )
                        .await?;
                        found.correlation_id
                    }
                };

                let status = self.retrieval.poll_status(&run).await?;
                if !status.is_terminal() {
                    return Ok(());
                }
                let conclusion = status.conclusion.as_deref().unwrap_or("unknown");
                match self.build_completed(&run, None, conclusion).await? {
                    NotificationOutcome::Advanced(updated) if status.succeeded() => {
                        self.ensure_processing(&updated.id).await?;
                        report.advanced += 1;
                    }
                    NotificationOutcome::Advanced(_) => report.failed += 1,
                    _ => {}
                }
            }
            (DeploymentStatus::Queued, _) => {
                if self.ensure_processing(&record.id).await? {
                    report.advanced += 1;
                }
            }
            (DeploymentStatus::Deploying, _) => {
                let lock = self.store.lock_read(&self.settings.site).await?;
                let live = lock
                    .map(|l| l.holder == record.id && !l.is_expired(Utc::now()))
                    .unwrap_or(false);
                if !live {
                    warn!(
                        "Deployment {} is deploying without a live lock, marking failed",
                        record.id
                    );
                    self.fail(
                        &record.id,
                        "processing was interrupted",
                        FailurePoint::Interrupted,
                    )
                    .await?;
                    report.recovered += 1;
                }
            }
            (DeploymentStatus::Pending, DeploymentMethod::Ci) if !record.requires_approval => {
                let idle = Utc::now().signed_duration_since(record.updated_at);
                let settled = idle
                    .to_std()
                    .map(|idle| idle >= self.settings.pending_grace)
                    .unwrap_or(false);
                if !settled {
                    return Ok(());
                }
                warn!(
                    "Deployment {} never left pending, requesting its build again",
                    record.id
                );
                self.begin(&record.id).await?;
                report.recovered += 1;
            }
            (DeploymentStatus::Pending, DeploymentMethod::Direct) if !record.requires_approval => {
                if self.ensure_processing(&record.id).await? {
                    report.advanced += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ------------------------------- TASKS -------------------------------- //

    /// Run one unit of deferred work
    pub async fn run_kind(&self, kind: &TaskKind, attempts: u32) -> Result<(), DeployError> {
        match kind {
            TaskKind::ProcessDeployment { deployment_id } => {
                match self.process(deployment_id, attempts).await? {
                    ProcessOutcome::Skipped(reason) => {
                        debug!("Skipped processing {}: {}", deployment_id, reason)
                    }
                    ProcessOutcome::Rescheduled { .. } => {}
                    ProcessOutcome::Succeeded(_) | ProcessOutcome::Failed(_) => {}
                }
            }
            TaskKind::StartDeployment { request } => {
                let outcome = self.start(request.clone()).await?;
                if let StartOutcome::Started(record) = &outcome {
                    if let Some(kind) = continuation_for(record) {
                        self.queue.schedule(kind, Duration::ZERO).await?;
                    }
                }
            }
            TaskKind::PollSweep => {
                self.poll_sweep().await?;
            }
        }
        Ok(())
    }

    /// Run a queued task. A transient failure puts the task back on the
    /// queue with backoff until the attempt budget is spent.
    pub async fn run_task(&self, task: &ScheduledTask) -> Result<(), DeployError> {
        debug!("Running task {} ({:?}, attempt {})", task.id, task.kind, task.attempts);
        let result = self.run_kind(&task.kind, task.attempts).await;

        if let Err(e) = &result {
            let attempt = task.attempts + 1;
            if !e.is_transient() {
                error!("Task {} ({:?}) failed: {}", task.id, task.kind, e);
            } else if attempt >= self.settings.max_attempts {
                error!(
                    "Task {} ({:?}) failed {} times, dropping it: {}",
                    task.id, task.kind, attempt, e
                );
            } else {
                let delay = calc_exp_backoff(&self.settings.reschedule, task.attempts);
                self.queue
                    .schedule_attempt(task.kind.clone(), delay, attempt)
                    .await?;
                warn!(
                    "Task {} ({:?}) failed, retry {}/{} in {:?}: {}",
                    task.id,
                    task.kind,
                    attempt,
                    self.settings.max_attempts - 1,
                    delay,
                    e
                );
            }
        }
        result
    }

    /// Hand off follow-up work: spawn it now, or queue it for the scheduler
    pub async fn dispatch(self: &Arc<Self>, kind: TaskKind, inline: bool) -> Result<(), DeployError> {
        if !inline {
            self.queue.schedule(kind, Duration::ZERO).await?;
            return Ok(());
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_kind(&kind, 0).await {
                error!("Continuation {:?} failed: {}", kind, e);
            }
        });
        Ok(())
    }
}
