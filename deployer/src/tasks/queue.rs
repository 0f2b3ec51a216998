//! Deferred task queue.
//!
//! Tasks are delivered at least once: a task taken from the queue is gone,
//! and the runner schedules a follow-up explicitly (carrying the attempt
//! count forward) when the work could not complete. When backed by a file,
//! every mutation is persisted so pending work survives a restart.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::StartRequest;

/// Kind of deferred work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run artifact processing for a deployment
    ProcessDeployment { deployment_id: String },

    /// Start a deployment that was blocked by one in progress
    StartDeployment { request: StartRequest },

    /// Reconcile every active deployment
    PollSweep,
}

impl TaskKind {
    pub fn process(deployment_id: impl Into<String>) -> Self {
        TaskKind::ProcessDeployment {
            deployment_id: deployment_id.into(),
        }
    }

    pub fn start(request: StartRequest) -> Self {
        TaskKind::StartDeployment { request }
    }

    /// Two kinds describe the same work
    fn same_work(&self, other: &TaskKind) -> bool {
        match (self, other) {
            (
                TaskKind::StartDeployment { request: a },
                TaskKind::StartDeployment { request: b },
            ) => a.commit.sha.eq_ignore_ascii_case(&b.commit.sha),
            (a, b) => a == b,
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub kind: TaskKind,
    pub run_at: DateTime<Utc>,

    /// Attempts already made before this delivery
    pub attempts: u32,
}

/// In-process task queue, optionally persisted to a JSON file
pub struct TaskQueue {
    tasks: Mutex<Vec<ScheduledTask>>,
    file: Option<File>,
    notify: Notify,
}

impl TaskQueue {
    /// Create an in-memory queue
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            file: None,
            notify: Notify::new(),
        }
    }

    /// Open a queue persisted to `file`, loading pending tasks
    pub async fn open(file: File) -> Result<Self, DeployError> {
        let tasks = if file.exists().await {
            file.read_json::<Vec<ScheduledTask>>().await.map_err(|e| {
                DeployError::StorageError(format!(
                    "cannot read task queue {}: {}",
                    file.path().display(),
                    e
                ))
            })?
        } else {
            Vec::new()
        };

        if !tasks.is_empty() {
            info!("Loaded {} pending tasks from {}", tasks.len(), file.path().display());
        }

        Ok(Self {
            tasks: Mutex::new(tasks),
            file: Some(file),
            notify: Notify::new(),
        })
    }

    async fn persist(&self, tasks: &[ScheduledTask]) -> Result<(), DeployError> {
        if let Some(file) = &self.file {
            file.write_json(&tasks).await?;
        }
        Ok(())
    }

    /// Schedule `kind` to run after `delay`. If the same work is already
    /// queued, the existing task is kept (moved earlier if needed) and its id
    /// returned.
    pub async fn schedule(&self, kind: TaskKind, delay: Duration) -> Result<String, DeployError> {
        self.schedule_attempt(kind, delay, 0).await
    }

    /// Schedule a follow-up delivery that has already been tried `attempts`
    /// times.
    pub async fn schedule_attempt(
        &self,
        kind: TaskKind,
        delay: Duration,
        attempts: u32,
    ) -> Result<String, DeployError> {
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let mut tasks = self.tasks.lock().await;

        if let Some(existing) = tasks.iter_mut().find(|t| t.kind.same_work(&kind)) {
            if run_at < existing.run_at {
                existing.run_at = run_at;
            }
            existing.attempts = existing.attempts.max(attempts);
            let id = existing.id.clone();
            debug!("Task {} already queued, merged", id);
            self.persist(&tasks).await?;
            self.notify.notify_one();
            return Ok(id);
        }

        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            run_at,
            attempts,
        };
        let id = task.id.clone();
        debug!(
            "Scheduled task {} ({:?}) at {} (attempt {})",
            id, task.kind, task.run_at, attempts
        );
        tasks.push(task);
        self.persist(&tasks).await?;
        drop(tasks);

        self.notify.notify_one();
        Ok(id)
    }

    /// Remove and return every task due at `now`, earliest first
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let mut tasks = self.tasks.lock().await;
        let (mut due, rest): (Vec<_>, Vec<_>) = tasks.drain(..).partition(|t| t.run_at <= now);
        *tasks = rest;

        if !due.is_empty() {
            if let Err(e) = self.persist(&tasks).await {
                warn!("Failed to persist task queue: {}", e);
            }
        }

        due.sort_by_key(|t| t.run_at);
        due
    }

    /// Whether equivalent work is already queued
    pub async fn contains(&self, kind: &TaskKind) -> bool {
        self.tasks.lock().await.iter().any(|t| t.kind.same_work(kind))
    }

    /// Snapshot of queued tasks
    pub async fn pending(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Earliest run time among queued tasks
    pub async fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.tasks.lock().await.iter().map(|t| t.run_at).min()
    }

    /// Wait until a task is scheduled
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
