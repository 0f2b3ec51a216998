//! Deployment models

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, waiting for a build or an approval
    Pending,

    /// Remote build requested
    Building,

    /// Artifact available, waiting for the processing lock
    Queued,

    /// Artifact being extracted and placed
    Deploying,

    Success,
    Failed,
    Cancelled,
    RolledBack,
}

impl DeploymentStatus {
    /// Active statuses block new deployments on the same site
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Pending
                | DeploymentStatus::Building
                | DeploymentStatus::Queued
                | DeploymentStatus::Deploying
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Auto,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Webhook => "webhook",
            TriggerType::Auto => "auto",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the deployable files are obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMethod {
    /// Remote CI builds the theme and publishes an artifact
    #[default]
    Ci,

    /// A source snapshot of the commit is deployed as-is
    Direct,
}

impl DeploymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMethod::Ci => "ci",
            DeploymentMethod::Direct => "direct",
        }
    }
}

impl fmt::Display for DeploymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the pipeline a deployment failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePoint {
    Trigger,
    RemoteBuild,
    LockContention,
    ArtifactResolve,
    Download,
    Backup,
    ArchiveOpen,
    Extract,
    Copy,
    Interrupted,
    Internal,
}

impl FailurePoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePoint::Trigger => "trigger",
            FailurePoint::RemoteBuild => "remote_build",
            FailurePoint::LockContention => "lock_contention",
            FailurePoint::ArtifactResolve => "artifact_resolve",
            FailurePoint::Download => "download",
            FailurePoint::Backup => "backup",
            FailurePoint::ArchiveOpen => "archive_open",
            FailurePoint::Extract => "extract",
            FailurePoint::Copy => "copy",
            FailurePoint::Interrupted => "interrupted",
            FailurePoint::Internal => "internal",
        }
    }
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit the deployment is built from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub timestamp: Option<String>,
}

impl CommitInfo {
    pub fn new(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            ..Default::default()
        }
    }

    /// Abbreviated sha for log lines
    pub fn short_sha(&self) -> &str {
        let end = self.sha.len().min(7);
        self.sha.get(..end).unwrap_or(&self.sha)
    }
}

/// A build artifact or source snapshot reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Provider id, requires a lookup to download
    #[serde(default)]
    pub id: Option<u64>,

    pub name: String,

    #[serde(default)]
    pub size_in_bytes: Option<u64>,

    /// Pre-resolved, short-lived signed URL
    #[serde(default)]
    pub download_url: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactDescriptor {
    /// Whether the descriptor can be downloaded without a lookup
    pub fn has_signed_url(&self) -> bool {
        match (&self.download_url, &self.expires_at) {
            (Some(_), Some(expires_at)) => *expires_at > Utc::now(),
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// A deployment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,

    /// Site the deployment targets
    pub site: String,

    pub commit: CommitInfo,

    pub status: DeploymentStatus,

    pub trigger: TriggerType,

    /// Actor that triggered (or approved) the deployment
    pub triggered_by: String,

    pub method: DeploymentMethod,

    /// Waiting for a manual approval before anything runs
    #[serde(default)]
    pub requires_approval: bool,

    /// Remote build / run id
    #[serde(default)]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub build_url: Option<String>,

    #[serde(default)]
    pub artifact: Option<ArtifactDescriptor>,

    #[serde(default)]
    pub backup_path: Option<PathBuf>,

    /// Files placed in the live directory, relative paths
    #[serde(default)]
    pub files: Vec<String>,

    /// Append-only log text
    #[serde(default)]
    pub log: String,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub failure_point: Option<FailurePoint>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    /// Create a new pending record
    pub fn new(
        site: impl Into<String>,
        commit: CommitInfo,
        trigger: TriggerType,
        triggered_by: impl Into<String>,
        method: DeploymentMethod,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            site: site.into(),
            commit,
            status: DeploymentStatus::Pending,
            trigger,
            triggered_by: triggered_by.into(),
            method,
            requires_approval: false,
            correlation_id: None,
            build_url: None,
            artifact: None,
            backup_path: None,
            files: Vec::new(),
            log: String::new(),
            error: None,
            failure_point: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
        }
    }
}

/// Request to start a deployment for a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub commit: CommitInfo,
    pub trigger: TriggerType,
    pub actor: String,
}

impl StartRequest {
    pub fn new(commit: CommitInfo, trigger: TriggerType, actor: impl Into<String>) -> Self {
        Self {
            commit,
            trigger,
            actor: actor.into(),
        }
    }
}

/// Partial update of a deployment record.
///
/// `expected_status` turns the update into a compare-and-set: the store
/// rejects it when the record has moved on in the meantime.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    pub expected_status: Option<DeploymentStatus>,
    pub status: Option<DeploymentStatus>,
    pub trigger: Option<TriggerType>,
    pub triggered_by: Option<String>,
    pub requires_approval: Option<bool>,
    pub correlation_id: Option<String>,
    pub build_url: Option<String>,
    pub artifact: Option<ArtifactDescriptor>,
    pub backup_path: Option<PathBuf>,
    pub files: Option<Vec<String>>,
    pub append_log: Option<String>,
    pub error: Option<String>,
    pub failure_point: Option<FailurePoint>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl DeploymentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `from` -> `to`, failing if the record is no longer in `from`
    pub fn transition(from: DeploymentStatus, to: DeploymentStatus) -> Self {
        Self {
            expected_status: Some(from),
            status: Some(to),
            ..Default::default()
        }
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.append_log = Some(line.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>, point: FailurePoint) -> Self {
        self.error = Some(message.into());
        self.failure_point = Some(point);
        self
    }

    pub fn correlation(mut self, correlation_id: Option<String>, build_url: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self.build_url = build_url;
        self
    }

    pub fn artifact(mut self, artifact: ArtifactDescriptor) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Apply the patch to a record. The caller has already checked
    /// `expected_status`.
    pub fn apply(self, record: &mut DeploymentRecord) {
        let now = Utc::now();
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(trigger) = self.trigger {
            record.trigger = trigger;
        }
        if let Some(triggered_by) = self.triggered_by {
            record.triggered_by = triggered_by;
        }
        if let Some(requires_approval) = self.requires_approval {
            record.requires_approval = requires_approval;
        }
        if let Some(correlation_id) = self.correlation_id {
            record.correlation_id = Some(correlation_id);
        }
        if let Some(build_url) = self.build_url {
            record.build_url = Some(build_url);
        }
        if let Some(artifact) = self.artifact {
            record.artifact = Some(artifact);
        }
        if let Some(backup_path) = self.backup_path {
            record.backup_path = Some(backup_path);
        }
        if let Some(files) = self.files {
            record.files = files;
        }
        if let Some(line) = self.append_log {
            record
                .log
                .push_str(&format!("[{}] {}\n", now.format("%Y-%m-%d %H:%M:%S"), line));
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
        if let Some(point) = self.failure_point {
            record.failure_point = Some(point);
        }
        if let Some(deployed_at) = self.deployed_at {
            record.deployed_at = Some(deployed_at);
        }
        record.updated_at = now;
    }
}

/// Advisory processing lock for a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLock {
    pub site: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DeploymentLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
