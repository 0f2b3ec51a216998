//! Settings file management

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::models::deployment::DeploymentMethod;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Site name used to scope records and the processing lock
    #[serde(default = "default_site")]
    pub site: String,

    /// Source repository
    #[serde(default)]
    pub repository: RepositorySettings,

    /// Deployment behaviour
    #[serde(default)]
    pub deployment: DeploymentSettings,

    /// Webhook ingress
    #[serde(default)]
    pub webhook: WebhookSettings,

    /// Outcome relay
    #[serde(default)]
    pub relay: RelaySettings,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Enable the polling worker
    #[serde(default = "default_true")]
    pub enable_poller: bool,

    /// Polling interval in seconds
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_site() -> String {
    "default".to_string()
}

fn default_polling_interval() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            site: default_site(),
            repository: RepositorySettings::default(),
            deployment: DeploymentSettings::default(),
            webhook: WebhookSettings::default(),
            relay: RelaySettings::default(),
            server: ServerSettings::default(),
            enable_poller: true,
            polling_interval_secs: default_polling_interval(),
        }
    }
}

impl Settings {
    /// Check the settings can drive a deployment
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.repository.full_name().is_none() {
            return Err(DeployError::ConfigError(format!(
                "repository must be 'owner/name', got '{}'",
                self.repository.name
            )));
        }
        if self.deployment.live_dir.as_os_str().is_empty() {
            return Err(DeployError::ConfigError("deployment.live_dir is empty".to_string()));
        }
        if self.deployment.lock_ttl_secs == 0 {
            return Err(DeployError::ConfigError("deployment.lock_ttl_secs must be > 0".to_string()));
        }
        if self.deployment.max_task_attempts == 0 {
            return Err(DeployError::ConfigError(
                "deployment.max_task_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Source repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// `owner/name`
    #[serde(default)]
    pub name: String,

    /// Deployed branch
    #[serde(default = "default_branch")]
    pub branch: String,

    /// CI workflow file dispatched for builds
    #[serde(default = "default_workflow")]
    pub workflow: String,

    /// Provider API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Provider access token
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_workflow() -> String {
    "build-theme.yml".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

impl RepositorySettings {
    /// `(owner, name)` when the configured name is well formed
    pub fn full_name(&self) -> Option<(&str, &str)> {
        let (owner, repo) = self.name.split_once('/')?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return None;
        }
        Some((owner, repo))
    }
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            branch: default_branch(),
            workflow: default_workflow(),
            api_url: default_api_url(),
            token: None,
        }
    }
}

/// How extracted files replace the live directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    /// Stage next to the live directory and swap by rename
    #[default]
    Swap,

    /// Clear the live directory then copy into it
    InPlace,
}

/// Deployment behaviour settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSettings {
    #[serde(default)]
    pub method: DeploymentMethod,

    /// Directory served by the live site
    #[serde(default)]
    pub live_dir: PathBuf,

    /// Name of the deployment unit (theme directory name)
    #[serde(default)]
    pub unit_name: String,

    /// Files that mark the root of a deployable tree
    #[serde(default = "default_marker_files")]
    pub marker_files: Vec<String>,

    /// Non-manual deployments wait for an approval
    #[serde(default)]
    pub require_approval: bool,

    #[serde(default = "default_true")]
    pub backup_enabled: bool,

    /// Backups kept after a successful deployment
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    #[serde(default)]
    pub placement: PlacementMode,

    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Base delay before retrying a contended deployment
    #[serde(default = "default_reschedule_delay")]
    pub reschedule_delay_secs: u64,

    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,

    /// Recent remote runs scanned when binding a run to a commit
    #[serde(default = "default_recent_runs")]
    pub recent_runs_limit: u32,

    /// Seconds a started CI deployment may stay pending before the sweep
    /// requests its build again
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,
}

fn default_marker_files() -> Vec<String> {
    vec!["style.css".to_string(), "theme.json".to_string()]
}

fn default_backup_retention() -> usize {
    5
}

fn default_lock_ttl() -> u64 {
    300
}

fn default_reschedule_delay() -> u64 {
    60
}

fn default_max_task_attempts() -> u32 {
    5
}

fn default_recent_runs() -> u32 {
    10
}

fn default_pending_grace() -> u64 {
    120
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            method: DeploymentMethod::Ci,
            live_dir: PathBuf::new(),
            unit_name: String::new(),
            marker_files: default_marker_files(),
            require_approval: false,
            backup_enabled: true,
            backup_retention: default_backup_retention(),
            placement: PlacementMode::Swap,
            lock_ttl_secs: default_lock_ttl(),
            reschedule_delay_secs: default_reschedule_delay(),
            max_task_attempts: default_max_task_attempts(),
            recent_runs_limit: default_recent_runs(),
            pending_grace_secs: default_pending_grace(),
        }
    }
}

/// Webhook ingress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Shared HMAC secret; deliveries are rejected while unset
    #[serde(default, skip_serializing)]
    pub secret: Option<SecretString>,

    /// Reject actionable events that do not name a repository
    #[serde(default)]
    pub require_repository_identity: bool,

    /// Run continuations right after acknowledging instead of queueing them
    #[serde(default = "default_true")]
    pub inline_continuation: bool,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            secret: None,
            require_repository_identity: false,
            inline_continuation: true,
        }
    }
}

/// Outcome relay settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Endpoint receiving deployment outcome reports
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}
