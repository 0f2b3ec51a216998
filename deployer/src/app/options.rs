//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::deploy::extract::ExtractOptions;
use crate::deploy::orchestrator::OrchestratorSettings;
use crate::errors::DeployError;
use crate::http::github;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::CooldownOptions;
use crate::webhook::ingress::IngressSettings;
use crate::workers::{poller, scheduler};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Remote build provider and outcome relay
    pub retrieval: RetrievalOptions,

    /// Deployment orchestration
    pub orchestrator: OrchestratorSettings,

    /// Webhook ingress
    pub ingress: IngressSettings,

    /// Run continuations right after acknowledging a webhook
    pub inline_continuation: bool,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Enable polling worker
    pub enable_poller: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Scheduler worker options
    pub scheduler: scheduler::Options,

    /// Poller worker options
    pub poller: poller::Options,
}

impl AppOptions {
    /// Derive options from validated settings
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Result<Self, DeployError> {
        let (owner, repo) = settings.repository.full_name().ok_or_else(|| {
            DeployError::ConfigError(format!("invalid repository '{}'", settings.repository.name))
        })?;
        let deployment = &settings.deployment;

        let orchestrator = OrchestratorSettings {
            site: settings.site.clone(),
            branch: settings.repository.branch.clone(),
            method: deployment.method,
            require_approval: deployment.require_approval,
            backup_enabled: deployment.backup_enabled,
            backup_retention: deployment.backup_retention,
            lock_ttl: Duration::from_secs(deployment.lock_ttl_secs),
            reschedule: CooldownOptions {
                base_delay: Duration::from_secs(deployment.reschedule_delay_secs),
                ..OrchestratorSettings::default().reschedule
            },
            max_attempts: deployment.max_task_attempts,
            extract: ExtractOptions {
                unit_name: deployment.unit_name.clone(),
                marker_files: deployment.marker_files.clone(),
                placement: deployment.placement,
            },
            live_dir: deployment.live_dir.clone(),
            backup_dir: layout.backups_dir().path().to_path_buf(),
            scratch_dir: layout.scratch_dir().path().to_path_buf(),
            recent_runs_limit: deployment.recent_runs_limit,
            pending_grace: Duration::from_secs(deployment.pending_grace_secs),
        };

        let relay = settings
            .relay
            .url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .map(|url| (url, settings.relay.token.clone()));

        Ok(Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions { layout },
            retrieval: RetrievalOptions {
                api_url: settings.repository.api_url.clone(),
                token: settings.repository.token.clone(),
                owner: owner.to_string(),
                repo: repo.to_string(),
                relay,
                github: github::Options {
                    workflow: settings.repository.workflow.clone(),
                    ..Default::default()
                },
            },
            orchestrator,
            ingress: IngressSettings::from_settings(settings),
            inline_continuation: settings.webhook.inline_continuation,
            enable_server: settings.server.enabled,
            enable_poller: settings.enable_poller,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            scheduler: scheduler::Options::default(),
            poller: poller::Options {
                interval: Duration::from_secs(settings.polling_interval_secs.max(1)),
                ..Default::default()
            },
        })
    }
}

/// Lifecycle options for the deployer
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

/// Remote build provider options
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub api_url: String,
    pub token: Option<SecretString>,
    pub owner: String,
    pub repo: String,

    /// Outcome relay endpoint and token
    pub relay: Option<(String, Option<SecretString>)>,

    pub github: github::Options,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
