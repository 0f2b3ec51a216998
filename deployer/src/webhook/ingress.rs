//! Webhook ingress: authenticate, normalize, guard, route.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::deploy::orchestrator::{continuation_for, NotificationOutcome, Orchestrator, StartOutcome};
use crate::errors::DeployError;
use crate::models::deployment::{StartRequest, TriggerType};
use crate::storage::settings::Settings;
use crate::tasks::queue::TaskKind;
use crate::webhook::events::{parse_event, EventHeaders, InboundEvent, ParsedEvent};
use crate::webhook::signature::verify_signature;

/// Ingress settings
#[derive(Debug, Clone, Default)]
pub struct IngressSettings {
    pub secret: Option<SecretString>,

    /// Configured `owner/name`
    pub repository: String,

    pub branch: String,

    /// Reject actionable events that carry no repository identity
    pub require_repository_identity: bool,
}

impl IngressSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            secret: settings.webhook.secret.clone(),
            repository: settings.repository.name.clone(),
            branch: settings.repository.branch.clone(),
            require_repository_identity: settings.webhook.require_repository_identity,
        }
    }
}

/// A raw delivery
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub headers: EventHeaders,
    pub forwarded: bool,
}

/// What the ingress did with a delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressOutcome {
    pub message: String,
    pub deployment_id: Option<String>,

    /// Long-running work to run after the delivery is acknowledged
    pub continuation: Option<TaskKind>,
}

impl IngressOutcome {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

pub struct Ingress {
    settings: IngressSettings,
    orchestrator: Arc<Orchestrator>,
}

impl Ingress {
    pub fn new(settings: IngressSettings, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            settings,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Handle one delivery. Nothing is parsed before the signature checks out.
    pub async fn handle(&self, request: WebhookRequest<'_>) -> Result<IngressOutcome, DeployError> {
        verify_signature(self.settings.secret.as_ref(), request.body, request.signature)?;

        let parsed = parse_event(&request.headers, request.body)?;
        debug!(
            "Webhook {} received{}",
            parsed.event.name(),
            if request.forwarded { " via relay" } else { "" }
        );

        if parsed.event.is_actionable() {
            self.check_identity(&parsed)?;
        }

        self.route(parsed.event).await
    }

    fn check_identity(&self, parsed: &ParsedEvent) -> Result<(), DeployError> {
        match parsed.repository.as_deref() {
            Some(actual) if actual.eq_ignore_ascii_case(&self.settings.repository) => Ok(()),
            Some(actual) => Err(DeployError::IdentityMismatch {
                expected: self.settings.repository.clone(),
                actual: actual.to_string(),
            }),
            None if self.settings.require_repository_identity => {
                Err(DeployError::IdentityMismatch {
                    expected: self.settings.repository.clone(),
                    actual: "<none>".to_string(),
                })
            }
            None => {
                warn!(
                    "Webhook {} carries no repository identity, accepting it",
                    parsed.event.name()
                );
                Ok(())
            }
        }
    }

    fn on_branch(&self, branch: Option<&str>) -> bool {
        branch.map(|b| b == self.settings.branch).unwrap_or(true)
    }

    async fn route(&self, event: InboundEvent) -> Result<IngressOutcome, DeployError> {
        let orchestrator = &self.orchestrator;

        match event {
            InboundEvent::Ping => Ok(IngressOutcome::message("pong")),
            InboundEvent::Ignored(reason) => {
                debug!("Ignoring webhook: {}", reason);
                Ok(IngressOutcome::message(format!("ignored: {}", reason)))
            }

            InboundEvent::NewCommit {
                branch,
                commit,
                actor,
            } => {
                if !self.on_branch(branch.as_deref()) {
                    return Ok(IngressOutcome::message(format!(
                        "ignored: branch {} is not deployed",
                        branch.unwrap_or_default()
                    )));
                }

                let actor = actor
                    .or_else(|| commit.author.clone())
                    .unwrap_or_else(|| "webhook".to_string());
                info!("New commit {} from {}", commit.short_sha(), actor);
                let outcome = orchestrator
                    .start(StartRequest::new(commit, TriggerType::Webhook, actor))
                    .await?;

                let (message, continuation) = match &outcome {
                    StartOutcome::Started(record) => (
                        format!("deployment {}", record.status),
                        continuation_for(record),
                    ),
                    StartOutcome::Existing(record) => {
                        (format!("commit already has a {} deployment", record.status), None)
                    }
                    StartOutcome::AwaitingApproval(_) => ("deployment awaiting approval".to_string(), None),
                    StartOutcome::Deferred { blocking } => (
                        format!("deployment {} in progress, start deferred", blocking.id),
                        None,
                    ),
                };
                let deployment_id = match &outcome {
                    StartOutcome::Deferred { .. } => None,
                    other => Some(other.record().id.clone()),
                };
                Ok(IngressOutcome {
                    message,
                    deployment_id,
                    continuation,
                })
            }

            InboundEvent::BuildRunning {
                correlation_id,
                build_url,
                sha,
            } => {
                let record = orchestrator
                    .build_running(&correlation_id, build_url, sha.as_deref())
                    .await?;
                Ok(match record {
                    Some(record) => IngressOutcome {
                        message: "build running".to_string(),
                        deployment_id: Some(record.id),
                        continuation: None,
                    },
                    None => IngressOutcome::message("no building deployment for run"),
                })
            }

            InboundEvent::ArtifactReady {
                correlation_id,
                sha,
                artifact,
            } => {
                let outcome = orchestrator
                    .artifact_ready(correlation_id.as_deref(), sha.as_deref(), artifact)
                    .await?;
                Ok(Self::notification(outcome, "artifact accepted"))
            }

            InboundEvent::BuildCompleted {
                correlation_id,
                sha,
                branch,
                conclusion,
            } => {
                if !self.on_branch(branch.as_deref()) {
                    return Ok(IngressOutcome::message(format!(
                        "ignored: branch {} is not deployed",
                        branch.unwrap_or_default()
                    )));
                }
                let outcome = orchestrator
                    .build_completed(&correlation_id, sha.as_deref(), &conclusion)
                    .await?;
                Ok(Self::notification(outcome, "build completed"))
            }

            InboundEvent::BuildFailed {
                correlation_id,
                sha,
                conclusion,
            } => {
                let outcome = orchestrator
                    .build_failed(correlation_id.as_deref(), sha.as_deref(), &conclusion)
                    .await?;
                Ok(Self::notification(outcome, "build failure recorded"))
            }

            InboundEvent::SnapshotReady { sha, url } => {
                let outcome = orchestrator.snapshot_ready(&sha, url).await?;
                Ok(Self::notification(outcome, "snapshot accepted"))
            }
        }
    }

    fn notification(outcome: NotificationOutcome, accepted: &str) -> IngressOutcome {
        let record = outcome.record();
        let message = match &outcome {
            NotificationOutcome::Advanced(_) | NotificationOutcome::Updated(_) => accepted.to_string(),
            NotificationOutcome::Ignored(_) => format!("deployment already {}", record.status),
        };
        IngressOutcome {
            message,
            deployment_id: Some(record.id.clone()),
            continuation: match outcome {
                NotificationOutcome::Ignored(_) => None,
                _ => continuation_for(record),
            },
        }
    }
}
