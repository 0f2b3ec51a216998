//! Inbound event normalization.
//!
//! Deliveries come either straight from the git provider (`X-GitHub-Event`)
//! or through the relay (`X-Relay-Event`), in JSON or as a form field
//! holding JSON. Both shapes are reduced to [`InboundEvent`].

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::errors::DeployError;
use crate::models::deployment::{ArtifactDescriptor, CommitInfo};

/// Event headers relevant to parsing
#[derive(Debug, Clone, Default)]
pub struct EventHeaders {
    pub relay_event: Option<String>,
    pub provider_event: Option<String>,
    pub content_type: Option<String>,
}

/// Normalized event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Ping,

    NewCommit {
        branch: Option<String>,
        commit: CommitInfo,
        actor: Option<String>,
    },

    BuildRunning {
        correlation_id: String,
        build_url: Option<String>,
        sha: Option<String>,
    },

    ArtifactReady {
        correlation_id: Option<String>,
        sha: Option<String>,
        artifact: ArtifactDescriptor,
    },

    BuildCompleted {
        correlation_id: String,
        sha: Option<String>,
        branch: Option<String>,
        conclusion: String,
    },

    BuildFailed {
        correlation_id: Option<String>,
        sha: Option<String>,
        conclusion: String,
    },

    SnapshotReady {
        sha: String,
        url: Option<String>,
    },

    /// Well-formed but nothing to act on
    Ignored(String),
}

impl InboundEvent {
    /// Whether the event can change deployment state
    pub fn is_actionable(&self) -> bool {
        !matches!(self, InboundEvent::Ping | InboundEvent::Ignored(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Ping => "ping",
            InboundEvent::NewCommit { .. } => "new_commit",
            InboundEvent::BuildRunning { .. } => "workflow_running",
            InboundEvent::ArtifactReady { .. } => "artifact_ready",
            InboundEvent::BuildCompleted { .. } => "workflow_completed",
            InboundEvent::BuildFailed { .. } => "workflow_failed",
            InboundEvent::SnapshotReady { .. } => "clone_ready",
            InboundEvent::Ignored(_) => "ignored",
        }
    }
}

/// Event plus the repository it claims to come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub repository: Option<String>,
    pub event: InboundEvent,
}

// ================================ WIRE SHAPES ================================ //

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdField {
    Number(u64),
    Text(String),
}

impl IdField {
    fn into_string(self) -> String {
        match self {
            IdField::Number(n) => n.to_string(),
            IdField::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RepositoryField {
    Name(String),
    Object {
        #[serde(default)]
        full_name: Option<String>,
    },
}

impl RepositoryField {
    fn into_name(self) -> Option<String> {
        match self {
            RepositoryField::Name(name) => Some(name),
            RepositoryField::Object { full_name } => full_name,
        }
        .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelayCommit {
    #[serde(default, alias = "id")]
    sha: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayArtifact {
    #[serde(default)]
    id: Option<IdField>,
    #[serde(default = "default_artifact_name")]
    name: String,
    #[serde(default, alias = "sizeInBytes", alias = "size")]
    size_in_bytes: Option<u64>,
    #[serde(default, alias = "downloadUrl", alias = "signed_url", alias = "url")]
    download_url: Option<String>,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
}

fn default_artifact_name() -> String {
    "artifact".to_string()
}

impl RelayArtifact {
    fn into_descriptor(self) -> Result<ArtifactDescriptor, DeployError> {
        let id = match self.id {
            Some(id) => {
                let id = id.into_string();
                Some(id.parse::<u64>().map_err(|_| {
                    DeployError::MalformedEvent(format!("artifact id '{}' is not numeric", id))
                })?)
            }
            None => None,
        };
        Ok(ArtifactDescriptor {
            id,
            name: self.name,
            size_in_bytes: self.size_in_bytes,
            download_url: self.download_url,
            expires_at: self.expires_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RelayPayload {
    #[serde(default)]
    repository: Option<RepositoryField>,
    #[serde(default, alias = "commit_sha", alias = "head_sha")]
    sha: Option<String>,
    #[serde(default)]
    commit: Option<RelayCommit>,
    #[serde(default, alias = "workflow_run_id", alias = "correlation_id")]
    run_id: Option<IdField>,
    #[serde(default, alias = "html_url", alias = "build_url")]
    run_url: Option<String>,
    #[serde(default, alias = "ref")]
    branch: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    artifact: Option<RelayArtifact>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default, alias = "error")]
    message: Option<String>,
    #[serde(default, alias = "clone_url", alias = "download_url")]
    snapshot_url: Option<String>,
}

impl RelayPayload {
    fn sha(&self) -> Option<String> {
        self.commit
            .as_ref()
            .and_then(|c| c.sha.clone())
            .or_else(|| self.sha.clone())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct PushAuthor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    author: Option<PushAuthor>,
}

#[derive(Debug, Deserialize)]
struct Pusher {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    repository: Option<RepositoryField>,
    #[serde(default)]
    head_commit: Option<PushCommit>,
    #[serde(default)]
    pusher: Option<Pusher>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunBody {
    id: IdField,
    head_sha: String,
    #[serde(default)]
    head_branch: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunPayload {
    #[serde(default)]
    action: Option<String>,
    workflow_run: WorkflowRunBody,
    #[serde(default)]
    repository: Option<RepositoryField>,
}

// ================================== PARSING ================================== //

/// Strip `refs/heads/` from a ref
pub fn branch_name(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

/// Extract the JSON document from a delivery body
fn json_body(body: &[u8], content_type: Option<&str>) -> Result<serde_json::Value, DeployError> {
    let form = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if form {
        let payload = url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| DeployError::MalformedEvent("form body has no payload field".to_string()))?;
        return serde_json::from_str(&payload)
            .map_err(|e| DeployError::MalformedEvent(format!("payload field: {e}")));
    }

    serde_json::from_slice(body).map_err(|e| DeployError::MalformedEvent(format!("body: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    event: &str,
) -> Result<T, DeployError> {
    serde_json::from_value(value)
        .map_err(|e| DeployError::MalformedEvent(format!("{event} payload: {e}")))
}

fn require<T>(value: Option<T>, event: &str, field: &str) -> Result<T, DeployError> {
    value.ok_or_else(|| DeployError::MalformedEvent(format!("{event} without {field}")))
}

fn parse_relay(event: &str, value: serde_json::Value) -> Result<ParsedEvent, DeployError> {
    if event == "ping" {
        return Ok(ParsedEvent {
            repository: None,
            event: InboundEvent::Ping,
        });
    }

    let payload: RelayPayload = decode(value, event)?;
    let sha = payload.sha();
    let repository = payload.repository.and_then(RepositoryField::into_name);
    let correlation_id = payload.run_id.map(IdField::into_string);

    let parsed = match event {
        "new_commit" => {
            let sha = require(sha, event, "commit sha")?;
            let commit = payload.commit.unwrap_or_default();
            InboundEvent::NewCommit {
                branch: payload.branch.map(|b| branch_name(&b).to_string()),
                commit: CommitInfo {
                    sha,
                    message: commit.message,
                    author: commit.author,
                    timestamp: commit.timestamp,
                },
                actor: payload.actor,
            }
        }
        "workflow_running" => InboundEvent::BuildRunning {
            correlation_id: require(correlation_id, event, "run id")?,
            build_url: payload.run_url,
            sha,
        },
        "artifact_ready" => {
            let artifact = require(payload.artifact, event, "artifact")?.into_descriptor()?;
            if correlation_id.is_none() && sha.is_none() {
                return Err(DeployError::MalformedEvent(
                    "artifact_ready without run id or commit".to_string(),
                ));
            }
            InboundEvent::ArtifactReady {
                correlation_id,
                sha,
                artifact,
            }
        }
        "workflow_failed" => {
            if correlation_id.is_none() && sha.is_none() {
                return Err(DeployError::MalformedEvent(
                    "workflow_failed without run id or commit".to_string(),
                ));
            }
            InboundEvent::BuildFailed {
                correlation_id,
                sha,
                conclusion: payload
                    .conclusion
                    .or(payload.message)
                    .unwrap_or_else(|| "failure".to_string()),
            }
        }
        "clone_ready" => InboundEvent::SnapshotReady {
            sha: require(sha, event, "commit sha")?,
            url: payload.snapshot_url,
        },
        other => return Err(DeployError::UnsupportedEvent(other.to_string())),
    };

    Ok(ParsedEvent {
        repository,
        event: parsed,
    })
}

fn parse_provider(event: &str, value: serde_json::Value) -> Result<ParsedEvent, DeployError> {
    match event {
        "ping" => Ok(ParsedEvent {
            repository: None,
            event: InboundEvent::Ping,
        }),
        "push" => {
            let push: PushPayload = decode(value, event)?;
            let repository = push.repository.and_then(RepositoryField::into_name);

            let Some(branch) = push.git_ref.strip_prefix("refs/heads/") else {
                return Ok(ParsedEvent {
                    repository,
                    event: InboundEvent::Ignored(format!("{} is not a branch", push.git_ref)),
                });
            };
            if push.deleted {
                return Ok(ParsedEvent {
                    repository,
                    event: InboundEvent::Ignored(format!("branch {} deleted", branch)),
                });
            }

            let head = push.head_commit;
            let sha = head
                .as_ref()
                .map(|c| c.id.clone())
                .or(push.after)
                .filter(|s| !s.is_empty());
            let sha = require(sha, event, "head commit")?;
            let commit = CommitInfo {
                sha,
                message: head.as_ref().and_then(|c| c.message.clone()),
                author: head
                    .as_ref()
                    .and_then(|c| c.author.as_ref())
                    .and_then(|a| a.name.clone().or_else(|| a.username.clone())),
                timestamp: head.as_ref().and_then(|c| c.timestamp.clone()),
            };

            Ok(ParsedEvent {
                repository,
                event: InboundEvent::NewCommit {
                    branch: Some(branch.to_string()),
                    commit,
                    actor: push.pusher.and_then(|p| p.name),
                },
            })
        }
        "workflow_run" => {
            let payload: WorkflowRunPayload = decode(value, event)?;
            let repository = payload.repository.and_then(RepositoryField::into_name);
            let run = payload.workflow_run;
            let completed = payload.action.as_deref() == Some("completed")
                || run.status.as_deref() == Some("completed");

            let correlation_id = run.id.into_string();
            let event = if !completed {
                match payload.action.as_deref() {
                    Some("in_progress") => InboundEvent::BuildRunning {
                        correlation_id,
                        build_url: run.html_url,
                        sha: Some(run.head_sha),
                    },
                    action => InboundEvent::Ignored(format!(
                        "workflow_run {} not completed",
                        action.unwrap_or("update")
                    )),
                }
            } else {
                InboundEvent::BuildCompleted {
                    correlation_id,
                    sha: Some(run.head_sha),
                    branch: run.head_branch,
                    conclusion: run.conclusion.unwrap_or_else(|| "unknown".to_string()),
                }
            };

            Ok(ParsedEvent { repository, event })
        }
        other => Err(DeployError::UnsupportedEvent(other.to_string())),
    }
}

/// Normalize a verified delivery
pub fn parse_event(headers: &EventHeaders, body: &[u8]) -> Result<ParsedEvent, DeployError> {
    let value = json_body(body, headers.content_type.as_deref())?;

    if let Some(event) = headers.relay_event.as_deref().filter(|e| !e.is_empty()) {
        return parse_relay(event, value);
    }
    if let Some(event) = headers.provider_event.as_deref().filter(|e| !e.is_empty()) {
        return parse_provider(event, value);
    }

    let event = value
        .get("event")
        .and_then(|e| e.as_str())
        .map(str::to_string)
        .ok_or_else(|| DeployError::MalformedEvent("missing event type".to_string()))?;
    parse_relay(&event, value)
}
