//! Orchestrator tests against a scripted build provider

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use deployer::deploy::orchestrator::{
    continuation_for, NotificationOutcome, ProcessOutcome, StartOutcome, DOWNLOAD_FILE,
};
use deployer::errors::DeployError;
use deployer::models::deployment::{
    ArtifactDescriptor, CommitInfo, DeploymentMethod, DeploymentPatch, DeploymentRecord,
    DeploymentStatus, FailurePoint, StartRequest, TriggerType,
};
use deployer::retrieval::{RunState, RunStatus};
use deployer::tasks::queue::TaskKind;
use deployer::workers::scheduler::run_due;

use crate::common::{zip_bytes, FlakyStore, Harness};

fn webhook(sha: &str) -> StartRequest {
    StartRequest::new(CommitInfo::new(sha), TriggerType::Webhook, "alice")
}

fn manual(sha: &str) -> StartRequest {
    StartRequest::new(CommitInfo::new(sha), TriggerType::Manual, "bob")
}

fn build_artifact() -> ArtifactDescriptor {
    ArtifactDescriptor {
        id: Some(77),
        name: "build".to_string(),
        size_in_bytes: Some(2048),
        ..Default::default()
    }
}

fn theme_zip() -> Vec<u8> {
    zip_bytes(&[
        ("mytheme/style.css", "body { color: red; }"),
        ("mytheme/index.php", "<?php"),
    ])
}

async fn started(h: &Harness, request: StartRequest) -> DeploymentRecord {
    match h.orchestrator.start(request).await.unwrap() {
        StartOutcome::Started(record) => record,
        other => panic!("expected a started deployment, got {other:?}"),
    }
}

/// Drive a webhook deployment up to queued
async fn queued(h: &Harness, sha: &str) -> DeploymentRecord {
    let record = started(h, webhook(sha)).await;
    let run = record.correlation_id.clone().unwrap();
    h.orchestrator
        .artifact_ready(Some(&run), None, build_artifact())
        .await
        .unwrap()
        .record()
        .clone()
}

#[tokio::test]
async fn test_ci_deployment_end_to_end() {
    let h = Harness::new();
    fs::create_dir_all(h.live()).unwrap();
    fs::write(h.live().join("old.css"), "old").unwrap();
    h.retrieval.set_archive(theme_zip());

    let record = started(&h, webhook("abc123")).await;
    assert_eq!(record.status, DeploymentStatus::Building);
    assert_eq!(record.correlation_id.as_deref(), Some("1001"));
    assert_eq!(*h.retrieval.triggered.lock().unwrap(), vec!["abc123"]);

    let outcome = h
        .orchestrator
        .artifact_ready(Some("1001"), None, build_artifact())
        .await
        .unwrap();
    let record = match outcome {
        NotificationOutcome::Advanced(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(record.status, DeploymentStatus::Queued);
    assert_eq!(record.artifact.as_ref().and_then(|a| a.id), Some(77));

    let continuation = continuation_for(&record).unwrap();
    assert_eq!(continuation, TaskKind::process(record.id.clone()));

    let record = match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Succeeded(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(record.status, DeploymentStatus::Success);
    assert!(record.deployed_at.is_some());
    let mut files = record.files.clone();
    files.sort();
    assert_eq!(files, vec!["index.php", "style.css"]);

    // live tree replaced, previous tree backed up
    assert!(!h.live().join("old.css").exists());
    assert_eq!(
        fs::read_to_string(h.live().join("style.css")).unwrap(),
        "body { color: red; }"
    );
    assert!(record.backup_path.as_ref().unwrap().is_file());

    // artifact metadata from the notification was used as-is
    assert_eq!(h.retrieval.fetched.lock().unwrap()[0].id, Some(77));

    assert!(!h.scratch().join(&record.id).exists());
    assert!(h.store.lock_read("default").await.unwrap().is_none());

    let reports = h.retrieval.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success);
    assert_eq!(reports[0].correlation_id.as_deref(), Some("1001"));
}

#[tokio::test]
async fn test_manual_trigger_conflicts_with_active() {
    let h = Harness::new();
    let active = started(&h, webhook("abc123")).await;

    match h.orchestrator.start(manual("def456")).await {
        Err(DeployError::Conflict(blocking)) => assert_eq!(blocking.id, active.id),
        other => panic!("expected a conflict, got {other:?}"),
    }

    let unchanged = h.orchestrator.get(&active.id).await.unwrap();
    assert_eq!(unchanged.status, DeploymentStatus::Building);
}

#[tokio::test]
async fn test_duplicate_artifact_after_success_is_noop() {
    let h = Harness::new();
    h.retrieval.set_archive(theme_zip());
    let record = queued(&h, "abc123").await;
    h.orchestrator.process(&record.id, 0).await.unwrap();

    let outcome = h
        .orchestrator
        .artifact_ready(Some("1001"), None, build_artifact())
        .await
        .unwrap();
    match outcome {
        NotificationOutcome::Ignored(record) => {
            assert_eq!(record.status, DeploymentStatus::Success);
            assert!(continuation_for(&record).is_none());
        }
        other => panic!("unexpected {other:?}"),
    }

    // a stray processing attempt does nothing either
    assert!(matches!(
        h.orchestrator.process(&record.id, 0).await.unwrap(),
        ProcessOutcome::Skipped(_)
    ));
    assert_eq!(h.retrieval.fetched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_webhook_start_is_idempotent() {
    let h = Harness::new();
    let first = started(&h, webhook("abc123")).await;

    match h.orchestrator.start(webhook("abc123")).await.unwrap() {
        StartOutcome::Existing(record) => assert_eq!(record.id, first.id),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.retrieval.triggered.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_newer_commit_supersedes_building() {
    let h = Harness::new();
    let stale = started(&h, webhook("abc123")).await;
    let fresh = started(&h, webhook("def456")).await;

    let stale = h.orchestrator.get(&stale.id).await.unwrap();
    assert_eq!(stale.status, DeploymentStatus::Cancelled);
    assert_eq!(fresh.status, DeploymentStatus::Building);
    assert_eq!(*h.retrieval.cancelled.lock().unwrap(), vec!["1001"]);

    let active: Vec<_> = h
        .orchestrator
        .list(10)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status.is_active())
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_start_deferred_while_deploying() {
    let h = Harness::new();
    let record = queued(&h, "abc123").await;
    h.store
        .update(
            &record.id,
            DeploymentPatch::transition(DeploymentStatus::Queued, DeploymentStatus::Deploying),
        )
        .await
        .unwrap();

    match h.orchestrator.start(webhook("def456")).await.unwrap() {
        StartOutcome::Deferred { blocking } => assert_eq!(blocking.id, record.id),
        other => panic!("unexpected {other:?}"),
    }
    assert!(
        h.queue
            .contains(&TaskKind::start(webhook("def456")))
            .await
    );
    let record = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Deploying);
}

#[tokio::test]
async fn test_contended_lock_keeps_rescheduling() {
    let h = Harness::new();
    h.retrieval.set_archive(theme_zip());
    let record = queued(&h, "abc123").await;
    h.store
        .lock_acquire("default", "someone-else", Duration::from_secs(60))
        .await
        .unwrap();

    match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Rescheduled { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_secs(60));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.queue.contains(&TaskKind::process(record.id.clone())).await);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Queued);

    // long waits settle at the capped delay instead of failing the record
    let max_delay = h.orchestrator.settings().reschedule.max_delay;
    match h.orchestrator.process(&record.id, 20).await.unwrap() {
        ProcessOutcome::Rescheduled { attempt, delay } => {
            assert_eq!(attempt, 21);
            assert_eq!(delay, max_delay);
        }
        other => panic!("unexpected {other:?}"),
    }
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Queued);
    assert!(current.log.contains("attempt 21"));

    // the foreign lock is untouched
    let lock = h.store.lock_read("default").await.unwrap().unwrap();
    assert_eq!(lock.holder, "someone-else");
}

#[tokio::test]
async fn test_failed_task_is_requeued_with_attempt_count() {
    let h = Harness::with_store(Arc::new(FlakyStore::new(1)), |s| {
        s.reschedule.base_delay = Duration::ZERO;
    });
    h.queue
        .schedule(TaskKind::start(webhook("abc123")), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(run_due(&h.orchestrator).await, 1);
    let pending = h.queue.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(h.orchestrator.list(10).await.unwrap().is_empty());

    assert_eq!(run_due(&h.orchestrator).await, 1);
    assert!(h.queue.is_empty().await);
    let records = h.orchestrator.list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeploymentStatus::Building);
}

#[tokio::test]
async fn test_failed_task_dropped_after_attempt_budget() {
    let h = Harness::with_store(Arc::new(FlakyStore::new(u32::MAX)), |s| {
        s.reschedule.base_delay = Duration::ZERO;
        s.max_attempts = 2;
    });
    h.queue
        .schedule(TaskKind::start(webhook("abc123")), Duration::ZERO)
        .await
        .unwrap();

    run_due(&h.orchestrator).await;
    assert_eq!(h.queue.len().await, 1);
    run_due(&h.orchestrator).await;
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn test_same_holder_skips() {
    let h = Harness::new();
    let record = queued(&h, "abc123").await;
    h.store
        .lock_acquire("default", &record.id, Duration::from_secs(60))
        .await
        .unwrap();

    assert!(matches!(
        h.orchestrator.process(&record.id, 0).await.unwrap(),
        ProcessOutcome::Skipped(_)
    ));
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn test_remote_build_failure_kept_verbatim() {
    let h = Harness::new();
    let record = started(&h, webhook("abc123")).await;

    let outcome = h
        .orchestrator
        .build_failed(Some("1001"), None, "startup_failure")
        .await
        .unwrap();
    let failed = match outcome {
        NotificationOutcome::Advanced(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(failed.id, record.id);
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("startup_failure"));
    assert_eq!(failed.failure_point, Some(FailurePoint::RemoteBuild));

    let reports = h.retrieval.reports();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success);
    let context = reports[0].context.as_ref().unwrap();
    assert_eq!(context.failure_point, Some(FailurePoint::RemoteBuild));
}

#[tokio::test]
async fn test_unsuccessful_completion_fails() {
    let h = Harness::new();
    started(&h, webhook("abc123")).await;

    let outcome = h
        .orchestrator
        .build_completed("1001", None, "cancelled")
        .await
        .unwrap();
    assert_eq!(outcome.record().status, DeploymentStatus::Failed);
    assert_eq!(outcome.record().error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_unknown_run_is_missing_correlation() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .artifact_ready(Some("999"), Some("ffffff"), build_artifact())
        .await;
    assert!(matches!(result, Err(DeployError::MissingCorrelation(_))));
}

#[tokio::test]
async fn test_artifact_lookup_when_completion_has_no_metadata() {
    let h = Harness::new();
    h.retrieval.set_archive(theme_zip());
    *h.retrieval.artifacts.lock().unwrap() = vec![
        ArtifactDescriptor {
            id: Some(5),
            name: "coverage".to_string(),
            ..Default::default()
        },
        ArtifactDescriptor {
            id: Some(6),
            name: "mytheme".to_string(),
            ..Default::default()
        },
    ];
    let record = started(&h, webhook("abc123")).await;

    let outcome = h
        .orchestrator
        .build_completed("1001", None, "success")
        .await
        .unwrap();
    assert_eq!(outcome.record().status, DeploymentStatus::Queued);
    assert!(outcome.record().artifact.is_none());

    let record = match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Succeeded(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(record.artifact.as_ref().and_then(|a| a.id), Some(6));
}

#[tokio::test]
async fn test_missing_artifact_fails_processing() {
    let h = Harness::new();
    let record = started(&h, webhook("abc123")).await;
    h.orchestrator
        .build_completed("1001", None, "success")
        .await
        .unwrap();

    let failed = match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Failed(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(failed.failure_point, Some(FailurePoint::ArtifactResolve));
    assert!(h.store.lock_read("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_corrupt_archive_leaves_live_untouched() {
    let h = Harness::new();
    fs::create_dir_all(h.live()).unwrap();
    fs::write(h.live().join("style.css"), "live").unwrap();
    h.retrieval.set_archive(b"definitely not an archive".to_vec());
    let record = queued(&h, "abc123").await;

    let failed = match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Failed(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.failure_point, Some(FailurePoint::ArchiveOpen));
    assert_eq!(fs::read_to_string(h.live().join("style.css")).unwrap(), "live");
    assert!(!h.scratch().join(&record.id).exists());
    assert!(h.store.lock_read("default").await.unwrap().is_none());

    // the report describes the download as it was before scratch cleanup
    let report = h.retrieval.reports().pop().unwrap();
    assert!(!report.success);
    let context = report.context.unwrap();
    let download = h.scratch().join(&record.id).join(DOWNLOAD_FILE);
    let state = context
        .diagnostics
        .files
        .iter()
        .find(|f| f.path == download.display().to_string())
        .unwrap();
    assert!(state.exists);
    assert_eq!(state.size_bytes, Some(25));
}

#[tokio::test]
async fn test_approval_flow() {
    let h = Harness::with(|s| s.require_approval = true);

    let record = match h.orchestrator.start(webhook("abc123")).await.unwrap() {
        StartOutcome::AwaitingApproval(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(record.status, DeploymentStatus::Pending);
    assert!(record.requires_approval);
    assert!(continuation_for(&record).is_none());
    assert!(h.retrieval.triggered.lock().unwrap().is_empty());

    let approved = h.orchestrator.approve(&record.id, "carol").await.unwrap();
    assert_eq!(approved.status, DeploymentStatus::Building);
    assert_eq!(approved.trigger, TriggerType::Manual);
    assert_eq!(approved.triggered_by, "carol");
    assert!(!approved.requires_approval);

    assert!(matches!(
        h.orchestrator.approve(&record.id, "carol").await,
        Err(DeployError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_only_before_queue() {
    let h = Harness::new();
    let record = started(&h, webhook("abc123")).await;

    let cancelled = h.orchestrator.cancel(&record.id, "dave").await.unwrap();
    assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
    assert_eq!(*h.retrieval.cancelled.lock().unwrap(), vec!["1001"]);

    let record = queued(&h, "def456").await;
    assert!(matches!(
        h.orchestrator.cancel(&record.id, "dave").await,
        Err(DeployError::InvalidTransition {
            from: DeploymentStatus::Queued,
            ..
        })
    ));
}

#[tokio::test]
async fn test_rollback_restores_previous_tree() {
    let h = Harness::new();
    fs::create_dir_all(h.live()).unwrap();
    fs::write(h.live().join("old.css"), "old").unwrap();
    h.retrieval.set_archive(theme_zip());
    let record = queued(&h, "abc123").await;
    h.orchestrator.process(&record.id, 0).await.unwrap();

    let rolled_back = h.orchestrator.rollback(&record.id, "erin").await.unwrap();
    assert_eq!(rolled_back.status, DeploymentStatus::RolledBack);
    assert_eq!(fs::read_to_string(h.live().join("old.css")).unwrap(), "old");
    assert!(!h.live().join("style.css").exists());
    assert!(h.store.lock_read("default").await.unwrap().is_none());

    assert!(matches!(
        h.orchestrator.rollback(&record.id, "erin").await,
        Err(DeployError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_rollback_without_backup() {
    let h = Harness::new();
    h.retrieval.set_archive(theme_zip());
    let record = queued(&h, "abc123").await;
    let record = match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Succeeded(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    // nothing was live before the first deployment
    assert!(record.backup_path.is_none());

    assert!(matches!(
        h.orchestrator.rollback(&record.id, "erin").await,
        Err(DeployError::BackupError(_))
    ));
    let record = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_manual_trigger_failure_surfaces() {
    let h = Harness::new();
    *h.retrieval.trigger_error.lock().unwrap() = Some("workflow not found".to_string());

    assert!(matches!(
        h.orchestrator.start(manual("abc123")).await,
        Err(DeployError::RemoteTrigger(_))
    ));
    let records = h.orchestrator.list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeploymentStatus::Failed);
    assert_eq!(records[0].failure_point, Some(FailurePoint::Trigger));
}

#[tokio::test]
async fn test_manual_trigger_requires_run_id() {
    let h = Harness::new();
    *h.retrieval.bind_runs.lock().unwrap() = false;

    assert!(matches!(
        h.orchestrator.start(manual("abc123")).await,
        Err(DeployError::RemoteTrigger(_))
    ));

    // webhook starts may bind the run later
    let record = started(&h, webhook("def456")).await;
    assert_eq!(record.status, DeploymentStatus::Building);
    assert!(record.correlation_id.is_none());
}

#[tokio::test]
async fn test_sweep_binds_current_run_and_advances() {
    let h = Harness::new();
    *h.retrieval.bind_runs.lock().unwrap() = false;
    let record = started(&h, webhook("abc123")).await;

    *h.retrieval.recent.lock().unwrap() = vec![
        RunStatus {
            correlation_id: "553".to_string(),
            state: RunState::Completed,
            conclusion: Some("failure".to_string()),
            url: None,
            head_sha: Some("abc123".to_string()),
            created_at: Some(record.created_at - chrono::Duration::hours(2)),
        },
        RunStatus {
            correlation_id: "554".to_string(),
            state: RunState::Completed,
            conclusion: Some("success".to_string()),
            url: None,
            head_sha: Some("0000000".to_string()),
            created_at: None,
        },
        RunStatus {
            correlation_id: "555".to_string(),
            state: RunState::InProgress,
            conclusion: None,
            url: Some("https://ci.example.com/runs/555".to_string()),
            head_sha: Some("abc123".to_string()),
            created_at: Some(record.created_at + chrono::Duration::seconds(3)),
        },
    ];
    h.retrieval.set_status("555", RunState::InProgress, None);

    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.advanced, 0);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.correlation_id.as_deref(), Some("555"));
    assert_eq!(current.status, DeploymentStatus::Building);

    h.retrieval
        .set_status("555", RunState::Completed, Some("success"));
    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.advanced, 1);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Queued);
    assert!(h.queue.contains(&TaskKind::process(record.id.clone())).await);
}

#[tokio::test]
async fn test_sweep_fails_unsuccessful_runs() {
    let h = Harness::new();
    let record = started(&h, webhook("abc123")).await;
    h.retrieval
        .set_status("1001", RunState::Completed, Some("timed_out"));

    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.failed, 1);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Failed);
    assert_eq!(current.error.as_deref(), Some("timed_out"));
}

#[tokio::test]
async fn test_sweep_recovers_interrupted_processing() {
    let h = Harness::new();
    let record = queued(&h, "abc123").await;
    h.store
        .update(
            &record.id,
            DeploymentPatch::transition(DeploymentStatus::Queued, DeploymentStatus::Deploying),
        )
        .await
        .unwrap();

    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.recovered, 1);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Failed);
    assert_eq!(current.failure_point, Some(FailurePoint::Interrupted));
}

#[tokio::test]
async fn test_sweep_leaves_live_processing_alone() {
    let h = Harness::new();
    let record = queued(&h, "abc123").await;
    h.store
        .update(
            &record.id,
            DeploymentPatch::transition(DeploymentStatus::Queued, DeploymentStatus::Deploying),
        )
        .await
        .unwrap();
    h.store
        .lock_acquire("default", &record.id, Duration::from_secs(60))
        .await
        .unwrap();

    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.recovered, 0);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Deploying);
}

fn orphaned_pending(sha: &str) -> DeploymentRecord {
    DeploymentRecord::new(
        "default",
        CommitInfo::new(sha),
        TriggerType::Webhook,
        "alice",
        DeploymentMethod::Ci,
    )
}

#[tokio::test]
async fn test_sweep_restarts_orphaned_pending_build() {
    let h = Harness::with(|s| s.pending_grace = Duration::ZERO);
    let record = orphaned_pending("abc123");
    h.store.insert(&record).await.unwrap();

    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.recovered, 1);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Building);
    assert_eq!(current.correlation_id.as_deref(), Some("1001"));
    assert_eq!(*h.retrieval.triggered.lock().unwrap(), vec!["abc123".to_string()]);

    // no longer blocks manual starts forever
    h.retrieval
        .set_status("1001", RunState::Completed, Some("failure"));
    h.orchestrator.poll_sweep().await.unwrap();
    assert!(matches!(
        h.orchestrator.start(manual("def456")).await.unwrap(),
        StartOutcome::Started(_)
    ));
}

#[tokio::test]
async fn test_sweep_waits_out_pending_grace() {
    let h = Harness::new();
    let record = orphaned_pending("abc123");
    h.store.insert(&record).await.unwrap();

    let report = h.orchestrator.poll_sweep().await.unwrap();
    assert_eq!(report.recovered, 0);
    let current = h.orchestrator.get(&record.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Pending);
    assert!(h.retrieval.triggered.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_direct_method_deploys_snapshot() {
    let h = Harness::with(|s| s.method = DeploymentMethod::Direct);
    h.retrieval.set_archive(theme_zip());

    let record = started(&h, webhook("abc123")).await;
    assert_eq!(record.status, DeploymentStatus::Pending);
    assert!(h.retrieval.triggered.lock().unwrap().is_empty());

    let snapshot = h
        .orchestrator
        .snapshot_ready("abc123", Some("https://relay.example.com/snap.zip".to_string()))
        .await
        .unwrap();
    assert!(matches!(snapshot, NotificationOutcome::Updated(_)));
    assert_eq!(
        continuation_for(snapshot.record()),
        Some(TaskKind::process(record.id.clone()))
    );

    let record = match h.orchestrator.process(&record.id, 0).await.unwrap() {
        ProcessOutcome::Succeeded(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(record.status, DeploymentStatus::Success);
    assert_eq!(
        *h.retrieval.snapshots.lock().unwrap(),
        vec![(
            "abc123".to_string(),
            Some("https://relay.example.com/snap.zip".to_string())
        )]
    );
}

#[tokio::test]
async fn test_deferred_start_runs_from_queue() {
    let h = Harness::new();
    h.orchestrator
        .run_kind(&TaskKind::start(webhook("abc123")), 0)
        .await
        .unwrap();

    let records = h.orchestrator.list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeploymentStatus::Building);
}
