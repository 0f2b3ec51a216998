//! HTTP surface tests: webhook ingress and the deployment API

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use tower::ServiceExt;

use deployer::models::deployment::DeploymentStatus;
use deployer::server::serve::router;
use deployer::server::state::ServerState;
use deployer::tasks::queue::TaskKind;
use deployer::webhook::ingress::{Ingress, IngressSettings};
use deployer::webhook::signature::sign;

use crate::common::Harness;

const SECRET: &str = "topsecret";

fn app(h: &Harness, require_identity: bool) -> Router {
    let ingress = Ingress::new(
        IngressSettings {
            secret: Some(SecretString::from(SECRET)),
            repository: "acme/storefront".to_string(),
            branch: "main".to_string(),
            require_repository_identity: require_identity,
        },
        h.orchestrator.clone(),
    );
    let state = ServerState::new(h.orchestrator.clone(), Arc::new(ingress), false);
    router(Arc::new(state))
}

fn relay_request(event: &str, body: &Value) -> Request<Body> {
    let body = serde_json::to_vec(body).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("x-relay-event", event)
        .header("x-relay-forwarded", "true")
        .header("x-hub-signature-256", sign(SECRET, &body).unwrap())
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn new_commit(repository: Option<&str>, sha: &str) -> Value {
    let mut body = json!({
        "commit": {"sha": sha, "message": "Update header", "author": "alice"},
        "branch": "main"
    });
    if let Some(repository) = repository {
        body["repository"] = json!(repository);
    }
    body
}

#[tokio::test]
async fn test_bad_signature_rejected_before_parsing() {
    let h = Harness::new();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("x-relay-event", "new_commit")
        .header("x-hub-signature-256", "sha256=00ff")
        .body(Body::from("not even json"))
        .unwrap();

    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
    assert!(h.orchestrator.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_signature_rejected() {
    let h = Harness::new();
    let body = serde_json::to_vec(&new_commit(Some("acme/storefront"), "abc123")).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("x-relay-event", "new_commit")
        .header("x-hub-signature-256", "")
        .body(Body::from(body))
        .unwrap();

    let (status, _) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.orchestrator.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_new_commit_starts_deployment() {
    let h = Harness::new();
    let request = relay_request("new_commit", &new_commit(Some("ACME/Storefront"), "abc123"));

    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let id = body["deployment_id"].as_str().unwrap();
    let record = h.orchestrator.get(id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Building);
    assert_eq!(record.commit.message.as_deref(), Some("Update header"));
}

#[tokio::test]
async fn test_repository_identity_guard() {
    let h = Harness::new();

    let request = relay_request("new_commit", &new_commit(Some("mallory/storefront"), "abc123"));
    let (status, _) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(h.orchestrator.list(10).await.unwrap().is_empty());

    // absent identity: tolerated by default, rejected when required
    let request = relay_request("new_commit", &new_commit(None, "abc123"));
    let (status, _) = send(app(&h, true), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = relay_request("new_commit", &new_commit(None, "abc123"));
    let (status, _) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unsupported_and_ignored_events() {
    let h = Harness::new();

    let request = relay_request("deploy_everything", &json!({}));
    let (status, _) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = relay_request("ping", &json!({"zen": "Keep it logically awesome."}));
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], json!("pong"));

    let mut other_branch = new_commit(Some("acme/storefront"), "abc123");
    other_branch["branch"] = json!("refs/heads/feature");
    let (status, _) = send(app(&h, false), relay_request("new_commit", &other_branch)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.orchestrator.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_artifact_ready_queues_processing() {
    let h = Harness::new();
    let request = relay_request("new_commit", &new_commit(Some("acme/storefront"), "abc123"));
    let (_, body) = send(app(&h, false), request).await;
    let id = body["deployment_id"].as_str().unwrap().to_string();

    let artifact = json!({
        "repository": "acme/storefront",
        "run_id": "1001",
        "commit_sha": "abc123",
        "artifact": {"id": 77, "name": "build", "sizeInBytes": 2048}
    });
    let (status, body) = send(app(&h, false), relay_request("artifact_ready", &artifact)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployment_id"], json!(id));

    // acknowledged without processing, continuation handed to the queue
    let record = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Queued);
    assert!(h.queue.contains(&TaskKind::process(id.clone())).await);

    let unknown = json!({
        "repository": "acme/storefront",
        "run_id": "9999",
        "artifact": {"id": 1, "name": "build"}
    });
    let (status, _) = send(app(&h, false), relay_request("artifact_ready", &unknown)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_form_encoded_delivery_signed_over_raw_body() {
    let h = Harness::new();
    let payload = serde_json::to_string(&json!({
        "ref": "refs/heads/main",
        "after": "abc123",
        "repository": {"full_name": "acme/storefront"},
        "head_commit": {"id": "abc123", "message": "Tweak", "author": {"name": "Dana"}}
    }))
    .unwrap();
    let body: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("payload", &payload)
        .finish();

    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-github-event", "push")
        .header("x-hub-signature-256", sign(SECRET, body.as_bytes()).unwrap())
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["deployment_id"].is_string());
}

#[tokio::test]
async fn test_manual_trigger_conflict_exposes_blocker() {
    let h = Harness::new();
    let request = relay_request("new_commit", &new_commit(Some("acme/storefront"), "abc123"));
    let (_, body) = send(app(&h, false), request).await;
    let blocking_id = body["deployment_id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/deployments")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"commit_sha": "def456", "actor": "bob"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["blocking_deployment"]["id"], json!(blocking_id));
}

#[tokio::test]
async fn test_deployment_api() {
    let h = Harness::new();

    let request = Request::builder()
        .method("POST")
        .uri("/deployments")
        .header("content-type", "application/json")
        .body(Body::from(json!({"commit_sha": "abc123"}).to_string()))
        .unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["deployment"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["deployment"]["trigger"], json!("manual"));

    let request = Request::builder()
        .uri(format!("/deployments/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployment"]["status"], json!("building"));
    assert!(body["log"].as_str().unwrap().contains("Remote build requested"));

    let request = Request::builder()
        .method("POST")
        .uri(format!("/deployments/{id}/cancel"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployment"]["status"], json!("cancelled"));

    let request = Request::builder()
        .method("POST")
        .uri(format!("/deployments/{id}/rollback"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let request = Request::builder()
        .uri("/deployments?limit=5")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));

    let request = Request::builder()
        .uri("/deployments/does-not-exist")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("POST")
        .uri("/deployments/poll")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checked"], json!(0));
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app(&h, false), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
}
