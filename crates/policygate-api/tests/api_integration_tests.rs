//! API Integration Tests
//!
//! Drives the routers end to end with an in-process policy engine and a
//! recording action, so every request/response cycle is observable without
//! OPA or Docker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use policygate_api::{create_router, create_test_router, ApiConfig, AppState, GatewayMode};
use policygate_guard::{ActionError, ActionGate, ProtectedAction};
use policygate_policy::{
    ActionRequest, DecisionClient, DecisionQuery, EngineError, PolicyEngine, VerdictPath,
};
use policygate_store::PolicyStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const HEADER: &str = "package main.docker\n\ndefault allow = false\n";

// =============================================================================
// Test doubles
// =============================================================================

/// Allows an image when some stored rule body reads
/// `input.docker_image.name == "<image>"`.
struct RuleFileEngine {
    store: Arc<PolicyStore>,
}

#[async_trait]
impl PolicyEngine for RuleFileEngine {
    async fn evaluate(&self, query: &DecisionQuery) -> Result<Value, EngineError> {
        let image = query.input["docker_image"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let expected = format!("input.docker_image.name == \"{image}\"");
        let rules = self
            .store
            .rules()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let allow = rules.iter().any(|rule| rule.body == expected);
        Ok(json!({ "result": allow }))
    }
}

/// Admits pods in the `default` namespace only
struct NamespaceEngine;

#[async_trait]
impl PolicyEngine for NamespaceEngine {
    async fn evaluate(&self, query: &DecisionQuery) -> Result<Value, EngineError> {
        let allow = query.input["request"]["namespace"] == "default";
        Ok(json!({ "result": [{ "allow": allow }] }))
    }
}

/// Always fails as if OPA refused the connection
struct UnreachableEngine;

#[async_trait]
impl PolicyEngine for UnreachableEngine {
    async fn evaluate(&self, _query: &DecisionQuery) -> Result<Value, EngineError> {
        Err(EngineError::Transport("connection refused".to_string()))
    }
}

/// Answers with a document that has no usable decision
struct UndefinedEngine;

#[async_trait]
impl PolicyEngine for UndefinedEngine {
    async fn evaluate(&self, _query: &DecisionQuery) -> Result<Value, EngineError> {
        Ok(json!({}))
    }
}

#[derive(Default)]
struct RecordingAction {
    calls: AtomicUsize,
    subjects: Mutex<Vec<String>>,
}

impl RecordingAction {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtectedAction for RecordingAction {
    async fn perform(&self, request: &ActionRequest) -> Result<String, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.subjects
            .lock()
            .unwrap()
            .push(request.subject().to_string());
        Ok("container-id".to_string())
    }
}

struct FailingAction;

#[async_trait]
impl ProtectedAction for FailingAction {
    async fn perform(&self, _request: &ActionRequest) -> Result<String, ActionError> {
        Err(ActionError::new("docker daemon is not running"))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct DockerFixture {
    router: Router,
    action: Arc<RecordingAction>,
    store: Arc<PolicyStore>,
    _dir: TempDir,
}

async fn open_store(dir: &TempDir) -> Arc<PolicyStore> {
    let path = dir.path().join("docker.rego");
    std::fs::write(&path, HEADER).unwrap();
    Arc::new(PolicyStore::open(path).await.unwrap())
}

async fn docker_fixture() -> DockerFixture {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let action = Arc::new(RecordingAction::default());

    let engine = Arc::new(RuleFileEngine {
        store: store.clone(),
    });
    let gate = ActionGate::new(
        DecisionClient::new(engine, VerdictPath::Result),
        action.clone(),
    );
    let state = AppState::new(gate).with_store(store.clone());

    DockerFixture {
        router: create_test_router(Arc::new(state), GatewayMode::Docker),
        action,
        store,
        _dir: dir,
    }
}

fn gate_router(
    engine: Arc<dyn PolicyEngine>,
    path: VerdictPath,
    action: Arc<dyn ProtectedAction>,
    mode: GatewayMode,
) -> Router {
    let gate = ActionGate::new(DecisionClient::new(engine, path), action);
    create_test_router(Arc::new(AppState::new(gate)), mode)
}

/// Test helper to make a request and get JSON response
async fn json_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, bytes) = raw_request(router, method, uri, body).await;
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
    (status, json)
}

async fn raw_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");

    let body = if let Some(json_body) = body {
        Body::from(serde_json::to_vec(&json_body).unwrap())
    } else {
        Body::empty()
    };

    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, body_bytes.to_vec())
}

fn nginx_rule() -> Value {
    json!({ "name": "allow", "rule": "input.docker_image.name == \"nginx\"" })
}

fn review(namespace: &str) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "namespace": namespace,
            "operation": "CREATE",
            "object": { "kind": "Pod", "metadata": { "name": "web" } }
        }
    })
}

// =============================================================================
// Container gate
// =============================================================================

#[cfg(test)]
mod container_gate {
    use super::*;

    #[tokio::test]
    async fn test_allowed_image_runs() {
        let fixture = docker_fixture().await;

        let (status, _) =
            json_request(&fixture.router, "POST", "/policies", Some(nginx_rule())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, json) = json_request(&fixture.router, "GET", "/run/nginx", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["code"], "ALLOWED");
        assert_eq!(json["message"], "Container running with image nginx");
        assert_eq!(fixture.action.calls(), 1);
        assert_eq!(*fixture.action.subjects.lock().unwrap(), vec!["nginx"]);
    }

    #[tokio::test]
    async fn test_denied_image_never_runs() {
        let fixture = docker_fixture().await;
        json_request(&fixture.router, "POST", "/policies", Some(nginx_rule())).await;

        let (status, json) = json_request(&fixture.router, "GET", "/run/redis", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["code"], "POLICY_DENIED");
        assert_eq!(json["message"], "Policy violation: Image not allowed");
        assert_eq!(fixture.action.calls(), 0);
    }

    #[tokio::test]
    async fn test_image_with_registry_path() {
        let fixture = docker_fixture().await;
        let rule = json!({
            "name": "allow",
            "rule": "input.docker_image.name == \"registry.local/team/app:1.2\""
        });
        json_request(&fixture.router, "POST", "/policies", Some(rule)).await;

        let (status, json) = json_request(
            &fixture.router,
            "GET",
            "/run/registry.local/team/app:1.2",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(fixture.action.calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_not_a_denial() {
        let action = Arc::new(RecordingAction::default());
        let router = gate_router(
            Arc::new(UnreachableEngine),
            VerdictPath::Result,
            action.clone(),
            GatewayMode::Docker,
        );

        let (status, json) = json_request(&router, "GET", "/run/nginx", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["code"], "ENGINE_UNREACHABLE");
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_undefined_decision_is_malformed_verdict() {
        let action = Arc::new(RecordingAction::default());
        let router = gate_router(
            Arc::new(UndefinedEngine),
            VerdictPath::Result,
            action.clone(),
            GatewayMode::Docker,
        );

        let (status, json) = json_request(&router, "GET", "/run/nginx", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["code"], "MALFORMED_VERDICT");
        assert_eq!(action.calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_action_is_reported() {
        let router = gate_router(
            Arc::new(AllowAllEngine),
            VerdictPath::Result,
            Arc::new(FailingAction),
            GatewayMode::Docker,
        );

        let (status, json) = json_request(&router, "GET", "/run/nginx", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "ACTION_FAILED");
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("docker daemon is not running"));
    }

    #[tokio::test]
    async fn test_flag_like_image_is_rejected() {
        let fixture = docker_fixture().await;

        let (status, json) = json_request(&fixture.router, "GET", "/run/--privileged", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MALFORMED_REQUEST");
        assert_eq!(fixture.action.calls(), 0);
    }

    struct AllowAllEngine;

    #[async_trait]
    impl PolicyEngine for AllowAllEngine {
        async fn evaluate(&self, _query: &DecisionQuery) -> Result<Value, EngineError> {
            Ok(json!({ "result": true }))
        }
    }
}

// =============================================================================
// Policy administration
// =============================================================================

#[cfg(test)]
mod policy_admin {
    use super::*;

    #[tokio::test]
    async fn test_list_returns_file_verbatim() {
        let fixture = docker_fixture().await;

        let (status, body) = raw_request(&fixture.router, "GET", "/policies", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, HEADER.as_bytes());
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let fixture = docker_fixture().await;
        json_request(&fixture.router, "POST", "/policies", Some(nginx_rule())).await;

        let (_, body) = raw_request(&fixture.router, "GET", "/policies", None).await;
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(HEADER));
        assert!(text.ends_with("\nallow = \"input.docker_image.name == \\\"nginx\\\"\""));

        let (status, json) = json_request(&fixture.router, "GET", "/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["name"], "allow");
        assert_eq!(json[0]["body"], "input.docker_image.name == \"nginx\"");
    }

    #[tokio::test]
    async fn test_duplicate_rule_conflicts() {
        let fixture = docker_fixture().await;
        json_request(&fixture.router, "POST", "/policies", Some(nginx_rule())).await;

        let (status, json) =
            json_request(&fixture.router, "POST", "/policies", Some(nginx_rule())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "RULE_EXISTS");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let fixture = docker_fixture().await;

        let (status, json) = json_request(
            &fixture.router,
            "POST",
            "/policies",
            Some(json!({ "rule": "true" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MALFORMED_REQUEST");

        let (status, _) = json_request(
            &fixture.router,
            "POST",
            "/policies",
            Some(json!({ "name": "bad name", "rule": "true" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = raw_request(&fixture.router, "GET", "/policies", None).await;
        assert_eq!(body, HEADER.as_bytes());
    }

    #[tokio::test]
    async fn test_delete_removes_matching_lines() {
        let fixture = docker_fixture().await;
        let rule = json!({ "name": "nginx_ok", "rule": "input.docker_image.name == \"nginx\"" });
        json_request(&fixture.router, "POST", "/policies", Some(rule)).await;

        let (status, json) =
            json_request(&fixture.router, "DELETE", "/policies/nginx_ok", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 1);

        let (_, body) = raw_request(&fixture.router, "GET", "/policies", None).await;
        assert_eq!(body, HEADER.as_bytes());

        let (status, json) = json_request(&fixture.router, "GET", "/run/nginx", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{json}");
    }

    #[tokio::test]
    async fn test_delete_unknown_name_removes_nothing() {
        let fixture = docker_fixture().await;

        let (status, json) =
            json_request(&fixture.router, "DELETE", "/policies/missing", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 0);
    }

    #[tokio::test]
    async fn test_vanished_rule_file_is_unavailable() {
        let fixture = docker_fixture().await;
        std::fs::remove_file(fixture.store.path()).unwrap();

        let (status, json) = json_request(&fixture.router, "GET", "/policies", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "STORE_UNAVAILABLE");
    }
}

// =============================================================================
// Admission review
// =============================================================================

#[cfg(test)]
mod admission {
    use super::*;

    fn admission_router(engine: Arc<dyn PolicyEngine>) -> Router {
        gate_router(
            engine,
            VerdictPath::Binding("allow".to_string()),
            Arc::new(policygate_guard::AdmitPod),
            GatewayMode::Admission,
        )
    }

    #[tokio::test]
    async fn test_allowed_review() {
        let router = admission_router(Arc::new(NamespaceEngine));

        let (status, json) = json_request(&router, "POST", "/admit", Some(review("default"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(json["kind"], "AdmissionReview");
        assert_eq!(json["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(json["response"]["allowed"], true);
        assert_eq!(json["response"]["status"]["message"], "Allowed by policy");
    }

    #[tokio::test]
    async fn test_denied_review() {
        let router = admission_router(Arc::new(NamespaceEngine));

        let (status, json) =
            json_request(&router, "POST", "/admit", Some(review("kube-system"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["response"]["allowed"], false);
        assert_eq!(json["response"]["status"]["message"], "Denied by policy");
        assert_eq!(json["response"]["status"]["reason"], "Forbidden");
        assert_eq!(
            json["response"]["status"]["details"]["causes"][0]["message"],
            "Pod creation denied by policy"
        );
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_internal_error() {
        let router = admission_router(Arc::new(UnreachableEngine));

        let (status, json) = json_request(&router, "POST", "/admit", Some(review("default"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["response"]["allowed"], false);
        assert_eq!(json["response"]["status"]["reason"], "InternalError");
        assert_eq!(
            json["response"]["status"]["details"]["causes"][0]["reason"],
            "EvaluationFailed"
        );
    }

    #[tokio::test]
    async fn test_malformed_review_is_bad_request() {
        let router = admission_router(Arc::new(NamespaceEngine));

        let (status, json) = json_request(
            &router,
            "POST",
            "/admit",
            Some(json!({ "kind": "AdmissionReview" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MALFORMED_REQUEST");
    }

    #[tokio::test]
    async fn test_delete_review_without_object_is_refused_in_kind() {
        // An evaluated review would fault against this engine
        let router = admission_router(Arc::new(UnreachableEngine));
        let delete_review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u-1",
                "namespace": "default",
                "operation": "DELETE",
                "object": null,
                "oldObject": { "kind": "Pod", "metadata": { "name": "web" } }
            }
        });

        let (status, json) = json_request(&router, "POST", "/admit", Some(delete_review)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["kind"], "AdmissionReview");
        assert_eq!(json["response"]["uid"], "u-1");
        assert_eq!(json["response"]["allowed"], false);
        assert_eq!(json["response"]["status"]["reason"], "BadRequest");
        assert_eq!(json["response"]["status"]["code"], 400);
        assert!(json["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .contains("u-1"));
    }

    #[tokio::test]
    async fn test_review_without_uid_is_bad_request() {
        let router = admission_router(Arc::new(NamespaceEngine));
        let body = json!({
            "request": { "operation": "CREATE", "object": { "kind": "Pod" } }
        });

        let (status, json) = json_request(&router, "POST", "/admit", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MALFORMED_REQUEST");
    }

    #[tokio::test]
    async fn test_docker_routes_are_not_mounted() {
        let router = admission_router(Arc::new(NamespaceEngine));

        let (status, _) = json_request(&router, "GET", "/policies", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

// =============================================================================
// Health and middleware
// =============================================================================

#[cfg(test)]
mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let fixture = docker_fixture().await;

        let (status, json) = json_request(&fixture.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_reports_rule_store() {
        let fixture = docker_fixture().await;

        let (status, json) = json_request(&fixture.router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["components"][0]["name"], "rule_store");

        std::fs::remove_file(fixture.store.path()).unwrap();
        let (status, json) = json_request(&fixture.router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_full_router_sets_request_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let gate = ActionGate::new(
            DecisionClient::new(
                Arc::new(RuleFileEngine {
                    store: store.clone(),
                }),
                VerdictPath::Result,
            ),
            Arc::new(RecordingAction::default()),
        );
        let state = Arc::new(AppState::new(gate).with_store(store));
        let router = create_router(state, ApiConfig::default());

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }
}
