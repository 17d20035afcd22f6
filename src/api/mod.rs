//! HTTP API server for opsflow.
//!
//! A thin axum layer over [`AdminService`] and the trigger hub. The host
//! application authenticates callers upstream and forwards identity in
//! headers: `x-tenant-id` (required on `/api`), `x-user-id`, `x-user-role`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::admin::AdminService;
use crate::engine::RunMode;
use crate::error::Error;
use crate::metrics::render_metrics;
use crate::storage::{ApprovalDecision, ApprovalStatus, ExecutionFilter, ExecutionStatus};
use crate::triggers::{Caller, WebhookCall, SECRET_HEADER, SIGNATURE_HEADER};
use crate::workflow::{parse_workflow, WorkflowStatus};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";

/// Request bodies above this size are rejected with 413.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
}

/// Error wrapper carrying the status mapping and sanitized body.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Full error stays in the logs; clients get the sanitized message.
        if status.is_server_error() {
            error!("API error: {:?}", self.0);
        } else {
            warn!("API request rejected: {}", self.0);
        }
        (status, Json(self.0.to_external_json())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = header_value(&parts.headers, TENANT_HEADER).ok_or_else(|| {
            Error::Permission(format!("Missing {} header", TENANT_HEADER))
        })?;
        let mut caller = Caller::new(tenant);
        if let Some(user) = header_value(&parts.headers, USER_HEADER) {
            caller = caller.with_user(user);
        }
        if let Some(role) = header_value(&parts.headers, ROLE_HEADER) {
            caller = caller.with_role(role);
        }
        Ok(caller)
    }
}

/// Create the API router (without state applied - call with_state on the result).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/webhooks/{path}", post(receive_webhook))
        .route("/api/events", post(emit_event))
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route("/api/workflows/{id}", get(get_workflow).put(update_workflow))
        .route("/api/workflows/{id}/status", post(set_workflow_status))
        .route("/api/workflows/{id}/trigger", post(trigger_workflow))
        .route("/api/workflows/{id}/versions", get(list_versions))
        .route("/api/workflows/{id}/versions/compare", get(compare_versions))
        .route("/api/workflows/{id}/rollback", post(rollback_workflow))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/logs", get(get_execution_logs))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/retry", post(retry_execution))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/{id}", post(submit_approval))
        .route("/api/actions", get(list_actions))
}

/// Create the complete API router with state.
pub fn create_router(state: AppState) -> Router {
    create_api_routes()
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Health and metrics
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.admin.engine();
    Json(json!({
        "status": "ok",
        "available_permits": engine.available_permits(),
        "max_concurrent_executions": engine.settings().max_concurrent_executions,
        "subscriptions": state.admin.hub().index().len().await,
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(),
    )
}

// ============================================================================
// Inbound triggers
// ============================================================================

async fn receive_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let call = WebhookCall {
        path: &path,
        signature: header_value(&headers, SIGNATURE_HEADER),
        secret: header_value(&headers, SECRET_HEADER),
        body: &body,
    };
    let response = match state.admin.hub().handle_webhook(call).await? {
        Some(execution) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "execution_id": execution.id,
                "status": execution.status,
            })),
        )
            .into_response(),
        None => Json(json!({ "status": "filtered" })).into_response(),
    };
    Ok(response)
}

/// Either an entity mutation (`entity` set) or a named domain event.
#[derive(Deserialize)]
struct EventRequest {
    #[serde(default)]
    entity: Option<String>,
    event: String,
    #[serde(default)]
    data: Value,
}

async fn emit_event(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<EventRequest>,
) -> impl IntoResponse {
    let hub = state.admin.hub();
    let user = caller.user_id.as_deref();
    let report = match &request.entity {
        Some(entity) => {
            hub.emit_entity_event(entity, &request.event, request.data, &caller.tenant_id, user)
                .await
        }
        None => {
            hub.emit_domain_event(&request.event, request.data, &caller.tenant_id, user)
                .await
        }
    };
    Json(report)
}

// ============================================================================
// Workflow Endpoints
// ============================================================================

#[derive(Deserialize)]
struct WorkflowQuery {
    #[serde(default)]
    status: Option<WorkflowStatus>,
}

async fn list_workflows(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<WorkflowQuery>,
) -> ApiResult<impl IntoResponse> {
    let workflows = state
        .admin
        .list_workflows(&caller.tenant_id, query.status)
        .await?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// Body is a YAML or JSON definition.
async fn create_workflow(
    State(state): State<AppState>,
    caller: Caller,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let workflow = parse_workflow(&body)?;
    let created = state.admin.create_workflow(&caller, workflow).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_workflow(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.admin.get_workflow(&caller.tenant_id, &id).await?))
}

async fn update_workflow(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let workflow = parse_workflow(&body)?;
    Ok(Json(state.admin.update_workflow(&caller, &id, workflow).await?))
}

#[derive(Deserialize)]
struct StatusRequest {
    status: WorkflowStatus,
}

async fn set_workflow_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.admin.set_status(&caller, &id, request.status).await?))
}

#[derive(Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    parameters: Value,
    /// Wait for the run to finish, up to `timeout_seconds` or the
    /// configured sync wait timeout.
    #[serde(default)]
    wait: bool,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

async fn trigger_workflow(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<impl IntoResponse> {
    let mode = if request.wait {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| state.admin.engine().settings().sync_wait_timeout());
        RunMode::Sync { timeout }
    } else {
        RunMode::Async
    };
    let execution = state
        .admin
        .trigger_workflow(&caller, &id, request.parameters, mode)
        .await?;
    let status = if execution.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(execution)))
}

async fn list_versions(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let versions = state.admin.list_versions(&caller.tenant_id, &id).await?;
    let summaries: Vec<Value> = versions
        .into_iter()
        .map(|v| {
            json!({
                "version": v.version,
                "created_at": v.created_at.to_rfc3339(),
                "created_by": v.created_by,
                "note": v.note,
            })
        })
        .collect();
    Ok(Json(json!({ "versions": summaries })))
}

#[derive(Deserialize)]
struct CompareQuery {
    from: u32,
    to: u32,
}

async fn compare_versions(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(query): Query<CompareQuery>,
) -> ApiResult<impl IntoResponse> {
    let diff = state
        .admin
        .compare_versions(&caller.tenant_id, &id, query.from, query.to)
        .await?;
    Ok(Json(diff))
}

#[derive(Deserialize)]
struct RollbackRequest {
    version: u32,
}

async fn rollback_workflow(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> ApiResult<impl IntoResponse> {
    let version = state.admin.rollback(&caller, &id, request.version).await?;
    Ok(Json(version.snapshot))
}

// ============================================================================
// Execution Endpoints
// ============================================================================

#[derive(Deserialize)]
struct ExecutionQuery {
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    status: Option<ExecutionStatus>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = ExecutionFilter {
        tenant_id: None,
        workflow_id: query.workflow_id,
        status: query.status,
        limit: Some(query.limit.unwrap_or(100).min(1000)),
    };
    let executions = state
        .admin
        .list_executions(&caller.tenant_id, filter)
        .await?;
    Ok(Json(json!({ "executions": executions })))
}

async fn get_execution(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.admin.get_execution(&caller.tenant_id, &id).await?))
}

async fn get_execution_logs(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let logs = state.admin.execution_logs(&caller.tenant_id, &id).await?;
    Ok(Json(json!({ "execution_id": id, "logs": logs })))
}

async fn cancel_execution(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.admin.cancel_execution(&caller.tenant_id, &id).await?))
}

async fn retry_execution(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let execution = state.admin.retry_execution(&caller.tenant_id, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

// ============================================================================
// Approvals and actions
// ============================================================================

#[derive(Deserialize)]
struct ApprovalQuery {
    #[serde(default)]
    status: Option<ApprovalStatus>,
}

async fn list_approvals(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ApprovalQuery>,
) -> ApiResult<impl IntoResponse> {
    let approvals = state
        .admin
        .list_approvals(&caller.tenant_id, query.status)
        .await?;
    Ok(Json(json!({ "approvals": approvals })))
}

#[derive(Deserialize)]
struct ApprovalRequestBody {
    decision: ApprovalDecision,
    #[serde(default)]
    comment: Option<String>,
}

async fn submit_approval(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<ApprovalRequestBody>,
) -> ApiResult<impl IntoResponse> {
    let approval = state
        .admin
        .submit_approval(&caller, &id, request.decision, request.comment)
        .await?;
    Ok(Json(approval))
}

async fn list_actions(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "actions": state.admin.list_actions() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersionSettings;
    use crate::engine::testing::{engine_with, wait_terminal};
    use crate::triggers::TriggerHub;
    use axum::body::Body;
    use axum::http::Request;
    use ring::hmac;
    use tower::ServiceExt;

    const ONBOARDING: &str = r#"
id: wf-onboard
name: onboarding
trigger:
  type: manual
  parameters:
    - name: name
      type: string
      required: true
nodes:
  - id: greet
    type: data_mutation
    config:
      set:
        greeting: "Welcome {{name}}"
"#;

    const PAYMENTS: &str = r#"
id: wf-payments
name: payments-hook
trigger:
  type: webhook
  path: payments
  secret: s3cret
nodes:
  - id: record
    type: data_mutation
    config:
      set:
        amount: "{{payload.amount}}"
"#;

    fn app() -> (Router, Arc<AdminService>) {
        let (engine, _store) = engine_with(vec![]);
        let hub = Arc::new(TriggerHub::new(engine));
        let admin = Arc::new(AdminService::new(hub, VersionSettings::default()));
        let router = create_router(AppState {
            admin: admin.clone(),
        });
        (router, admin)
    }

    fn request(method: &str, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(TENANT_HEADER, "acme")
            .header(USER_HEADER, "ana")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_active(router: &Router, definition: &str, id: &str) {
        let response = router
            .clone()
            .oneshot(request("POST", "/api/workflows", definition.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let response = router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/workflows/{}/status", id),
                r#"{"status":"active"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (router, _admin) = app();
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_tenant_is_forbidden() {
        let (router, _admin) = app();
        let response = router
            .oneshot(Request::get("/api/workflows").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["code"], "PERMISSION_ERROR");
    }

    #[tokio::test]
    async fn test_create_trigger_and_inspect() {
        let (router, _admin) = app();
        create_active(&router, ONBOARDING, "wf-onboard").await;

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/api/workflows/wf-onboard/trigger",
                r#"{"parameters": {"name": "Bo"}, "wait": true, "timeout_seconds": 5}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let execution = body_json(response).await;
        assert_eq!(execution["status"], "completed");
        assert_eq!(execution["variables"]["greeting"], "Welcome Bo");

        let id = execution["id"].as_str().unwrap();
        let response = router
            .clone()
            .oneshot(request("GET", &format!("/api/executions/{}/logs", id), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!body_json(response).await["logs"].as_array().unwrap().is_empty());

        let response = router
            .clone()
            .oneshot(request("GET", "/api/executions?status=completed", Body::empty()))
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["executions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_missing_parameter_is_bad_request() {
        let (router, _admin) = app();
        create_active(&router, ONBOARDING, "wf-onboard").await;

        let response = router
            .oneshot(request(
                "POST",
                "/api/workflows/wf-onboard/trigger",
                r#"{"parameters": {}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_foreign_tenant_gets_forbidden() {
        let (router, _admin) = app();
        create_active(&router, ONBOARDING, "wf-onboard").await;

        let response = router
            .oneshot(
                Request::get("/api/workflows/wf-onboard")
                    .header(TENANT_HEADER, "globex")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let (router, _admin) = app();
        let response = router
            .oneshot(request("GET", "/api/workflows/missing", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_signature_enforced() {
        let (router, admin) = app();
        create_active(&router, PAYMENTS, "wf-payments").await;

        let body = br#"{"amount": 42}"#;
        let response = router
            .clone()
            .oneshot(
                Request::post("/webhooks/payments")
                    .header(SIGNATURE_HEADER, "00ff")
                    .body(Body::from(body.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let key = hmac::Key::new(hmac::HMAC_SHA256, b"s3cret");
        let signature = hex::encode(hmac::sign(&key, body).as_ref());
        let response = router
            .clone()
            .oneshot(
                Request::post("/webhooks/payments")
                    .header(SIGNATURE_HEADER, format!("sha256={}", signature))
                    .body(Body::from(body.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = body_json(response).await;
        let id = accepted["execution_id"].as_str().unwrap();
        let execution = wait_terminal(admin.engine(), id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.variables["amount"], 42);

        let response = router
            .oneshot(Request::post("/webhooks/unknown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_actions_and_versions() {
        let (router, _admin) = app();
        let response = router
            .clone()
            .oneshot(request("GET", "/api/actions", Body::empty()))
            .await
            .unwrap();
        let actions = body_json(response).await;
        assert!(actions["actions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a["action_type"] == "webhook"));

        create_active(&router, ONBOARDING, "wf-onboard").await;
        let response = router
            .clone()
            .oneshot(request("GET", "/api/workflows/wf-onboard/versions", Body::empty()))
            .await
            .unwrap();
        let versions = body_json(response).await;
        assert_eq!(versions["versions"].as_array().unwrap().len(), 1);

        let response = router
            .oneshot(request(
                "GET",
                "/api/workflows/wf-onboard/versions/compare?from=1&to=1",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["nodes_changed"], json!([]));
    }
}
