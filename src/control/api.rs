//! REST surface of the control plane.
//!
//! JSON in, JSON out. Handlers are thin: deserialization, status-code
//! mapping, and delegation to the state/broker/sync layers. The
//! approve/deny logic itself lives in [`super::state`] because the
//! WebSocket command path shares it.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::state::{AppState, ApproveError};
use super::ws::ws_handler;
use crate::queue::{Category, RequestStatus, ResolvedBy, DEFAULT_RECENT_LIMIT};

/// Build the control-plane router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/queue", get(queue_index).post(queue_submit))
        .route("/api/queue/bulk", post(queue_bulk))
        .route("/api/queue/{id}/approve", post(queue_approve))
        .route("/api/queue/{id}/deny", post(queue_deny))
        .route("/api/config", get(config_get))
        .route("/api/config/propose", post(config_propose))
        .route(
            "/api/rules",
            get(rules_get).post(rules_add).delete(rules_remove),
        )
        .route("/api/sync/files", get(sync_files_get).post(sync_files_post))
        .route("/api/sync/git", get(sync_git_get).post(sync_git_post))
        .route("/api/exec", post(exec_submit))
        .route("/api/exec/{id}", get(exec_get))
        .route("/api/packages", post(packages_submit))
        .route("/api/packages/{id}", get(packages_get))
        .route("/api/audit", get(audit_get))
        .route("/api/status", get(status_get))
        .route("/ws", axum::routing::any(ws_handler))
        .with_state(state)
}

async fn queue_index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "pending": state.queue.pending(),
        "recent": state.queue.recent(DEFAULT_RECENT_LIMIT),
    }))
}

#[derive(Deserialize)]
struct SubmitBody {
    category: String,
    action: String,
    description: String,
    reason: Option<String>,
    metadata: Option<Map<String, Value>>,
}

async fn queue_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    let Ok(category) = body.category.parse::<Category>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown category: {}", body.category)})),
        );
    };

    let (request, _waiter) = state.queue.request(
        category,
        body.action,
        body.description,
        body.reason,
        body.metadata.unwrap_or_default(),
    );
    debug!("Submitted {} via REST", request.id);
    (StatusCode::CREATED, Json(json!({"id": request.id})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkBody {
    category: String,
    status: String,
    resolved_by: Option<String>,
}

async fn queue_bulk(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkBody>,
) -> impl IntoResponse {
    let Ok(category) = body.category.parse::<Category>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown category: {}", body.category)})),
        );
    };
    let status = match body.status.as_str() {
        "approved" => RequestStatus::Approved,
        "denied" => RequestStatus::Denied,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid status: {}", other)})),
            );
        }
    };
    let resolved_by = parse_resolved_by(body.resolved_by.as_deref());

    let count = state.queue.bulk_resolve(category, status, resolved_by);
    (StatusCode::OK, Json(json!({"count": count})))
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    resolved_by: Option<String>,
    #[serde(default)]
    always_allow: bool,
    #[serde(default)]
    always_deny: bool,
}

async fn queue_approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    let resolved_by = parse_resolved_by(body.resolved_by.as_deref());

    match state.approve(&id, resolved_by, body.always_allow) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(ApproveError::NotPending) => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": format!("no pending request {}", id)})),
        ),
        Err(ApproveError::Conflict(error)) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "error": error})),
        ),
    }
}

async fn queue_deny(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    let resolved_by = parse_resolved_by(body.resolved_by.as_deref());

    let ok = state.deny(&id, resolved_by, body.always_deny);
    (StatusCode::OK, Json(json!({"ok": ok})))
}

async fn config_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.get())
}

#[derive(Deserialize)]
struct ProposeBody {
    path: String,
    value: Value,
    reason: Option<String>,
}

async fn config_propose(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProposeBody>,
) -> impl IntoResponse {
    let mut proposal = Map::new();
    proposal.insert("path".to_string(), Value::from(body.path.clone()));
    proposal.insert("value".to_string(), body.value);
    if let Some(ref reason) = body.reason {
        proposal.insert("reason".to_string(), Value::from(reason.clone()));
    }
    let mut metadata = Map::new();
    metadata.insert("proposal".to_string(), Value::Object(proposal));

    let (request, _waiter) = state.queue.request(
        Category::Sandbox,
        format!("config {}", body.path),
        format!("Agent proposes changing {}", body.path),
        body.reason,
        metadata,
    );
    (StatusCode::CREATED, Json(json!({"id": request.id})))
}

async fn rules_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.rules())
}

#[derive(Deserialize)]
struct RuleBody {
    #[serde(rename = "type")]
    kind: String,
    rule: String,
}

async fn rules_add(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RuleBody>,
) -> impl IntoResponse {
    let Ok(kind) = body.kind.parse() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid rule type: {}", body.kind)})),
        );
    };

    let added = state.config.add_rule(kind, &body.rule);
    if added {
        if let Err(e) = state.config.save() {
            tracing::warn!("Failed to persist config: {}", e);
        }
        state.broadcast_rules();
        state.auto_resolve_matching();
    }
    (
        StatusCode::OK,
        Json(json!({"added": added, "rules": state.config.rules()})),
    )
}

async fn rules_remove(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RuleBody>,
) -> impl IntoResponse {
    let Ok(kind) = body.kind.parse() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("invalid rule type: {}", body.kind)})),
        );
    };

    let removed = state.config.remove_rule(kind, &body.rule);
    if removed {
        if let Err(e) = state.config.save() {
            tracing::warn!("Failed to persist config: {}", e);
        }
        state.broadcast_rules();
    }
    (
        StatusCode::OK,
        Json(json!({"removed": removed, "rules": state.config.rules()})),
    )
}

async fn sync_files_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"files": state.files.list_files()}))
}

#[derive(Deserialize)]
struct SyncFilesBody {
    paths: Option<Vec<String>>,
}

async fn sync_files_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SyncFilesBody>,
) -> impl IntoResponse {
    let paths = body.paths.unwrap_or_else(|| {
        state
            .files
            .list_files()
            .into_iter()
            .map(|f| f.path)
            .collect()
    });
    let results = state.files.request_file_sync(paths).await;
    Json(json!({"results": results}))
}

async fn sync_git_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.git.list_branches().await {
        Ok(branches) => (StatusCode::OK, Json(json!({"branches": branches}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct GitSyncBody {
    branch: String,
}

async fn sync_git_post(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GitSyncBody>,
) -> impl IntoResponse {
    match state.git.request_git_sync(&body.branch).await {
        Ok(approved) => (
            StatusCode::OK,
            Json(json!({"branch": body.branch, "approved": approved})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct ExecBody {
    command: String,
    cwd: Option<String>,
    reason: Option<String>,
    timeout: Option<u64>,
}

async fn exec_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecBody>,
) -> impl IntoResponse {
    let record = state
        .exec
        .submit(body.command, body.cwd, body.reason, body.timeout);
    (StatusCode::CREATED, Json(json!({"id": record.id})))
}

async fn exec_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.exec.get(&id) {
        Some(record) => (StatusCode::OK, Json(json!(record))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no exec request {}", id)})),
        ),
    }
}

#[derive(Deserialize)]
struct PackagesBody {
    manager: String,
    packages: Vec<String>,
    action: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    reason: Option<String>,
    cwd: Option<String>,
    timeout: Option<u64>,
}

async fn packages_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PackagesBody>,
) -> impl IntoResponse {
    let action = body.action.as_deref().unwrap_or("install");
    match state.packages.submit(
        &body.manager,
        body.packages,
        action,
        body.flags,
        body.reason,
        body.cwd,
        body.timeout,
    ) {
        Some(record) => (StatusCode::CREATED, Json(json!({"id": record.id}))),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "unrecognized manager or empty package list"})),
        ),
    }
}

async fn packages_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.packages.get(&id) {
        Some(record) => (StatusCode::OK, Json(json!(record))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no package request {}", id)})),
        ),
    }
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

async fn audit_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    Json(state.audit.read(query.limit.unwrap_or(100)))
}

async fn status_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_ms = state.started_at.elapsed().as_millis() as u64;
    let remaining_ms = state
        .max_uptime_ms
        .map(|max| max.saturating_sub(uptime_ms));
    Json(json!({
        "startedAt": state.started_at_ms,
        "uptime": uptime_ms,
        "maxUptimeMs": state.max_uptime_ms,
        "remainingMs": remaining_ms,
        "pendingCount": state.queue.pending().len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn parse_resolved_by(value: Option<&str>) -> ResolvedBy {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(ResolvedBy::Web)
}
