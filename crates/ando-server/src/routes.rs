use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use ando_core::{
    ingress::{self, WebhookEvent},
    types::{NewBuild, SystemSettings, Trigger},
    vault,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::AppState;

// ── Error helper ────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn bad_request(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
}

// ── Request/response bodies ─────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct CreateProjectBody {
    pub external_repo_id: String,
    pub owner: String,
    pub name: String,
    pub default_branch: Option<String>,
    pub branch_filter: Option<String>,
    pub enable_pr_builds: Option<bool>,
    pub timeout_minutes: Option<i64>,
    pub container_image: Option<String>,
    pub profile: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct TriggerBody {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct SecretBody {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize)]
pub(crate) struct LogsQuery {
    pub since: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub(crate) struct BuildsQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub(crate) struct TokenCreatedJson {
    pub token: String,
    pub prefix: String,
}

// ── Health ───────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Webhook ingress (C5) ─────────────────────────────────────────────────

pub(crate) async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let event_type = header_str(&headers, "x-github-event").unwrap_or_default();
    let delivery_id = header_str(&headers, "x-github-delivery").unwrap_or_default();
    let signature = header_str(&headers, "x-hub-signature-256").unwrap_or_default();

    let event = ingress::parse_event(event_type, &body).map_err(bad_request)?;

    if matches!(event, WebhookEvent::Ping) {
        return Ok(Json(json!({ "message": "pong" })));
    }

    let external_repo_id = match &event {
        WebhookEvent::Push(p) => p.external_repo_id.clone(),
        WebhookEvent::PullRequest(p) => p.external_repo_id.clone(),
        WebhookEvent::Ignored(kind) => {
            return Ok(Json(json!({ "ignored": kind })));
        }
        WebhookEvent::Ping => unreachable!(),
    };

    let project = state
        .db
        .get_project_by_external_repo_id(&external_repo_id)
        .map_err(|e| (internal(e), Json(json!({ "error": "lookup failed" }))))?
        .ok_or_else(|| {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown repository" })))
        })?;

    let secret = if project.webhook_secret.is_empty() {
        state.config.webhook_secret.as_str()
    } else {
        project.webhook_secret.as_str()
    };
    if secret.is_empty() || !ingress::verify_signature(secret, &body, signature) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad signature" }))));
    }

    if !delivery_id.is_empty() {
        let first_seen = state
            .db
            .record_delivery_once(delivery_id, None)
            .map_err(|e| (internal(e), Json(json!({ "error": "dedupe failed" }))))?;
        if !first_seen {
            return Ok(Json(json!({ "duplicate": true })));
        }
    }

    let new_build = match &event {
        WebhookEvent::Push(p) => {
            if !ingress::should_build(&project, Trigger::Push, &p.branch) {
                return Ok(Json(json!({ "ignored": "branch filtered" })));
            }
            NewBuild {
                project_id: project.id,
                commit_sha: p.commit_sha.clone(),
                branch: p.branch.clone(),
                commit_message: p.commit_message.clone(),
                commit_author: p.commit_author.clone(),
                pull_request_number: None,
                trigger: Trigger::Push,
            }
        }
        WebhookEvent::PullRequest(p) => {
            if !ingress::pull_request_action_triggers_build(&p.action) {
                return Ok(Json(json!({ "ignored": "pr action" })));
            }
            if !ingress::should_build(&project, Trigger::PullRequest, &p.branch) {
                return Ok(Json(json!({ "ignored": "pr builds disabled" })));
            }
            let message = format!(
                "PR #{}: {}",
                p.number,
                p.commit_message.clone().unwrap_or_default()
            );
            NewBuild {
                project_id: project.id,
                commit_sha: p.commit_sha.clone(),
                branch: p.branch.clone(),
                commit_message: Some(message),
                commit_author: p.commit_author.clone(),
                pull_request_number: Some(p.number),
                trigger: Trigger::PullRequest,
            }
        }
        _ => unreachable!(),
    };

    let (build_id, _job_id) = state
        .db
        .enqueue_build(&new_build)
        .map_err(|e| (internal(e), Json(json!({ "error": "enqueue failed" }))))?;

    Ok(Json(json!({ "buildId": build_id })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ── Projects ─────────────────────────────────────────────────────────────

pub(crate) async fn list_projects(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let projects = state.db.list_projects().map_err(internal)?;
    Ok(Json(json!(projects)))
}

pub(crate) async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    match state.db.get_project(id).map_err(internal)? {
        Some(p) => Ok(Json(json!(p))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub(crate) async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let project = ando_core::types::Project {
        id: 0,
        external_repo_id: body.external_repo_id,
        owner: body.owner,
        name: body.name,
        default_branch: body.default_branch.unwrap_or_else(|| "main".to_string()),
        installation_id: String::new(),
        webhook_secret: body.webhook_secret.unwrap_or_default(),
        branch_filter: body.branch_filter.unwrap_or_default(),
        enable_pr_builds: body.enable_pr_builds.unwrap_or(false),
        timeout_minutes: body
            .timeout_minutes
            .unwrap_or(state.config.default_timeout_minutes),
        container_image: body.container_image,
        profile: body.profile,
        required_secrets: Vec::new(),
        notify_on_failure: false,
        last_build_at: None,
        created_at: chrono::Utc::now(),
    };
    let id = state.db.insert_project(&project).map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub(crate) async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    state.db.delete_project(id).map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn manual_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TriggerBody>,
) -> Result<Json<Value>, StatusCode> {
    let project = state
        .db
        .get_project(id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let stored = state.db.list_secret_names(project.id).map_err(internal)?;
    let missing: Vec<&String> = project
        .required_secrets
        .iter()
        .filter(|name| !stored.contains(name))
        .collect();
    if !missing.is_empty() {
        return Ok(Json(json!({ "missingSecrets": missing })));
    }

    let new_build = NewBuild {
        project_id: project.id,
        commit_sha: body.commit_sha.unwrap_or_else(|| "HEAD".to_string()),
        branch: body.branch.unwrap_or(project.default_branch.clone()),
        commit_message: Some("manual trigger".to_string()),
        commit_author: None,
        pull_request_number: None,
        trigger: Trigger::Manual,
    };
    let (build_id, _) = state.db.enqueue_build(&new_build).map_err(internal)?;
    Ok(Json(json!({ "buildId": build_id })))
}

// ── Secrets ──────────────────────────────────────────────────────────────

pub(crate) async fn list_secrets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let names = state.db.list_secret_names(id).map_err(internal)?;
    Ok(Json(json!({ "names": names })))
}

pub(crate) async fn put_secret(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<SecretBody>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    if !ando_core::types::is_valid_secret_name(&body.name) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "secret name must match ^[A-Z_][A-Z0-9_]*$" })),
        ));
    }
    let encrypted = state
        .vault
        .encrypt(&body.value)
        .map_err(|e| (internal(e), Json(json!({ "error": "encryption failed" }))))?;
    state
        .db
        .upsert_secret(id, &body.name, &encrypted)
        .map_err(|e| (internal(e), Json(json!({ "error": "store failed" }))))?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(i64, String)>,
) -> Result<StatusCode, StatusCode> {
    state.db.delete_secret(id, &name).map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Builds ───────────────────────────────────────────────────────────────

pub(crate) async fn list_builds(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    Query(q): Query<BuildsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let builds = state
        .db
        .list_builds_for_project(project_id, q.limit.unwrap_or(50))
        .map_err(internal)?;
    Ok(Json(json!(builds)))
}

pub(crate) async fn get_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    match state.db.get_build(id).map_err(internal)? {
        Some(b) => Ok(Json(json!(b))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub(crate) async fn cancel_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    state.orchestrator.request_cancel(id).await.map_err(internal)?;
    Ok(StatusCode::OK)
}

pub(crate) async fn retry_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let new_id = state
        .orchestrator
        .retry(id)
        .map_err(|e| (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))))?;
    Ok(Json(json!({ "buildId": new_id })))
}

pub(crate) async fn get_build_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let entries = state
        .log_transport
        .get_since(id, q.since.unwrap_or(0))
        .await
        .map_err(internal)?;
    let entries = match q.limit {
        Some(limit) => entries.into_iter().take(limit as usize).collect(),
        None => entries,
    };
    Ok(Json(json!({ "entries": entries })))
}

// ── Build log SSE stream (C3 live fan-out) ──────────────────────────────

pub(crate) async fn sse_build_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>>, StatusCode> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    // Subscribe before snapshotting history to avoid missing a record
    // written between the two calls (I4).
    let live_rx = state.log_transport.subscribe(id).await.map_err(internal)?;
    let history = state.log_transport.get_since(id, 0).await.map_err(internal)?;

    tokio::spawn(async move {
        for entry in history {
            let data = serde_json::to_string(&entry).unwrap_or_default();
            if tx.send(data).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(entry) => {
                    let data = serde_json::to_string(&entry).unwrap_or_default();
                    if tx.send(data).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        let _ = tx.send(r#"{"type":"stream_end"}"#.to_string());
    });

    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}

// ── Artifacts ────────────────────────────────────────────────────────────

pub(crate) async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let artifacts = state.db.list_artifacts_for_build(id).map_err(internal)?;
    Ok(Json(json!(artifacts)))
}

// ── API tokens ───────────────────────────────────────────────────────────

pub(crate) async fn create_token(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TokenCreatedJson>, StatusCode> {
    let generated = vault::generate_token(&state.config.api_token_secret);
    state
        .db
        .insert_token(&generated.prefix, &generated.token_hash, "api")
        .map_err(internal)?;
    Ok(Json(TokenCreatedJson {
        token: generated.token,
        prefix: generated.prefix,
    }))
}

// ── Settings ─────────────────────────────────────────────────────────────

pub(crate) async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let settings = state.db.get_settings().map_err(internal)?;
    Ok(Json(json!(settings)))
}

pub(crate) async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<SystemSettings>,
) -> Result<StatusCode, StatusCode> {
    state.db.update_settings(&settings).map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Ambient process log SSE ─────────────────────────────────────────────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
