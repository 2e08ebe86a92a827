/*
 * DevSwarm - Virtual office for AI agents
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! HTTP surface: REST handlers, bearer auth, CORS, and the reverse proxy to
//! the orchestration collaborator.
//!
//! Every mutating handler follows the same shape: parse, validate, write via
//! the store, bump the broadcast version, publish the entity delta, append
//! an activity entry, respond. Publish failures after a successful bump are
//! logged and never fail the request; the heartbeat recovers convergence.

use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{OriginalUri, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::error::BackendError;
use crate::hub::HubHandle;
use crate::models::{
    AgentUpdateRequest, CreateMessageRequest, CreateTaskRequest, DeltaCategory,
    StateOverrideRequest, TaskStatus, TaskStatusRequest,
};
use crate::store;

const MAX_BODY_BYTES: usize = 10_485_760; // 10 MiB

pub struct AppState {
    pub pool: PgPool,
    pub bus: Arc<EventBus>,
    pub hub: HubHandle,
    pub http_client: reqwest::Client,
    pub config: Arc<devswarm_config::Config>,
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(
        &state.config.backend.cors_origins,
        &state.config.devswarm.env,
    );

    let protected = Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent).patch(update_agent))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id/status", patch(update_task_status))
        .route("/messages", get(list_messages).post(create_message))
        .route("/state", get(get_state))
        .route("/state/override", post(override_state))
        .route("/costs", get(get_costs))
        .route("/activity", get(get_activity))
        // Orchestration functionality lives in the external engine.
        .route("/trigger", post(proxy_orchestration))
        .route("/simulate/*path", post(proxy_orchestration))
        .route("/mcp/tools", get(proxy_orchestration))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.backend.request_timeout_secs,
        )));

    // Health stays outside the auth layer.
    let api = Router::new().route("/health", get(health)).merge(protected);

    Router::new()
        // WebSocket and the public health alias sit outside /api and its
        // request timeout; the upgraded connection is long-lived.
        .route("/ws", get(crate::hub::ws_handler))
        .route("/health", get(health))
        .nest("/api", api)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(origins: &[String], env: &str) -> CorsLayer {
    let allowed_methods = [
        Method::GET,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let allowed_headers = [header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE];

    let parsed: Vec<HeaderValue> = if origins.is_empty() {
        if env != "dev" && env != "local" {
            error!("backend.cors_origins is empty in non-dev environment — refusing to start");
            process::exit(1);
        }
        warn!("backend.cors_origins is empty — defaulting to http://localhost:3000 for dev");
        vec![HeaderValue::from_static("http://localhost:3000")]
    } else {
        origins.iter().filter_map(|o| o.parse().ok()).collect()
    };

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(allowed_methods)
        .allow_headers(allowed_headers)
        .allow_credentials(true)
        .max_age(Duration::from_secs(300))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Constant-time byte comparison to prevent timing side-channels on token
/// comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Bearer check. An unset or empty configured token disables auth.
fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), BackendError> {
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        return Ok(());
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(t) if constant_time_eq(t.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(BackendError::Unauthorized(
            "valid bearer token required".to_string(),
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, BackendError> {
    check_bearer(req.headers(), state.config.backend.bearer_token.as_deref())?;
    Ok(next.run(req).await)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a JSON body into the typed request. Type and enum mismatches map to
/// HTTP 400 rather than axum's default 422.
fn parse_body<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, BackendError> {
    serde_json::from_value(value)
        .map_err(|e| BackendError::BadRequest(format!("invalid request body: {e}")))
}

/// Parse a `limit` query value, clamped to `[1, max]`; absent or unparseable
/// values fall back to the default.
fn clamp_limit(raw: Option<&String>, default: i64, max: i64) -> i64 {
    match raw.and_then(|v| v.parse::<i64>().ok()) {
        Some(n) => n.clamp(1, max),
        None => default,
    }
}

async fn record_activity(
    state: &AppState,
    agent_id: &str,
    action: &str,
    details: serde_json::Value,
) {
    if let Err(e) = store::log_activity(&state.pool, agent_id, action, details).await {
        warn!(action = action, error = %e, "activity log write failed");
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let database = match tokio::time::timeout(Duration::from_secs(2), store::ping(&state.pool))
        .await
    {
        Ok(Ok(())) => "ok".to_string(),
        Ok(Err(e)) => format!("error: {e}"),
        Err(_) => "error: ping timed out".to_string(),
    };

    let status = if database == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": "ok",
        "service": crate::SERVICE_NAME,
        "database": database,
    });
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, BackendError> {
    let agents = store::get_all_agents(&state.pool).await?;
    Ok(Json(agents))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BackendError> {
    let agent = store::get_agent(&state.pool, &id)
        .await?
        .ok_or_else(|| BackendError::NotFound(format!("agent {id}")))?;
    Ok(Json(agent))
}

async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, BackendError> {
    let req: AgentUpdateRequest = parse_body(body)?;

    let mut agent = store::get_agent(&state.pool, &id)
        .await?
        .ok_or_else(|| BackendError::NotFound(format!("agent {id}")))?;

    if let Some(room) = req.current_room {
        agent.current_room = room;
    }
    if let Some(status) = req.status {
        agent.status = status;
    }
    if let Some(current_task) = req.current_task {
        agent.current_task = current_task;
    }
    if let Some(thought_chain) = req.thought_chain {
        agent.thought_chain = thought_chain;
    }

    store::update_agent(&state.pool, &agent).await?;
    store::bump_version(&state.pool).await?;

    // Re-read for the refreshed updated_at before broadcasting.
    let agent = store::get_agent(&state.pool, &id)
        .await?
        .ok_or_else(|| BackendError::NotFound(format!("agent {id}")))?;
    state
        .bus
        .publish_delta(DeltaCategory::Agents, &id, &agent)
        .await;

    record_activity(
        &state,
        &id,
        "agent_updated",
        serde_json::json!({
            "room": agent.current_room,
            "status": agent.status,
            "task": agent.current_task,
        }),
    )
    .await;

    Ok(Json(agent))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, BackendError> {
    let tasks = match params.get("agent_id").filter(|v| !v.is_empty()) {
        Some(agent_id) => store::get_tasks_by_agent(&state.pool, agent_id).await?,
        None => store::get_all_tasks(&state.pool).await?,
    };
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, BackendError> {
    let req: CreateTaskRequest = parse_body(body)?;

    if req.title.trim().is_empty() {
        return Err(BackendError::BadRequest("title is required".to_string()));
    }
    let status = req.status.unwrap_or(TaskStatus::Backlog);

    let id = store::create_task(&state.pool, &req, status).await?;
    store::bump_version(&state.pool).await?;

    if let Some(task) = store::get_task(&state.pool, &id).await? {
        state
            .bus
            .publish_delta(DeltaCategory::Tasks, &id, &task)
            .await;
    }

    record_activity(
        &state,
        &req.created_by,
        "task_created",
        serde_json::json!({ "task_id": id, "title": req.title }),
    )
    .await;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn update_task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, BackendError> {
    let req: TaskStatusRequest = parse_body(body)?;

    if !store::update_task_status(&state.pool, &id, req.status).await? {
        return Err(BackendError::NotFound(format!("task {id}")));
    }
    store::bump_version(&state.pool).await?;

    if let Some(task) = store::get_task(&state.pool, &id).await? {
        state
            .bus
            .publish_delta(DeltaCategory::Tasks, &id, &task)
            .await;
    }

    Ok(Json(serde_json::json!({ "status": "updated" })))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, BackendError> {
    let limit = clamp_limit(params.get("limit"), 50, 200);
    let agent_id = params.get("agent_id").filter(|v| !v.is_empty());

    let messages =
        store::get_recent_messages(&state.pool, limit, agent_id.map(String::as_str)).await?;
    Ok(Json(messages))
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, BackendError> {
    let req: CreateMessageRequest = parse_body(body)?;

    if req.content.trim().is_empty() {
        return Err(BackendError::BadRequest("content is required".to_string()));
    }

    let id = store::create_message(&state.pool, &req).await?;
    store::bump_version(&state.pool).await?;

    if let Some(message) = store::get_message(&state.pool, &id).await? {
        state
            .bus
            .publish_delta(DeltaCategory::Messages, &id, &message)
            .await;
    }

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

async fn get_state(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, BackendError> {
    let (data, _version) =
        store::get_full_state(&state.pool, state.config.snapshot.messages_limit).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], data))
}

async fn override_state(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, BackendError> {
    let req: StateOverrideRequest = parse_body(body)?;

    if let (Some(status), Some(room)) = (req.global_status, req.default_room) {
        store::bulk_update_agent_status(&state.pool, status, room).await?;
        store::bump_version(&state.pool).await?;
        // A bulk change touches every agent; subscribers re-read the whole
        // snapshot instead of receiving per-entity deltas.
        state.bus.notify_state_changed().await;
    }

    record_activity(
        &state,
        "system",
        "state_override",
        serde_json::json!({
            "status": req.global_status,
            "room": req.default_room,
            "message": req.message,
        }),
    )
    .await;

    Ok(Json(serde_json::json!({ "status": "overridden" })))
}

// ---------------------------------------------------------------------------
// Costs & activity
// ---------------------------------------------------------------------------

async fn get_costs(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, BackendError> {
    let costs = store::get_agent_costs(&state.pool).await?;
    Ok(Json(costs))
}

async fn get_activity(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, BackendError> {
    let limit = clamp_limit(params.get("limit"), 100, 500);
    let entries = store::get_activity_log(&state.pool, limit).await?;
    Ok(Json(entries))
}

// ---------------------------------------------------------------------------
// Reverse proxy to the orchestration collaborator
// ---------------------------------------------------------------------------

const UPSTREAM_CORS_HEADERS: [&str; 5] = [
    "access-control-allow-origin",
    "access-control-allow-credentials",
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-expose-headers",
];

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The gateway owns browser-facing CORS headers. Upstream values would merge
/// into invalid combinations like "http://localhost:3000, *".
fn strip_upstream_cors(headers: &mut HeaderMap) {
    for name in UPSTREAM_CORS_HEADERS {
        headers.remove(name);
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

async fn proxy_orchestration(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    req: Request,
) -> Result<Response, BackendError> {
    let path_and_query = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());
    let base = state.config.orchestration.base_url.trim_end_matches('/');
    let url = format!("{base}{path_and_query}");

    let method = req.method().clone();
    let mut headers = req.headers().clone();
    strip_hop_headers(&mut headers);
    headers.remove(header::HOST);

    let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| BackendError::BadRequest(format!("read body: {e}")))?;

    info!(path = %path_and_query, "forwarding to orchestration");

    let upstream = state
        .http_client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| BackendError::Upstream(e.to_string()))?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_upstream_cors(&mut response_headers);
    strip_hop_headers(&mut response_headers);
    response_headers.remove(header::CONTENT_LENGTH);

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| BackendError::Upstream(e.to_string()))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

// ===========================================================================
// Tests
// ===========================================================================
