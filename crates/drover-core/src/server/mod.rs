//! The worker-facing orchestrator HTTP router.
//!
//! POST routes implement the claim/heartbeat/status/complete/fail
//! protocol and require the shared `X-Agent-Key`. The activity projection
//! is readable without a key for UI consumption. The `drover serve`
//! command wraps this router with a listener and the reclaim sweep task.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use drover_db::models::EventCategory;
use drover_db::queries::events as event_db;
use drover_db::queries::tickets as ticket_db;

use crate::activity;
use crate::claim::{self, ClaimError, CompletionOutcome};
use crate::worker::api::{
    AGENT_KEY_HEADER, ActivityRequest, ClaimRequest, ClaimResponse, CompleteRequest, FailRequest,
    HeartbeatRequest, StatusRequest,
};

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub agent_key: String,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn stale_claim() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: "stale claim".to_owned(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<ClaimError> for AppError {
    fn from(err: ClaimError) -> Self {
        match err {
            ClaimError::StaleClaim => Self::stale_claim(),
            ClaimError::StaleState => Self {
                status: StatusCode::CONFLICT,
                message: "stale state".to_owned(),
            },
            // Store internals never reach the worker verbatim.
            ClaimError::Store(e) => {
                tracing::error!(error = %e, "store error");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "store error".to_owned(),
                }
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "store error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "store error".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

async fn require_agent_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(AGENT_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.agent_key.as_str()) {
        let body = serde_json::json!({"error": "missing or invalid X-Agent-Key"});
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }
    next.run(request).await
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/claim", post(handle_claim))
        .route("/heartbeat", post(handle_heartbeat))
        .route("/status", post(handle_status))
        .route("/complete", post(handle_complete))
        .route("/fail", post(handle_fail))
        .route("/tickets/{id}/activity", post(handle_post_activity))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_agent_key,
        ));

    let public = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/tickets/{id}/activity", get(handle_get_activity));

    protected
        .merge(public)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_healthz() -> &'static str {
    "ok"
}

async fn handle_claim(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Response, AppError> {
    if request.agent_id.is_empty() {
        return Err(AppError::bad_request("agent_id must not be empty"));
    }
    let Some(project) = request.project_id.as_deref() else {
        return Err(AppError::bad_request("project_id is required"));
    };

    let grant = claim::claim(
        &state.pool,
        &request.agent_id,
        project,
        request.ticket_filter.as_deref(),
    )
    .await?;

    match grant {
        Some(grant) => Ok(Json(ClaimResponse {
            ticket: grant.ticket,
            project_settings: grant.settings,
        })
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn handle_heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Response, AppError> {
    claim::heartbeat(
        &state.pool,
        &request.ticket_id,
        &request.agent_id,
        &request.claim_token,
    )
    .await?;
    Ok(Json(serde_json::json!({"ok": true})).into_response())
}

async fn handle_status(
    State(state): State<AppState>,
    Json(request): Json<StatusRequest>,
) -> Result<Response, AppError> {
    if !request.state.is_claimed() {
        return Err(AppError::bad_request(
            "status endpoint only advances within assigned/in_progress/verifying",
        ));
    }
    claim::advance(
        &state.pool,
        &request.ticket_id,
        &request.agent_id,
        &request.claim_token,
        request.state,
    )
    .await?;
    Ok(Json(serde_json::json!({"ok": true})).into_response())
}

async fn handle_complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Response, AppError> {
    let outcome = if request.success {
        let pr_url = request
            .pr_url
            .ok_or_else(|| AppError::bad_request("success completion requires pr_url"))?;
        let branch_name = request
            .branch_name
            .ok_or_else(|| AppError::bad_request("success completion requires branch_name"))?;
        let commit_sha = request
            .commit_sha
            .ok_or_else(|| AppError::bad_request("success completion requires commit_sha"))?;
        let criteria_status = serde_json::to_value(request.criteria_status.unwrap_or_default())
            .map_err(|e| AppError::bad_request(format!("invalid criteria_status: {e}")))?;
        CompletionOutcome::Success {
            pr_url,
            branch_name,
            commit_sha,
            criteria_status,
            files_changed: request.files_changed.unwrap_or_default(),
        }
    } else {
        let error = request
            .error
            .ok_or_else(|| AppError::bad_request("failed completion requires error"))?;
        CompletionOutcome::Failure {
            error_class: error.class,
            message: error.message,
            should_retry: true,
        }
    };

    let landed = claim::complete(
        &state.pool,
        &request.ticket_id,
        &request.agent_id,
        &request.claim_token,
        outcome,
    )
    .await?;
    Ok(Json(serde_json::json!({"status": landed.to_string()})).into_response())
}

async fn handle_fail(
    State(state): State<AppState>,
    Json(request): Json<FailRequest>,
) -> Result<Response, AppError> {
    let landed = claim::complete(
        &state.pool,
        &request.ticket_id,
        &request.agent_id,
        &request.claim_token,
        CompletionOutcome::Failure {
            error_class: request.error_class,
            message: request.error_message,
            should_retry: request.should_retry,
        },
    )
    .await?;
    Ok(Json(serde_json::json!({"status": landed.to_string()})).into_response())
}

async fn handle_post_activity(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(request): Json<ActivityRequest>,
) -> Result<Response, AppError> {
    let category: EventCategory = request
        .category
        .parse()
        .map_err(|_| AppError::bad_request(format!("unknown category {:?}", request.category)))?;

    if ticket_db::get_ticket(&state.pool, &ticket_id).await?.is_none() {
        return Err(AppError::not_found(format!("ticket {ticket_id} not found")));
    }

    let event = event_db::append_event(
        &state.pool,
        &ticket_id,
        category,
        &request.agent_id,
        &request.message,
        request.metadata,
    )
    .await?;
    Ok(Json(serde_json::json!({"event_id": event.id})).into_response())
}

async fn handle_get_activity(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> Result<Response, AppError> {
    if ticket_db::get_ticket(&state.pool, &ticket_id).await?.is_none() {
        return Err(AppError::not_found(format!("ticket {ticket_id} not found")));
    }
    let entries = activity::project_activity(&state.pool, &ticket_id).await?;
    Ok(Json(entries).into_response())
}
