//! REST endpoints for ingesting mail and resolving draft checkpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use super::model::Decision;
use crate::error::{Error, WorkflowError};
use crate::pipeline::engine::WorkflowEngine;
use crate::pipeline::types::{Message, TriageLabel};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

/// Build the Axum router for the approval surface.
pub fn approval_routes(engine: Arc<WorkflowEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/checkpoints", get(list_checkpoints))
        .route("/api/checkpoints/{message_id}/resolve", post(resolve_checkpoint))
        .route("/api/messages", post(ingest_message))
        .route("/api/messages/{message_id}/triage", post(override_triage))
        .route("/api/senders/{address}/bias", get(sender_bias))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map engine errors onto HTTP status codes.
fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::Workflow(WorkflowError::CheckpointConflict { .. }) => StatusCode::CONFLICT,
        Error::Workflow(WorkflowError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Error::Workflow(WorkflowError::MessageNotFound(_))
        | Error::Workflow(WorkflowError::CheckpointNotFound(_)) => StatusCode::NOT_FOUND,
        Error::Workflow(WorkflowError::InvalidDecision(_)) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-assist"
    }))
}

// ── Checkpoints ─────────────────────────────────────────────────────

async fn list_checkpoints(State(state): State<AppState>) -> Response {
    match state.engine.pending().await {
        Ok(checkpoints) => Json(checkpoints).into_response(),
        Err(e) => error_response(e),
    }
}

async fn resolve_checkpoint(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(decision): Json<Decision>,
) -> Response {
    match state.engine.resolve(&message_id, decision).await {
        Ok(resolution) => (StatusCode::OK, Json(resolution)).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    id: Option<String>,
    sender: String,
    #[serde(default)]
    subject: String,
    body: String,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

async fn ingest_message(State(state): State<AppState>, Json(body): Json<IngestRequest>) -> Response {
    let id = body.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let message = Message::new(
        id,
        &body.sender,
        body.subject,
        body.body,
        body.received_at.unwrap_or_else(Utc::now),
    );

    match state.engine.ingest(message).await {
        Ok(progress) => {
            let status = if progress.duplicate {
                StatusCode::OK
            } else {
                info!(message_id = %progress.message_id, state = %progress.state, "Message ingested via API");
                StatusCode::CREATED
            };
            (status, Json(progress)).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct TriageRequest {
    label: TriageLabel,
}

async fn override_triage(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(body): Json<TriageRequest>,
) -> Response {
    match state.engine.override_triage(&message_id, body.label).await {
        Ok(progress) => Json(progress).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Learning ────────────────────────────────────────────────────────

async fn sender_bias(State(state): State<AppState>, Path(address): Path<String>) -> Response {
    match state.engine.bias(&address).await {
        Ok(bias) => Json(bias).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.engine.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}
