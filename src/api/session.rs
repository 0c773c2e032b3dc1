//! Session control endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, ApiState};
use crate::session::{SessionSnapshot, StartOutcome, TranscriptBuffers};

/// Build session router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(snapshot))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/transcript", get(transcript))
        .with_state(state)
}

/// Start request; the body may be empty
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    /// Appended to the base instruction for this session only
    pub context: Option<String>,
}

/// Start response
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

async fn snapshot(State(state): State<Arc<ApiState>>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot())
}

async fn start(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<Json<StartResponse>, ApiError> {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid start request: {e}")))?
    };

    let response = match state.session.start(request.context).await? {
        StartOutcome::Started(id) => StartResponse {
            status: "started",
            session_id: Some(id),
        },
        StartOutcome::AlreadyActive => StartResponse {
            status: "already_active",
            session_id: state.session.snapshot().session.map(|s| s.id),
        },
    };
    Ok(Json(response))
}

async fn stop(State(state): State<Arc<ApiState>>) -> Result<Json<SessionSnapshot>, ApiError> {
    state.session.stop().await?;
    Ok(Json(state.session.snapshot()))
}

async fn transcript(State(state): State<Arc<ApiState>>) -> Json<TranscriptBuffers> {
    Json(state.session.snapshot().transcript)
}
