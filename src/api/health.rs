//! Health check endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::session::SessionState;
use crate::voice::WakeWordSupervisor;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub session: SessionState,
    pub mic_locked: bool,
    /// `None` when wake word detection is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_word_armed: Option<bool>,
}

/// Liveness probe with a summary of the engine
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        session: state.session.state(),
        mic_locked: state.mic_lock.is_held(),
        wake_word_armed: state
            .wake_word
            .as_ref()
            .map(WakeWordSupervisor::is_armed),
    })
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}
