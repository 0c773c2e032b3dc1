//! Microphone lock endpoints for other consumers in the host application

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState};
use crate::mic_lock::{MicHolder, MicLockState};

/// Build mic lock router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/acquire", post(acquire))
        .route("/release", post(release))
        .with_state(state)
}

/// Names the external consumer taking or returning the microphone
#[derive(Debug, Deserialize)]
pub struct HolderRequest {
    pub holder: String,
}

/// Outcome of an acquire or release
#[derive(Debug, Serialize)]
pub struct LockResponse {
    /// Whether the call changed (or confirmed) ownership as requested
    pub ok: bool,
    pub state: MicLockState,
}

fn holder(request: HolderRequest) -> Result<MicHolder, ApiError> {
    let name = request.holder.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("holder must not be empty".to_string()));
    }
    Ok(MicHolder::External(name.to_string()))
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<MicLockState> {
    Json(state.mic_lock.state())
}

async fn acquire(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<LockResponse>, ApiError> {
    let holder = holder(request)?;
    let ok = state.mic_lock.acquire(holder);
    Ok(Json(LockResponse {
        ok,
        state: state.mic_lock.state(),
    }))
}

async fn release(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<LockResponse>, ApiError> {
    let holder = holder(request)?;
    let ok = state.mic_lock.release(&holder);
    Ok(Json(LockResponse {
        ok,
        state: state.mic_lock.state(),
    }))
}
