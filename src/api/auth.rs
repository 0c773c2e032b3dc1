//! API key authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use super::ApiState;

/// Extract API key from Authorization header
fn extract_api_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Reject requests without the configured bearer key
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Local-only deployments run without a key
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    match extract_api_key(&req) {
        Some(key) if key == expected.expose_secret() => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!("no API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
