//! Local HTTP control API
//!
//! Lets the host application start and stop sessions, read the transcript, and
//! take the microphone for its own use.

mod auth;
pub mod health;
pub mod mic;
pub mod session;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use secrecy::SecretString;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::mic_lock::MicLock;
use crate::session::SessionHandle;
use crate::voice::WakeWordSupervisor;
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub session: SessionHandle,
    pub mic_lock: MicLock,
    /// Present when passive wake word detection is enabled
    pub wake_word: Option<WakeWordSupervisor>,
    /// Bearer key required on every route except `/health`
    pub api_key: Option<Arc<SecretString>>,
}

impl ApiState {
    #[must_use]
    pub const fn new(session: SessionHandle, mic_lock: MicLock) -> Self {
        Self {
            session,
            mic_lock,
            wake_word: None,
            api_key: None,
        }
    }

    #[must_use]
    pub fn with_wake_word(mut self, supervisor: WakeWordSupervisor) -> Self {
        self.wake_word = Some(supervisor);
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, key: Option<SecretString>) -> Self {
        self.api_key = key.map(Arc::new);
        self
    }
}

/// Build the full router
pub fn router(state: ApiState) -> Router {
    let state = Arc::new(state);

    let protected = Router::new()
        .nest("/session", session::router(Arc::clone(&state)))
        .nest("/mic-lock", mic::router(Arc::clone(&state)))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router(state))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    state: ApiState,
    host: String,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: ApiState, host: String, port: u16) -> Self {
        Self { state, host, port }
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(%addr, "API server listening");

        axum::serve(listener, router(self.state))
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

/// Error body: `{"error": {"code": ..., "message": ...}}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Session(Error),
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::Session(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Session(error) => {
                let status = match &error {
                    Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
                    Error::DeviceBusy(_) | Error::Cancelled(_) => StatusCode::CONFLICT,
                    Error::ChannelOpen(_) | Error::ChannelRuntime(_) | Error::WebSocket(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    Error::ControllerGone => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.code(), error.to_string())
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: ErrorBody { code, message },
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_statuses() {
        let cases = [
            (Error::PermissionDenied("no".into()), StatusCode::FORBIDDEN),
            (Error::DeviceBusy("held".into()), StatusCode::CONFLICT),
            (Error::ChannelOpen("refused".into()), StatusCode::BAD_GATEWAY),
            (Error::ControllerGone, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn bad_request_is_400() {
        let response = ApiError::BadRequest("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
