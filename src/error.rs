use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Shared error type for the supervisor, control loop and dispatcher.
///
/// Anything that reaches the HTTP plane is mapped to a problem response at
/// the boundary (see `IntoResponse` below); internal callers just propagate
/// with `?`.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no loopback port could be confirmed free")]
    PortUnavailable,

    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("no eligible worker is available")]
    NoEligibleWorker,

    #[error("upstream worker on port {port} failed: {reason}")]
    Upstream { port: u16, reason: String },

    #[error("no worker listening on port {0}")]
    UnknownPort(u16),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration was malformed: {0}")]
    ConfigMalformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Problem {
    error: String,
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = match &self {
            ClusterError::NoEligibleWorker => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::UnknownPort(_) => StatusCode::NOT_FOUND,
            ClusterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ClusterError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ClusterError::PortUnavailable
            | ClusterError::SpawnFailed(_)
            | ClusterError::ConfigMalformed(_)
            | ClusterError::Io(_)
            | ClusterError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(Problem { error: self.to_string() })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
