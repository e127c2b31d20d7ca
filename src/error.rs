//! Error taxonomy for the CSMS core and its HTTP-facing error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the CSMS core (registry, actor, operator façade).
#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("charge point '{0}' is not connected")]
    NotConnected(String),

    #[error("no active transaction found")]
    NoActiveTransaction,

    #[error("connector has an active transaction")]
    Busy,

    #[error("charge point rejected the remote command: {0}")]
    RemoteRejected(String),

    #[error("charge point did not reply in time")]
    CallTimeout,

    #[error("connection closed while the operation was outstanding")]
    Disconnected,

    #[error("malformed OCPP frame: {0}")]
    Malformed(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotConnected(_) => StatusCode::NOT_FOUND,
            Self::NoActiveTransaction => StatusCode::NOT_FOUND,
            Self::Busy => StatusCode::BAD_REQUEST,
            Self::RemoteRejected(_) => StatusCode::CONFLICT,
            Self::CallTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Disconnected => StatusCode::BAD_GATEWAY,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            ok: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
