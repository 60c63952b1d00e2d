//! Error types for the server.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use botwright_runtime::{RuntimeError, SourceError, StoreError, TransportError};
use serde_json::json;
use std::fmt;

/// Errors returned by management API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// A runtime operation failed.
    Runtime(RuntimeError),
    /// The request was well-formed JSON but unusable.
    InvalidRequest { message: String },
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest {
            message: rejection.body_text(),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let error = match self {
            Self::Runtime(error) => error,
            Self::InvalidRequest { .. } => return StatusCode::BAD_REQUEST,
        };
        match error {
            RuntimeError::Validation { .. } => StatusCode::BAD_REQUEST,
            RuntimeError::NotDeployed { .. }
            | RuntimeError::Source(SourceError::NotFound { .. }) => StatusCode::NOT_FOUND,
            RuntimeError::AlreadyDeploying { .. } => StatusCode::CONFLICT,
            RuntimeError::BotUnavailable { .. }
            | RuntimeError::PersistenceTimeout { .. }
            | RuntimeError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::Transport { .. } | RuntimeError::Source(_) => StatusCode::BAD_GATEWAY,
            RuntimeError::FlowLoopDetected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RuntimeError::Evaluation { .. } | RuntimeError::InvalidStateTransition { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Runtime(error) => error.to_string(),
            Self::InvalidRequest { message } => message,
        };
        if status.is_server_error() {
            tracing::error!(%message, "request failed");
        } else {
            tracing::debug!(%message, "request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Errors that stop the server from starting or serving.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration could not be loaded.
    Config { details: String },
    /// NATS could not be reached.
    Nats(TransportError),
    /// The state bucket could not be opened.
    StateStore(StoreError),
    /// The definition source client could not be built.
    DefinitionSource { details: String },
    /// The listen address could not be bound.
    Bind { addr: String, details: String },
    /// The HTTP server stopped with an error.
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::Nats(e) => write!(f, "NATS unavailable: {e}"),
            Self::StateStore(e) => write!(f, "state store unavailable: {e}"),
            Self::DefinitionSource { details } => {
                write!(f, "definition source client failed: {details}")
            }
            Self::Bind { addr, details } => write!(f, "failed to bind {addr}: {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}
