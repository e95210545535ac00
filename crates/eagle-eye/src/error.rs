use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use eagle_common::error::CommonError;
use eagle_common::upstream::{ShapeError, UpstreamClientError};
use serde::Serialize;

/// Startup failures. These abort the process before any request is served.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

/// Terminal outcome of a failed analyze request.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upstream call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("request body rejected ({status}): {message}")]
    RejectedBody { status: u16, message: String },

    #[error("upstream returned status {status}")]
    UpstreamError { status: u16, body: String },

    #[error("malformed upstream response: {0}")]
    MalformedUpstreamResponse(#[source] ShapeError),

    #[error("unexpected error: {0}")]
    UnexpectedError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Timeout,
    UpstreamError,
    MalformedUpstreamResponse,
    UnexpectedError,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::RejectedBody { .. } => ErrorKind::InvalidInput,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::UpstreamError { .. } => ErrorKind::UpstreamError,
            Self::MalformedUpstreamResponse(_) => ErrorKind::MalformedUpstreamResponse,
            Self::UnexpectedError(_) => ErrorKind::UnexpectedError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::RejectedBody { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            // Upstream may send a code axum cannot represent; treat that as a bad gateway.
            Self::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::MalformedUpstreamResponse(_) | Self::UnexpectedError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Self::InvalidInput(message) | Self::RejectedBody { message, .. } => {
                ErrorBody::new(message.clone(), None)
            }
            Self::Timeout(_) => ErrorBody::new("Request timed out", None),
            Self::UpstreamError { body, .. } => ErrorBody::new("API request failed", Some(body.clone())),
            Self::MalformedUpstreamResponse(_) => {
                ErrorBody::new("Malformed response from upstream API", None)
            }
            Self::UnexpectedError(message) => {
                ErrorBody::new("Failed to process request", Some(message.clone()))
            }
        }
    }
}

impl From<UpstreamClientError> for RelayError {
    fn from(err: UpstreamClientError) -> Self {
        match err {
            UpstreamClientError::Timeout(deadline) => Self::Timeout(deadline),
            UpstreamClientError::Upstream { status, body } => Self::UpstreamError {
                status: status.as_u16(),
                body,
            },
            UpstreamClientError::Malformed(shape) => Self::MalformedUpstreamResponse(shape),
            UpstreamClientError::Request(e) => Self::UnexpectedError(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    fn new(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            error: error.into(),
            details,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
