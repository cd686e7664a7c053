use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::transcoding::TranscodeError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<lumen_core::MediaError> for AppError {
    fn from(err: lumen_core::MediaError) -> Self {
        use lumen_core::MediaError;
        match err {
            MediaError::NotFound(msg) => Self::not_found(msg),
            MediaError::InvalidMedia(msg) => Self::bad_request(msg),
            MediaError::Cancelled(msg) => Self::unavailable(msg),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<TranscodeError> for AppError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::NotFound(msg) => Self::not_found(msg),
            TranscodeError::WaitTimeout => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "transcode did not finish in time")
            }
            TranscodeError::ShuttingDown => Self::unavailable("server is shutting down"),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
