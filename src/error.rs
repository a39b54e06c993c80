//! Error types shared by every component.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A vector did not have the expected number of dimensions. Retrying
    /// cannot fix this, so callers reject the input outright.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("store error: {0}")]
    Store(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("dead-letter error: {0}")]
    DeadLetter(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl Error {
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) | Error::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Store(_) | Error::Stream(_) | Error::DeadLetter(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Config(_) | Error::ConfigParse(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
