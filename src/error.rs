use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;
use tracing::error;

use crate::types::Venue;

/// Venue unreachable or returned something we could not decode.
/// Distinct from an empty page, which is a successful "no data".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{venue} returned HTTP {status}")]
    Status { venue: Venue, status: u16 },

    #[error("malformed {venue} response: {reason}")]
    Decode { venue: Venue, reason: String },

    #[error("{venue} fetch timed out after {secs}s")]
    Timeout { venue: Venue, secs: u64 },
}

/// A single raw record that does not fit its source shape. The record is
/// dropped; the rest of the batch continues.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("price `{field}` out of range: {value}")]
    PriceOutOfRange { field: &'static str, value: f64 },
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding backend returned HTTP {0}")]
    Status(u16),

    #[error("malformed embedding response: {0}")]
    Decode(String),

    #[error("embedding backend returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("embedding dimension mismatch: {0} vs {1}")]
    DimensionMismatch(usize, usize),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbedError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt stored row: {0}")]
    CorruptRow(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        match &self {
            AppError::Json(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("invalid request body: {e}") })),
                )
                    .into_response();
            }
            AppError::NotFound(what) => {
                return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": what }))).into_response();
            }
            _ => {}
        }
        // Details stay in the log; callers only see a generic failure.
        error!("Request failed: {self}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "Internal Server Error" })),
        )
            .into_response()
    }
}
