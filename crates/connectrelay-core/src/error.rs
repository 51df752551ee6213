//! Error types for ConnectRelay.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Request timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("HTTP {status} {status_text}: {body}")]
    Http {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Validation(String),

    #[error("Unhandled message type{}", unroutable_detail(.0))]
    Unroutable(String),

    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn unroutable_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

impl Error {
    /// Error for a message whose discriminator matched no route.
    pub fn unhandled() -> Self {
        Self::Unroutable(String::new())
    }

    /// Whether this error is a caller-side validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
