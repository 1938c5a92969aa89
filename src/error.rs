//! Crate-wide error type and result alias.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation was attempted before its prerequisite (e.g. `connect`
    /// before `publish`). Maps to 400.
    #[error("{0}")]
    Precondition(String),

    /// The session is already in the requested state (e.g. publish while
    /// published). Maps to 409.
    #[error("{0}")]
    Conflict(String),

    /// The SFU REST API returned a non-2xx response. Maps to 500 with the
    /// SFU body attached.
    #[error("SFU error (status {status}): {body}")]
    Sfu { status: u16, body: String },

    /// The upstream speech provider is unreachable or misbehaving.
    /// Recoverable via reconnect backoff; maps to 502 when surfaced.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed request or wire payload. Maps to 400.
    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// HTTP status code this error surfaces as when returned from a handler.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Precondition(_) | Error::BadPayload(_) => 400,
            Error::Conflict(_) => 409,
            Error::UpstreamUnavailable(_) => 502,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }
}
