// =============================================================================
// error.rs — EVERYTHING THAT CAN GO WRONG, IN ONE PLACE
// =============================================================================
//
// The dashboard used to squash every failure into a Persian toast saying
// "network error". We keep the two families apart: transport failures
// (HTTP, socket, Redis, disk) and logical failures (the backend answered,
// but said no).
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The backend responded but reported `success: false`.
    #[error("backend rejected the request: {0}")]
    Backend(String),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("URL already queued or processed: {0}")]
    DuplicateUrl(String),

    #[error("unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("proxy {0} is already being tested")]
    ProxyBusy(String),

    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    /// The archive channel could not take a finished document.
    #[error("archive channel {0}")]
    ArchiveUnavailable(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl ArchiveError {
    /// True for failures where retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ArchiveError::Http(_)
                | ArchiveError::Io(_)
                | ArchiveError::WebSocket(_)
                | ArchiveError::Redis(_)
                | ArchiveError::ArchiveUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
