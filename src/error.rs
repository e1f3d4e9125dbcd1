//! Error types for the browser driver core

/// Error type for all driver operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The Chrome subprocess never exposed a usable `about:blank` target
    /// before the startup ceiling elapsed.
    #[error("chrome startup timed out: {0}")]
    StartupTimeout(String),

    /// The websocket closed unexpectedly, a message failed to decode, or
    /// some other non-terminal protocol anomaly occurred during a visit.
    #[error("browsing failed: {0}")]
    BrowsingException(String),

    /// `abort_browse_page` was called while a visit was in progress.
    #[error("browsing aborted: {0}")]
    BrowsingAborted(String),

    /// `Pool::acquire` was called with no available driver.
    #[error("browser pool is empty")]
    PoolEmpty,

    /// I/O errors, e.g. creating temp directories.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors talking to the DevTools readiness endpoint.
    #[error("HTTP error: {0}")]
    Http(String),

    /// DevTools websocket transport errors.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl Error {
    /// True if this error represents an explicit abort rather than a hard
    /// transport/protocol failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::BrowsingAborted(_))
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, Error>;
