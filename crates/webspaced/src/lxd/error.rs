//! LXD client error types.

use thiserror::Error;

/// Result type for LXD operations.
pub type LxdResult<T> = Result<T, LxdError>;

/// Errors returned by the LXD client.
///
/// `Api` and `Operation` display the raw message LXD sent, unmodified, so
/// callers can match on the exact text.
#[derive(Debug, Error)]
pub enum LxdError {
    /// LXD answered with an error response.
    #[error("{message}")]
    Api { status: u16, message: String },

    /// A background operation finished in a failure state.
    #[error("{0}")]
    Operation(String),

    /// The HTTP exchange with the LXD socket failed.
    #[error("LXD request failed: {0}")]
    Http(String),

    /// Response body could not be decoded.
    #[error("failed to parse LXD response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Response was well-formed JSON but not what we expected.
    #[error("unexpected LXD response: {0}")]
    Unexpected(String),

    /// Event or exec websocket failure.
    #[error("LXD websocket error: {0}")]
    WebSocket(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
