use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Library-level error type surfaced by every [`crate::LnApi`] call.
#[derive(Debug, Error)]
pub enum LnError {
    /// No backend is registered under this identifier.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error("invalid auth: {0}")]
    InvalidAuth(String),
    /// The tunnel could not be (re)established within the retry budget.
    #[error(transparent)]
    Connection(#[from] TransportError),
    /// The node refused the session or the rune does not permit the command.
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    /// The tunnel closed while the call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,
    /// The client was closed, explicitly or after exhausting reconnect attempts.
    #[error("client closed")]
    ClientClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A structured failure reported by the node.
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LnError {
    /// Whether repeating the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LnError::Connection(_) | LnError::ConnectionClosed | LnError::Timeout { .. }
        )
    }
}

/// Result alias that defaults to [`LnError`].
pub type Result<T, E = LnError> = std::result::Result<T, E>;
