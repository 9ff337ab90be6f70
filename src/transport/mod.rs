use std::{borrow::Cow, error::Error, fmt};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::auth::Auth;

pub mod brontide;
pub mod relay;

pub use relay::RelayTunnel;

type BoxError = Box<dyn Error + Send + Sync>;

/// Connection state owned by a [`Tunnel`]. Everyone else only observes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Authenticating => "authenticating",
            TunnelState::Ready => "ready",
            TunnelState::Closing => "closing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{context}")]
    Connection {
        context: Cow<'static, str>,
        #[source]
        source: Option<BoxError>,
    },
    #[error("node rejected credentials: {0}")]
    Authorization(String),
    #[error("tunnel not ready (state: {0})")]
    NotReady(TunnelState),
    #[error("tunnel closed")]
    Closed,
}

impl TransportError {
    /// Build a connection error with context and source.
    pub fn connection<S, E>(context: S, source: E) -> Self
    where
        S: Into<Cow<'static, str>>,
        E: Error + Send + Sync + 'static,
    {
        Self::Connection {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a connection error that only has context (no underlying source).
    pub fn connection_message<S>(context: S) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self::Connection {
            context: context.into(),
            source: None,
        }
    }
}

/// Persistent encrypted channel to one node.
///
/// A tunnel carries complete Lightning messages (`type || payload`) in both directions. It
/// reports state changes but never reconnects on its own; the owning client decides when to
/// call [`Tunnel::open`] again.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Connect and authenticate with the node named by `auth`.
    ///
    /// On failure the tunnel is left [`TunnelState::Disconnected`] with nothing running.
    async fn open(&mut self, auth: &Auth) -> Result<(), TransportError>;

    /// Queue one message for the node. Fails with [`TransportError::NotReady`] unless the
    /// tunnel is [`TunnelState::Ready`].
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Hand over the inbound message stream for the current session. Only the first call after
    /// each [`Tunnel::open`] returns `Some`. The stream ends when the session does.
    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>>;

    fn state(&self) -> TunnelState;

    fn subscribe_state(&self) -> watch::Receiver<TunnelState>;

    /// Tear the session down. Idempotent.
    async fn close(&mut self);
}
