//! Backend-agnostic node surface and the factory that builds backends by identifier.
//!
//! Callers depend only on [`LnApi`]. [`init_backend`] looks the identifier up in a static
//! registry of constructors, so adding a backend means adding one registry entry.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    auth::Auth,
    config::ClientConfig,
    error::{LnError, Result},
};

pub mod core_ln;
pub mod types;

pub use core_ln::CoreLn;
pub use types::{
    CreateInvoice, Decoded, FundChannel, FundOutput, Funds, Invoice, InvoiceCreated, Keysend,
    Msat, NetAddress, NewAddress, NodeInfo, Pay, PayInvoice, Payment, PeerChannel, PeerChannels,
    SignedMessage,
};

/// Lifecycle of a backend client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed, never connected.
    Uninitialized,
    Connecting,
    Ready,
    /// The session dropped; the next call reconnects.
    Degraded,
    /// Terminal. Every call fails with [`LnError::ClientClosed`].
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Connecting => "connecting",
            ClientState::Ready => "ready",
            ClientState::Degraded => "degraded",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Node operations every backend provides.
///
/// Each method validates its input, sends one command and maps a node failure to a typed
/// [`LnError`]. Connection setup is lazy: the first call opens the session unless
/// [`LnApi::open`] was called already.
#[async_trait]
pub trait LnApi: Send + Sync {
    fn backend_id(&self) -> BackendId;

    fn state(&self) -> ClientState;

    /// Connect now instead of on first use.
    async fn open(&self) -> Result<()>;

    /// Close the session for good. Outstanding calls fail with [`LnError::ConnectionClosed`],
    /// later ones with [`LnError::ClientClosed`].
    async fn close(&self);

    async fn get_info(&self) -> Result<NodeInfo>;

    /// On-chain outputs and channel balances.
    async fn list_funds(&self) -> Result<Funds>;

    async fn list_peer_channels(&self) -> Result<PeerChannels>;

    async fn create_invoice(&self, invoice: CreateInvoice) -> Result<InvoiceCreated>;

    /// Pay a BOLT-11 invoice. The call timeout is stretched past the payment retry window.
    async fn pay_invoice(&self, payment: PayInvoice) -> Result<Payment>;

    /// Spontaneous payment to a node id.
    async fn pay_keysend(&self, payment: Keysend) -> Result<Payment>;

    /// Decode a bolt11/bolt12 string or rune.
    async fn decode(&self, encoded: &str) -> Result<Decoded>;

    async fn list_invoices(&self) -> Result<Vec<Invoice>>;

    /// Wait until the invoice stored under `label` is paid or expires.
    async fn wait_invoice(&self, label: &str) -> Result<Invoice>;

    async fn list_pays(&self) -> Result<Vec<Pay>>;

    /// Fresh on-chain receive address.
    async fn new_address(&self) -> Result<NewAddress>;

    async fn sign_message(&self, message: &str) -> Result<SignedMessage>;

    /// Send any command and return the raw result. `timeout` overrides the default call
    /// timeout.
    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>)
        -> Result<Value>;
}

/// Registered backend identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendId {
    CoreLightning,
}

impl BackendId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendId::CoreLightning => "core_lightning",
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendId {
    type Err = LnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core_lightning" => Ok(BackendId::CoreLightning),
            other => Err(LnError::UnsupportedBackend(other.to_string())),
        }
    }
}

type Constructor = fn(Arc<Auth>, ClientConfig) -> Box<dyn LnApi>;

static REGISTRY: LazyLock<HashMap<&'static str, Constructor>> = LazyLock::new(|| {
    let mut registry: HashMap<&'static str, Constructor> = HashMap::new();
    registry.insert(BackendId::CoreLightning.as_str(), core_lightning);
    registry
});

fn core_lightning(auth: Arc<Auth>, config: ClientConfig) -> Box<dyn LnApi> {
    Box::new(CoreLn::new(auth, config))
}

/// Build the backend registered under `backend_id` with the default configuration.
///
/// Nothing connects here; see [`init_backend_with_config`].
///
/// # Errors
/// See [`init_backend_with_config`].
pub fn init_backend(backend_id: &str, auth: Auth) -> Result<Box<dyn LnApi>> {
    init_backend_with_config(backend_id, auth, ClientConfig::default())
}

/// Build the backend registered under `backend_id`.
///
/// The identifier is checked first, so an unknown backend is reported even when `auth` is
/// also bad. No I/O happens until the returned client is used.
///
/// # Errors
/// Returns [`LnError::UnsupportedBackend`] for unknown identifiers and
/// [`LnError::InvalidAuth`] when `auth` does not validate.
pub fn init_backend_with_config(
    backend_id: &str,
    auth: Auth,
    config: ClientConfig,
) -> Result<Box<dyn LnApi>> {
    let Some(constructor) = REGISTRY.get(backend_id) else {
        return Err(LnError::UnsupportedBackend(backend_id.to_string()));
    };
    auth.validate()?;
    tracing::debug!(target: "cln_rs::client", backend = backend_id, "backend initialized");
    Ok(constructor(Arc::new(auth), config))
}

/// Identifiers accepted by [`init_backend`], sorted.
#[must_use]
pub fn registered_backends() -> Vec<&'static str> {
    let mut ids: Vec<_> = REGISTRY.keys().copied().collect();
    ids.sort_unstable();
    ids
}
