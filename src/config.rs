use std::time::Duration;

use tokio::time::Instant;

/// Default lnsocket relay that forwards websocket traffic to a node's peer port.
pub const DEFAULT_RELAY: &str = "wss://lnsocket.clams.tech";

/// Lightning peer port assumed when an address omits one.
pub const DEFAULT_PORT: u16 = 9735;

/// Expiry applied to invoices created without an explicit one.
pub const DEFAULT_INVOICE_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Longest wait any single deadline is allowed. Longer timeouts are clamped to it.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `start + budget`, with `budget` clamped to [`MAX_TIMEOUT`] so the sum cannot overflow.
#[must_use]
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    let budget = budget.min(MAX_TIMEOUT);
    start.checked_add(budget).unwrap_or(start)
}

/// Runtime configuration for a [`crate::backend::CoreLn`] client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Websocket relay used to reach the node. `wss://` is assumed when no scheme is given.
    pub relay: String,
    /// Deadline applied to calls that do not specify their own.
    pub call_timeout: Duration,
    /// Timeout for establishing the relay websocket.
    pub connect_timeout: Duration,
    /// Timeout for the BOLT-8 handshake plus the `init` exchange.
    pub handshake_timeout: Duration,
    /// How often the pending-call table is swept for expired deadlines.
    pub sweep_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Consecutive undecodable frames tolerated before the session is treated as desynced.
    pub max_malformed_frames: u32,
    pub invoice_expiry: Duration,
    /// `maxfeepercent` sent with `pay`.
    pub pay_max_fee_percent: f64,
    /// `retry_for` sent with `pay`.
    pub pay_retry_for: Duration,
    /// Per-call timeout for `waitinvoice`, which long-polls.
    pub wait_invoice_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: DEFAULT_RELAY.to_string(),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(250),
            reconnect: ReconnectPolicy::default(),
            max_malformed_frames: 3,
            invoice_expiry: DEFAULT_INVOICE_EXPIRY,
            pay_max_fee_percent: 0.5,
            pay_retry_for: Duration::from_secs(120),
            wait_invoice_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Bounded exponential backoff used when (re)opening the tunnel.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Total open attempts per reconnect, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}
