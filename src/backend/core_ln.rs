//! Core Lightning backend over commando.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use k256::PublicKey;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval, sleep, timeout_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use super::{
    types::{InvoiceList, PayList},
    BackendId, ClientState, CreateInvoice, Decoded, Funds, Invoice, InvoiceCreated, Keysend, LnApi,
    NewAddress, NodeInfo, Pay, PayInvoice, Payment, PeerChannels, SignedMessage,
};
use crate::{
    auth::Auth,
    config::ClientConfig,
    error::{LnError, Result},
    rpc::{parse_response, CommandRequest, Correlator, ReplyAssembler},
    transport::{
        brontide::{noise_machine::MAX_MESSAGE_SIZE, wire::Message},
        RelayTunnel, TransportError, Tunnel,
    },
};

/// Commando command header: message type plus request id.
const COMMANDO_HEADER_LEN: usize = 2 + 8;

/// Longest message `signmessage` accepts before framing. The framed command must still fit in
/// one BOLT-8 message.
pub const MAX_SIGN_MESSAGE_LEN: usize = MAX_MESSAGE_SIZE - COMMANDO_HEADER_LEN;

/// BOLT-11 caps the description field at 639 bytes.
const MAX_DESCRIPTION_LEN: usize = 639;

/// Client for one Core Lightning node, reached through a [`Tunnel`].
///
/// Cheap to share behind an `Arc`: every method takes `&self` and any number of calls may be
/// outstanding at once. Dropping the client stops its background tasks.
pub struct CoreLn {
    inner: Arc<Inner>,
}

struct Inner {
    auth: Arc<Auth>,
    config: ClientConfig,
    tunnel: Mutex<Box<dyn Tunnel>>,
    correlator: Arc<Correlator>,
    state: watch::Sender<ClientState>,
    connect_lock: Mutex<()>,
    /// Bumped on every successful open and on close, so a stale dispatch task cannot tear
    /// down a newer session.
    epoch: AtomicU64,
    tasks: parking_lot::Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    sweeper: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.sweeper.take(), self.dispatch.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

impl CoreLn {
    /// Client that reaches the node through the configured websocket relay.
    #[must_use]
    pub fn new(auth: Arc<Auth>, config: ClientConfig) -> Self {
        let tunnel = RelayTunnel::new(&config);
        Self::with_tunnel(auth, config, Box::new(tunnel))
    }

    /// Client over a caller-supplied tunnel.
    #[must_use]
    pub fn with_tunnel(auth: Arc<Auth>, config: ClientConfig, tunnel: Box<dyn Tunnel>) -> Self {
        let (state, _) = watch::channel(ClientState::Uninitialized);
        let correlator = Correlator::new(config.call_timeout);
        Self {
            inner: Arc::new(Inner {
                auth,
                config,
                tunnel: Mutex::new(tunnel),
                correlator,
                state,
                connect_lock: Mutex::new(()),
                epoch: AtomicU64::new(0),
                tasks: parking_lot::Mutex::new(Tasks::default()),
            }),
        }
    }

    #[must_use]
    pub fn auth(&self) -> &Auth {
        &self.inner.auth
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of calls still waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.len()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let value = self.inner.execute(method, params, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Inner {
    fn current(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Move to `next` unless the client is already closed.
    fn transition(&self, next: ClientState) {
        self.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                return false;
            }
            debug!(target: "cln_rs::client", from = %state, to = %next, "client state");
            *state = next;
            true
        });
    }

    async fn ensure_ready(self: &Arc<Self>) -> Result<()> {
        match self.current() {
            ClientState::Ready => return Ok(()),
            ClientState::Closed => return Err(LnError::ClientClosed),
            _ => {}
        }
        let _guard = self.connect_lock.lock().await;
        // Another caller may have finished the reconnect while we waited.
        match self.current() {
            ClientState::Ready => Ok(()),
            ClientState::Closed => Err(LnError::ClientClosed),
            _ => self.connect().await,
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        self.transition(ClientState::Connecting);
        let policy = &self.config.reconnect;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = policy.delay_for(attempt - 1);
                debug!(target: "cln_rs::client", attempt, ?delay, "backing off before reconnect");
                sleep(delay).await;
            }
            if self.current() == ClientState::Closed {
                return Err(LnError::ClientClosed);
            }

            let mut tunnel = self.tunnel.lock().await;
            match tunnel.open(&self.auth).await {
                Ok(()) => {
                    let Some(inbound) = tunnel.take_inbound() else {
                        tunnel.close().await;
                        last_error = Some(TransportError::connection_message(
                            "tunnel opened without an inbound stream",
                        ));
                        continue;
                    };
                    if self.current() == ClientState::Closed {
                        tunnel.close().await;
                        return Err(LnError::ClientClosed);
                    }
                    // Epoch and state change under the tunnel lock, so a dispatch task that
                    // ends concurrently sees the new session.
                    self.start_session(inbound);
                    self.transition(ClientState::Ready);
                    drop(tunnel);
                    info!(
                        target: "cln_rs::client",
                        address = %self.auth.address,
                        attempt,
                        "connected"
                    );
                    return Ok(());
                }
                Err(TransportError::Authorization(reason)) => {
                    drop(tunnel);
                    warn!(target: "cln_rs::client", %reason, "node rejected session");
                    self.shut_down().await;
                    return Err(LnError::Authorization(reason));
                }
                Err(err) => {
                    warn!(target: "cln_rs::client", attempt, attempts, error = %err, "connect failed");
                    last_error = Some(err);
                }
            }
        }

        warn!(target: "cln_rs::client", attempts, "reconnect attempts exhausted, closing client");
        self.shut_down().await;
        Err(LnError::Connection(last_error.unwrap_or_else(|| {
            TransportError::connection_message("no connection attempt was made")
        })))
    }

    fn start_session(self: &Arc<Self>, inbound: mpsc::Receiver<Vec<u8>>) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::downgrade(self),
            Arc::clone(&self.correlator),
            inbound,
            epoch,
            self.config.max_malformed_frames.max(1),
        ));
        let mut tasks = self.tasks.lock();
        if let Some(old) = tasks.dispatch.replace(dispatch) {
            old.abort();
        }
        if tasks.sweeper.is_none() {
            tasks.sweeper = Some(spawn_sweeper(
                Arc::clone(&self.correlator),
                self.config.sweep_interval,
            ));
        }
    }

    /// Called by the dispatch task of session `epoch` when its inbound stream ends.
    async fn session_lost(&self, epoch: u64) {
        let mut tunnel = self.tunnel.lock().await;
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        let rejected = self.correlator.reject_all(|| LnError::ConnectionClosed);
        self.transition(ClientState::Degraded);
        warn!(target: "cln_rs::client", rejected, "session lost");
        tunnel.close().await;
    }

    /// Enter the terminal state and release everything.
    async fn shut_down(&self) {
        self.state.send_replace(ClientState::Closed);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.tasks.lock().abort_all();
        // Calls already on the wire lose their session; later calls see `ClientClosed`.
        self.correlator.reject_all(|| LnError::ConnectionClosed);
        self.tunnel.lock().await.close().await;
    }

    async fn execute(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let mut request = CommandRequest::new(method, params)?;
        self.ensure_ready().await?;

        self.correlator.sweep(Instant::now());
        let (id, reply) = self.correlator.register(&request.method, timeout);
        request.id = id;
        let frame = match request.to_frame(self.auth.rune()) {
            Ok(frame) if frame.len() > MAX_MESSAGE_SIZE => {
                self.correlator.cancel(id);
                return Err(LnError::InvalidParams(format!(
                    "{method} command is {} bytes, over the {MAX_MESSAGE_SIZE} byte message limit",
                    frame.len()
                )));
            }
            Ok(frame) => frame,
            Err(err) => {
                self.correlator.cancel(id);
                return Err(err);
            }
        };

        // The deadline covers a stalled outbound path too, including waiting for the tunnel.
        let sent = timeout_at(reply.deadline(), async {
            self.tunnel.lock().await.send(frame).await
        })
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.correlator.cancel(id);
                debug!(target: "cln_rs::client", id, method, error = %err, "send failed");
                return Err(match err {
                    TransportError::Authorization(reason) => LnError::Authorization(reason),
                    _ => LnError::ConnectionClosed,
                });
            }
            Err(_) => {
                self.correlator.cancel(id);
                warn!(target: "cln_rs::client", id, method, "send stalled past the call deadline");
                return Err(LnError::Timeout {
                    method: method.to_string(),
                    after: reply.budget(),
                });
            }
        }
        debug!(target: "cln_rs::client", id, method, "command sent");

        reply.wait().await?.into_value()
    }
}

/// Sole consumer of a session's inbound stream.
async fn dispatch_loop(
    client: Weak<Inner>,
    correlator: Arc<Correlator>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    epoch: u64,
    max_malformed: u32,
) {
    let mut assembler = ReplyAssembler::default();
    let mut malformed = 0u32;

    while let Some(raw) = inbound.recv().await {
        let message = match Message::decode(&raw) {
            Ok(message) => {
                malformed = 0;
                message
            }
            Err(err) => {
                malformed += 1;
                warn!(target: "cln_rs::client", error = %err, malformed, "dropping malformed frame");
                if malformed >= max_malformed {
                    warn!(target: "cln_rs::client", malformed, "stream desynchronized, ending session");
                    break;
                }
                continue;
            }
        };
        match message {
            Message::CommandoReply {
                req_id,
                terminal,
                chunk,
            } => route_reply(&correlator, &mut assembler, req_id, terminal, &chunk),
            Message::Error { .. } => {
                warn!(
                    target: "cln_rs::client",
                    text = %message.text().unwrap_or_default(),
                    "node sent error"
                );
            }
            other => {
                trace!(target: "cln_rs::client", msg_type = other.msg_type(), "ignoring message");
            }
        }
    }

    assembler.clear();
    if let Some(client) = client.upgrade() {
        client.session_lost(epoch).await;
    }
}

/// Feed one reply chunk to the assembler, or drop it when nobody is waiting for `req_id`.
fn route_reply(
    correlator: &Correlator,
    assembler: &mut ReplyAssembler,
    req_id: u64,
    terminal: bool,
    chunk: &[u8],
) {
    if !correlator.contains(req_id) {
        assembler.discard(req_id);
        debug!(target: "cln_rs::client", req_id, len = chunk.len(), "dropping stray reply chunk");
        return;
    }
    match assembler.push(req_id, terminal, chunk) {
        None => trace!(target: "cln_rs::client", req_id, len = chunk.len(), "partial reply"),
        Some(body) => {
            let result = body.and_then(|body| parse_response(&body));
            correlator.resolve(req_id, result);
        }
    }
}

fn spawn_sweeper(correlator: Arc<Correlator>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = correlator.sweep(Instant::now());
            if expired > 0 {
                debug!(target: "cln_rs::client", expired, "swept expired calls");
            }
        }
    })
}

fn invalid(message: impl Into<String>) -> LnError {
    LnError::InvalidParams(message.into())
}

fn check_amount(amount_msat: u64) -> Result<()> {
    if amount_msat == 0 {
        return Err(invalid("amount must be positive"));
    }
    Ok(())
}

fn invoice_params(invoice: &CreateInvoice, label: &str, default_expiry: Duration) -> Result<Value> {
    if let Some(amount) = invoice.amount_msat {
        check_amount(amount)?;
    }
    if invoice.description.len() > MAX_DESCRIPTION_LEN {
        return Err(invalid(format!(
            "description exceeds {MAX_DESCRIPTION_LEN} bytes"
        )));
    }
    if label.trim().is_empty() {
        return Err(invalid("label is empty"));
    }
    let expiry = invoice.expiry.unwrap_or(default_expiry);
    if expiry.as_secs() == 0 {
        return Err(invalid("expiry must be at least one second"));
    }
    let amount = invoice
        .amount_msat
        .map_or_else(|| json!("any"), |msat| json!(msat));
    Ok(json!({
        "amount_msat": amount,
        "label": label,
        "description": invoice.description,
        "expiry": expiry.as_secs(),
    }))
}

fn pay_params(payment: &PayInvoice, config: &ClientConfig) -> Result<(Value, Duration)> {
    let bolt11 = payment.bolt11.trim();
    if !bolt11.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("ln")) {
        return Err(invalid("bolt11 must be a lightning invoice"));
    }
    let max_fee_percent = payment.max_fee_percent.unwrap_or(config.pay_max_fee_percent);
    if !(0.0..=100.0).contains(&max_fee_percent) {
        return Err(invalid("max_fee_percent must be between 0 and 100"));
    }
    let retry_for = payment.retry_for.unwrap_or(config.pay_retry_for);

    let mut params = Map::new();
    params.insert("bolt11".into(), json!(bolt11));
    if let Some(amount) = payment.amount_msat {
        check_amount(amount)?;
        params.insert("amount_msat".into(), json!(amount));
    }
    params.insert("maxfeepercent".into(), json!(max_fee_percent));
    params.insert("retry_for".into(), json!(retry_for.as_secs()));
    // The node keeps retrying for `retry_for`; give the reply room to arrive after that.
    Ok((
        Value::Object(params),
        retry_for.saturating_add(config.call_timeout),
    ))
}

fn keysend_params(payment: &Keysend) -> Result<Value> {
    let destination = payment.destination.trim();
    let bytes = hex::decode(destination).map_err(|_| invalid("destination is not hex"))?;
    if bytes.len() != 33 || PublicKey::from_sec1_bytes(&bytes).is_err() {
        return Err(invalid("destination is not a compressed public key"));
    }
    check_amount(payment.amount_msat)?;
    let mut params = Map::new();
    params.insert("destination".into(), json!(destination.to_ascii_lowercase()));
    params.insert("amount_msat".into(), json!(payment.amount_msat));
    if let Some(label) = &payment.label {
        params.insert("label".into(), json!(label));
    }
    Ok(Value::Object(params))
}

fn generate_label() -> String {
    format!("cln-rs-{}", hex::encode(rand::random::<[u8; 8]>()))
}

#[async_trait]
impl LnApi for CoreLn {
    fn backend_id(&self) -> BackendId {
        BackendId::CoreLightning
    }

    fn state(&self) -> ClientState {
        self.inner.current()
    }

    async fn open(&self) -> Result<()> {
        self.inner.ensure_ready().await
    }

    async fn close(&self) {
        if self.inner.current() == ClientState::Closed {
            return;
        }
        info!(target: "cln_rs::client", "closing client");
        self.inner.shut_down().await;
    }

    async fn get_info(&self) -> Result<NodeInfo> {
        self.request("getinfo", json!({}), None).await
    }

    async fn list_funds(&self) -> Result<Funds> {
        self.request("listfunds", json!({}), None).await
    }

    async fn list_peer_channels(&self) -> Result<PeerChannels> {
        self.request("listpeerchannels", json!({}), None).await
    }

    async fn create_invoice(&self, invoice: CreateInvoice) -> Result<InvoiceCreated> {
        let label = invoice.label.clone().unwrap_or_else(generate_label);
        let params = invoice_params(&invoice, &label, self.inner.config.invoice_expiry)?;
        let mut created: InvoiceCreated = self.request("invoice", params, None).await?;
        created.label = label;
        Ok(created)
    }

    async fn pay_invoice(&self, payment: PayInvoice) -> Result<Payment> {
        let (params, timeout) = pay_params(&payment, &self.inner.config)?;
        self.request("pay", params, Some(timeout)).await
    }

    async fn pay_keysend(&self, payment: Keysend) -> Result<Payment> {
        let params = keysend_params(&payment)?;
        let timeout = self
            .inner
            .config
            .pay_retry_for
            .saturating_add(self.inner.config.call_timeout);
        self.request("keysend", params, Some(timeout)).await
    }

    async fn decode(&self, encoded: &str) -> Result<Decoded> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(invalid("nothing to decode"));
        }
        self.request("decode", json!({ "string": encoded }), None).await
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>> {
        let list: InvoiceList = self.request("listinvoices", json!({}), None).await?;
        Ok(list.invoices)
    }

    async fn wait_invoice(&self, label: &str) -> Result<Invoice> {
        if label.trim().is_empty() {
            return Err(invalid("label is empty"));
        }
        let timeout = self.inner.config.wait_invoice_timeout;
        self.request("waitinvoice", json!({ "label": label }), Some(timeout))
            .await
    }

    async fn list_pays(&self) -> Result<Vec<Pay>> {
        let list: PayList = self.request("listpays", json!({}), None).await?;
        Ok(list.pays)
    }

    async fn new_address(&self) -> Result<NewAddress> {
        self.request("newaddr", json!({ "addresstype": "bech32" }), None)
            .await
    }

    async fn sign_message(&self, message: &str) -> Result<SignedMessage> {
        if message.is_empty() {
            return Err(invalid("message is empty"));
        }
        if message.len() > MAX_SIGN_MESSAGE_LEN {
            return Err(invalid(format!(
                "message exceeds {MAX_SIGN_MESSAGE_LEN} bytes"
            )));
        }
        self.request("signmessage", json!({ "message": message }), None)
            .await
    }

    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        self.inner.execute(method, params, timeout).await
    }
}
