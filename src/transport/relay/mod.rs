//! [`Tunnel`] implementation that reaches the node through an lnsocket-style websocket relay.
//!
//! The relay forwards raw bytes between the websocket and the node's Lightning peer port, so
//! the BOLT-8 session is end to end: the relay sees only ciphertext.

mod state;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, trace, warn};

use self::state::RelaySession;
use super::{
    brontide::{
        noise_conn::{perform_handshake, reader_loop, writer_loop, NoiseConnError},
        noise_machine::{BrontideMachine, BrontideMachineConfig, NoiseError},
        wire::Message,
        ws::{connect_relay, relay_url, RelayRecv, RelaySend},
    },
    Tunnel, TransportError, TunnelState,
};
use crate::{
    auth::Auth,
    config::{deadline_after, ClientConfig},
};

const RAW_CHANNEL_DEPTH: usize = 64;
const MESSAGE_CHANNEL_DEPTH: usize = 64;

/// Websocket relay tunnel carrying a BOLT-8 session.
pub struct RelayTunnel {
    relay: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    state: Arc<watch::Sender<TunnelState>>,
    session: Option<RelaySession>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
}

impl RelayTunnel {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        Self {
            relay: config.relay.clone(),
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            state: Arc::new(state),
            session: None,
            inbound: None,
        }
    }

    fn set_state(&self, next: TunnelState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(target: "cln_rs::relay", from = %prev, to = %next, "tunnel state");
        }
    }

    async fn establish(
        &self,
        auth: &Auth,
    ) -> Result<(RelaySession, mpsc::Receiver<Vec<u8>>), TransportError> {
        let addr = auth
            .node_address()
            .map_err(|e| TransportError::connection("invalid node address", e))?;
        let local_key = auth
            .local_secret_key()
            .map_err(|e| TransportError::connection("invalid session secret", e))?;

        let url = relay_url(&self.relay, &addr.host_port());
        let (ws_send, ws_recv) = connect_relay(&url, self.connect_timeout)
            .await
            .map_err(|e| TransportError::connection("relay connect failed", e))?;

        let mut session = RelaySession::default();
        let (raw_in_tx, raw_in_rx) = mpsc::channel(RAW_CHANNEL_DEPTH);
        let (raw_out_tx, raw_out_rx) = mpsc::channel(RAW_CHANNEL_DEPTH);
        session.push_reader(tokio::spawn(pump_socket_in(ws_recv, raw_in_tx)));
        session.push_writer(tokio::spawn(pump_socket_out(ws_send, raw_out_rx)));

        self.set_state(TunnelState::Authenticating);
        let deadline = deadline_after(Instant::now(), self.handshake_timeout);
        let machine = BrontideMachine::new(BrontideMachineConfig {
            initiator: true,
            local_static: Arc::new(local_key),
            remote_static: Some(addr.node_id),
            ephemeral: None,
        })
        .map_err(|e| TransportError::connection("handshake setup failed", e))?;
        let (machine, raw_in_rx, leftover) = timeout_at(
            deadline,
            perform_handshake(machine, raw_in_rx, raw_out_tx.clone()),
        )
        .await
        .map_err(|_| TransportError::connection_message("BOLT-8 handshake timed out"))?
        .map_err(handshake_error)?;
        debug!(target: "cln_rs::relay", node = %addr, "handshake complete");

        let (sealer, opener) = machine
            .into_split()
            .map_err(|e| TransportError::connection("handshake incomplete", e))?;
        let (outbound_tx, outbound_rx) = mpsc::channel(MESSAGE_CHANNEL_DEPTH);
        let (decrypted_tx, mut decrypted_rx) = mpsc::channel(MESSAGE_CHANNEL_DEPTH);
        session.push_writer(tokio::spawn(async move {
            if let Err(e) = writer_loop(sealer, outbound_rx, raw_out_tx).await {
                warn!(target: "cln_rs::noise", error = %e, "writer stopped");
            }
        }));
        session.push_reader(tokio::spawn(async move {
            if let Err(e) = reader_loop(opener, raw_in_rx, leftover, decrypted_tx).await {
                warn!(target: "cln_rs::noise", error = %e, "reader stopped");
            }
        }));

        timeout_at(deadline, exchange_init(&mut decrypted_rx, &outbound_tx))
            .await
            .map_err(|_| TransportError::connection_message("timed out waiting for node init"))??;

        let (consumer_tx, consumer_rx) = mpsc::channel(MESSAGE_CHANNEL_DEPTH);
        session.push_reader(tokio::spawn(route_inbound(
            decrypted_rx,
            outbound_tx.clone(),
            consumer_tx,
            self.state.clone(),
        )));
        session.outbound = Some(outbound_tx);
        Ok((session, consumer_rx))
    }
}

#[async_trait]
impl Tunnel for RelayTunnel {
    async fn open(&mut self, auth: &Auth) -> Result<(), TransportError> {
        if let Some(old) = self.session.take() {
            old.shutdown().await;
        }
        self.inbound = None;
        self.set_state(TunnelState::Connecting);
        match self.establish(auth).await {
            Ok((session, inbound)) => {
                self.session = Some(session);
                self.inbound = Some(inbound);
                self.set_state(TunnelState::Ready);
                Ok(())
            }
            Err(e) => {
                debug!(target: "cln_rs::relay", error = %e, "open failed");
                self.set_state(TunnelState::Disconnected);
                Err(e)
            }
        }
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state();
        if state != TunnelState::Ready {
            return Err(TransportError::NotReady(state));
        }
        let outbound = self
            .session
            .as_ref()
            .and_then(|s| s.outbound.as_ref())
            .ok_or(TransportError::NotReady(state))?;
        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound.take()
    }

    fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.set_state(TunnelState::Closing);
            session.shutdown().await;
        }
        self.inbound = None;
        self.set_state(TunnelState::Disconnected);
    }
}

fn handshake_error(err: NoiseConnError) -> TransportError {
    match err {
        NoiseConnError::Handshake(NoiseError::Crypto(msg)) => TransportError::Authorization(msg),
        NoiseConnError::Handshake(NoiseError::Io(e)) => TransportError::connection(
            "connection dropped during handshake (wrong node id or node unreachable)",
            e,
        ),
        other => TransportError::connection("handshake failed", other),
    }
}

// Wait for the node's `init`, answer it with the same feature bits, and report an `error`
// received instead as a rejected session.
async fn exchange_init(
    decrypted: &mut mpsc::Receiver<Vec<u8>>,
    outbound: &mpsc::Sender<Vec<u8>>,
) -> Result<(), TransportError> {
    loop {
        let raw = decrypted.recv().await.ok_or_else(|| {
            TransportError::connection_message("node closed the session before init")
        })?;
        match Message::decode(&raw) {
            Ok(Message::Init {
                global_features,
                features,
            }) => {
                debug!(
                    target: "cln_rs::relay",
                    features = %hex::encode(&features),
                    "received init"
                );
                let reply = Message::Init {
                    global_features: Bytes::new(),
                    features: mirror_features(&global_features, &features),
                };
                return outbound
                    .send(reply.encode())
                    .await
                    .map_err(|_| TransportError::Closed);
            }
            Ok(msg @ Message::Error { .. }) => {
                return Err(TransportError::Authorization(
                    msg.text().unwrap_or_default(),
                ));
            }
            Ok(msg @ Message::Warning { .. }) => {
                warn!(
                    target: "cln_rs::relay",
                    text = %msg.text().unwrap_or_default(),
                    "node warning before init"
                );
            }
            Ok(msg) => {
                if let Some(pong) = msg.pong_reply() {
                    outbound
                        .send(pong.encode())
                        .await
                        .map_err(|_| TransportError::Closed)?;
                } else {
                    trace!(target: "cln_rs::relay", msg_type = msg.msg_type(), "ignored before init");
                }
            }
            Err(e) => {
                return Err(TransportError::connection("malformed message before init", e));
            }
        }
    }
}

// The node's feature bits, with global features folded in the way BOLT-9 asks for.
fn mirror_features(global: &[u8], local: &[u8]) -> Bytes {
    let len = global.len().max(local.len());
    let mut out = vec![0u8; len];
    for (src, offset) in [(global, len - global.len()), (local, len - local.len())] {
        for (i, b) in src.iter().enumerate() {
            out[offset + i] |= b;
        }
    }
    Bytes::from(out)
}

async fn pump_socket_in(mut recv: RelayRecv, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        match recv.recv().await {
            Ok(chunk) => {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(target: "cln_rs::relay", error = %e, "socket reader finished");
                return;
            }
        }
    }
}

async fn pump_socket_out(mut send: RelaySend, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = send.send(chunk).await {
            debug!(target: "cln_rs::relay", error = %e, "socket writer failed");
            return;
        }
    }
    // Close the socket once every producer is gone.
    let _ = timeout(Duration::from_millis(500), send.close()).await;
}

// Answers pings, logs warnings, and hands everything else to the consumer in order.
async fn route_inbound(
    mut decrypted: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    consumer: mpsc::Sender<Vec<u8>>,
    state: Arc<watch::Sender<TunnelState>>,
) {
    while let Some(raw) = decrypted.recv().await {
        match Message::decode(&raw) {
            Ok(msg @ Message::Ping { .. }) => {
                if let Some(pong) = msg.pong_reply() {
                    if outbound.send(pong.encode()).await.is_err() {
                        break;
                    }
                }
                continue;
            }
            Ok(Message::Pong { .. }) => continue,
            Ok(msg @ Message::Warning { .. }) => {
                warn!(
                    target: "cln_rs::relay",
                    text = %msg.text().unwrap_or_default(),
                    "node warning"
                );
                continue;
            }
            _ => {}
        }
        if consumer.send(raw).await.is_err() {
            break;
        }
    }
    state.send_if_modified(|s| {
        if *s == TunnelState::Ready {
            *s = TunnelState::Disconnected;
            true
        } else {
            false
        }
    });
    debug!(target: "cln_rs::relay", "session ended");
}
