use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cln_rs::{
    backend::{CreateInvoice, Msat},
    init_backend,
    transport::{brontide::wire::Message, TransportError, Tunnel, TunnelState},
    Auth, ClientConfig, ClientState, CoreLn, LnApi, LnError, ReconnectPolicy,
};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

const NODE: &str =
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798@127.0.0.1:9735";
const RUNE: &str = "tU-RLjMiDpY2U0o3W1oFowar36RFGpWloPbW9-RuZdo9MyZpZD0wMjRi";

#[derive(Clone, Copy, Debug)]
enum OpenOutcome {
    Accept,
    Refuse,
    Unreachable,
}

struct Shared {
    opens: AtomicUsize,
    script: Mutex<VecDeque<OpenOutcome>>,
    to_client: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    commands: mpsc::UnboundedSender<Vec<u8>>,
    /// While set, `send` never completes, as with a socket that stopped draining.
    stall_sends: AtomicBool,
}

struct MockTunnel {
    shared: Arc<Shared>,
    state: watch::Sender<TunnelState>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn open(&mut self, _auth: &Auth) -> Result<(), TransportError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenOutcome::Accept);
        match outcome {
            OpenOutcome::Accept => {
                let (tx, rx) = mpsc::channel(64);
                *self.shared.to_client.lock().unwrap() = Some(tx);
                self.inbound = Some(rx);
                self.state.send_replace(TunnelState::Ready);
                Ok(())
            }
            OpenOutcome::Refuse => Err(TransportError::Authorization("init rejected".into())),
            OpenOutcome::Unreachable => {
                Err(TransportError::connection_message("relay unreachable"))
            }
        }
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = *self.state.borrow();
        if state != TunnelState::Ready {
            return Err(TransportError::NotReady(state));
        }
        if self.shared.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.shared
            .commands
            .send(frame)
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
        self.shared.to_client.lock().unwrap().take();
        self.inbound = None;
        self.state.send_replace(TunnelState::Disconnected);
    }
}

/// The node side of a [`MockTunnel`].
struct MockNode {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockNode {
    async fn next_command(&mut self) -> (u64, Value) {
        let frame = self.commands.recv().await.expect("client hung up");
        match Message::decode(&frame).expect("wire") {
            Message::CommandoCmd { req_id, json } => {
                (req_id, serde_json::from_slice(&json).expect("command json"))
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    async fn push(&self, frame: Vec<u8>) {
        let tx = self
            .shared
            .to_client
            .lock()
            .unwrap()
            .clone()
            .expect("no open session");
        tx.send(frame).await.expect("client stopped reading");
    }

    async fn reply(&self, id: u64, result: Value) {
        let body = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        self.push(reply_frame(id, true, &serde_json::to_vec(&body).unwrap()))
            .await;
    }

    async fn fail(&self, id: u64, code: i64, message: &str) {
        let body = json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } });
        self.push(reply_frame(id, true, &serde_json::to_vec(&body).unwrap()))
            .await;
    }

    fn drop_session(&self) {
        self.shared.to_client.lock().unwrap().take();
    }

    fn stall_sends(&self, stall: bool) {
        self.shared.stall_sends.store(stall, Ordering::SeqCst);
    }

    fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

fn reply_frame(id: u64, terminal: bool, chunk: &[u8]) -> Vec<u8> {
    Message::CommandoReply {
        req_id: id,
        terminal,
        chunk: Bytes::copy_from_slice(chunk),
    }
    .encode()
}

fn client_with(config: ClientConfig, script: &[OpenOutcome]) -> (Arc<CoreLn>, MockNode) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        opens: AtomicUsize::new(0),
        script: Mutex::new(script.iter().copied().collect()),
        to_client: Mutex::new(None),
        commands: commands_tx,
        stall_sends: AtomicBool::new(false),
    });
    let (state, _) = watch::channel(TunnelState::Disconnected);
    let tunnel = MockTunnel {
        shared: Arc::clone(&shared),
        state,
        inbound: None,
    };
    let auth = Arc::new(Auth::new(NODE, RUNE, "s1"));
    let client = CoreLn::with_tunnel(auth, config, Box::new(tunnel));
    (
        Arc::new(client),
        MockNode {
            shared,
            commands: commands_rx,
        },
    )
}

fn client() -> (Arc<CoreLn>, MockNode) {
    client_with(ClientConfig::default(), &[])
}

#[tokio::test]
async fn construction_is_lazy_and_first_call_connects() {
    let (client, mut node) = client();
    assert_eq!(client.state(), ClientState::Uninitialized);
    assert_eq!(node.opens(), 0);

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", Value::Null, None).await }
    });
    let (id, body) = node.next_command().await;
    assert_eq!(body["method"], "getinfo");
    assert_eq!(body["params"], json!({}));
    assert_eq!(body["rune"], RUNE);
    assert_eq!(body["id"], id);
    node.reply(id, json!({ "id": "02ab" })).await;

    assert_eq!(call.await.unwrap().expect("getinfo"), json!({ "id": "02ab" }));
    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(node.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_node_times_out_after_call_deadline() {
    let (client, mut node) = client();
    client.open().await.expect("open");

    let start = Instant::now();
    let err = client
        .call("listfunds", json!({}), Some(Duration::from_secs(5)))
        .await
        .expect_err("node never answers");
    let elapsed = start.elapsed();
    assert!(matches!(
        err,
        LnError::Timeout { ref method, after } if method == "listfunds" && after == Duration::from_secs(5)
    ));
    assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
    assert_eq!(client.pending_calls(), 0);

    // The late reply is dropped and the session keeps working.
    let (late_id, _) = node.next_command().await;
    node.reply(late_id, json!({ "outputs": [] })).await;
    let next = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", json!({}), None).await }
    });
    let (id, _) = node.next_command().await;
    assert_ne!(id, late_id);
    node.reply(id, json!({ "ok": true })).await;
    assert_eq!(next.await.unwrap().expect("getinfo"), json!({ "ok": true }));
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test(start_paused = true)]
async fn stalled_send_still_times_out_at_call_deadline() {
    let (client, mut node) = client();
    client.open().await.expect("open");
    node.stall_sends(true);

    let start = Instant::now();
    let err = client
        .call("listfunds", json!({}), Some(Duration::from_secs(5)))
        .await
        .expect_err("send never completes");
    assert!(matches!(
        err,
        LnError::Timeout { ref method, after } if method == "listfunds" && after == Duration::from_secs(5)
    ));
    assert!(start.elapsed() < Duration::from_secs(6), "{:?}", start.elapsed());
    assert_eq!(client.pending_calls(), 0);

    // The stalled send released the tunnel, so the next call goes through.
    node.stall_sends(false);
    let next = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", json!({}), None).await }
    });
    let (id, body) = node.next_command().await;
    assert_eq!(body["method"], "getinfo");
    node.reply(id, json!({ "ok": true })).await;
    assert_eq!(next.await.unwrap().expect("getinfo"), json!({ "ok": true }));
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn unbounded_timeout_is_accepted() {
    let (client, mut node) = client();
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", json!({}), Some(Duration::MAX)).await }
    });
    let (id, _) = node.next_command().await;
    node.reply(id, json!({ "alias": "n" })).await;
    assert_eq!(call.await.unwrap().expect("getinfo"), json!({ "alias": "n" }));
}

#[tokio::test]
async fn oversized_command_fails_alone() {
    let (client, mut node) = client();
    let pending = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", json!({}), None).await }
    });
    let (pending_id, _) = node.next_command().await;

    let huge = "x".repeat(70_000);
    assert!(matches!(
        client.call("signmessage", json!({ "message": huge }), None).await,
        Err(LnError::InvalidParams(_))
    ));
    // Short enough for the message check, too long once wrapped in a command.
    let almost = "x".repeat(cln_rs::backend::core_ln::MAX_SIGN_MESSAGE_LEN - 20);
    assert!(matches!(
        client.sign_message(&almost).await,
        Err(LnError::InvalidParams(_))
    ));

    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.pending_calls(), 1);
    node.reply(pending_id, json!("still here")).await;
    assert_eq!(pending.await.unwrap().expect("getinfo"), json!("still here"));
    assert_eq!(node.opens(), 1);
}

#[tokio::test]
async fn replies_in_reverse_order_reach_their_callers() {
    let (client, mut node) = client();
    let spawn_pay = |tag: &'static str| {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call("pay", json!({ "tag": tag }), None).await })
    };
    let a = spawn_pay("a");
    let b = spawn_pay("b");

    let mut ids = std::collections::HashMap::new();
    for _ in 0..2 {
        let (id, body) = node.next_command().await;
        ids.insert(body["params"]["tag"].as_str().unwrap().to_string(), id);
    }
    assert_ne!(ids["a"], ids["b"]);
    node.reply(ids["b"], json!("paid b")).await;
    node.reply(ids["a"], json!("paid a")).await;

    assert_eq!(a.await.unwrap().expect("a"), json!("paid a"));
    assert_eq!(b.await.unwrap().expect("b"), json!("paid b"));
}

#[tokio::test]
async fn dropped_session_rejects_outstanding_calls_then_reconnects() {
    let (client, mut node) = client();
    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call("listfunds", json!({ "n": i }), None).await })
        })
        .collect();
    for _ in 0..3 {
        node.next_command().await;
    }
    assert_eq!(client.pending_calls(), 3);

    node.drop_session();
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(LnError::ConnectionClosed)));
    }
    client
        .subscribe_state()
        .wait_for(|s| *s == ClientState::Degraded)
        .await
        .expect("state");
    assert_eq!(client.pending_calls(), 0);

    let retry = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("listfunds", json!({}), None).await }
    });
    let (id, _) = node.next_command().await;
    assert_eq!(node.opens(), 2);
    node.reply(id, json!({ "outputs": [], "channels": [] })).await;
    assert!(retry.await.unwrap().is_ok());
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn node_failures_map_to_typed_errors() {
    let (client, mut node) = client();

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.list_funds().await }
    });
    let (id, _) = node.next_command().await;
    node.fail(id, 0x4c51, "Invalid rune").await;
    assert!(matches!(call.await.unwrap(), Err(LnError::Authorization(_))));

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("listpeers", json!({}), None).await }
    });
    let (id, _) = node.next_command().await;
    node.fail(id, 19537, "Not authorized: method is listpeers").await;
    assert!(matches!(call.await.unwrap(), Err(LnError::Authorization(_))));

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .create_invoice(CreateInvoice {
                    amount_msat: Some(1_000),
                    description: "coffee".into(),
                    label: Some("order-1".into()),
                    expiry: None,
                })
                .await
        }
    });
    let (id, body) = node.next_command().await;
    assert_eq!(body["method"], "invoice");
    assert_eq!(body["params"]["expiry"], 900);
    node.fail(id, 900, "Duplicate label 'order-1'").await;
    assert!(matches!(
        call.await.unwrap(),
        Err(LnError::Node { code: 900, ref message }) if message.contains("order-1")
    ));

    // The session survives every one of these.
    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(node.opens(), 1);
}

#[tokio::test]
async fn typed_calls_decode_results() {
    let (client, mut node) = client();

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.list_funds().await }
    });
    let (id, body) = node.next_command().await;
    assert_eq!(body["method"], "listfunds");
    node.reply(
        id,
        json!({
            "outputs": [{
                "txid": "aa", "output": 1, "amount_msat": "5000msat",
                "status": "confirmed", "reserved": false
            }],
            "channels": [{
                "peer_id": "02cc", "connected": true, "state": "CHANNELD_NORMAL",
                "our_amount_msat": 70000, "amount_msat": 100000,
                "funding_txid": "bb", "funding_output": 0
            }]
        }),
    )
    .await;
    let funds = call.await.unwrap().expect("funds");
    assert_eq!(funds.outputs[0].amount_msat, Msat(5000));
    assert_eq!(funds.channels[0].our_amount_msat, Msat(70_000));

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.get_info().await }
    });
    let (id, _) = node.next_command().await;
    node.reply(id, json!({ "alias": "no id or version" })).await;
    assert!(matches!(call.await.unwrap(), Err(LnError::Decode(_))));
}

#[tokio::test]
async fn chunked_reply_is_reassembled() {
    let (client, mut node) = client();
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("listinvoices", json!({}), None).await }
    });
    let (id, _) = node.next_command().await;
    let body = serde_json::to_vec(&json!({ "id": id, "result": { "invoices": [] } })).unwrap();
    let (head, tail) = body.split_at(body.len() / 2);
    node.push(reply_frame(id, false, head)).await;
    node.push(reply_frame(id, true, tail)).await;
    assert_eq!(call.await.unwrap().expect("listinvoices"), json!({ "invoices": [] }));
}

#[tokio::test]
async fn stray_and_unknown_messages_are_ignored() {
    let (client, mut node) = client();
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", json!({}), None).await }
    });
    let (id, _) = node.next_command().await;
    node.reply(id.wrapping_add(1000), json!("not yours")).await;
    node.push(Message::Unknown { msg_type: 0x8001 }.encode()).await;
    node.reply(id, json!("yours")).await;
    assert_eq!(call.await.unwrap().expect("getinfo"), json!("yours"));
}

#[tokio::test]
async fn repeated_malformed_frames_end_the_session() {
    let (client, mut node) = client();
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("getinfo", json!({}), None).await }
    });
    node.next_command().await;
    for _ in 0..3 {
        node.push(vec![0x00]).await;
    }
    assert!(matches!(call.await.unwrap(), Err(LnError::ConnectionClosed)));
    client
        .subscribe_state()
        .wait_for(|s| *s == ClientState::Degraded)
        .await
        .expect("state");
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_close_the_client() {
    let config = ClientConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        },
        ..ClientConfig::default()
    };
    let (client, node) = client_with(config, &[OpenOutcome::Unreachable; 3]);

    let start = Instant::now();
    let err = client.list_funds().await.expect_err("unreachable");
    assert!(matches!(err, LnError::Connection(TransportError::Connection { .. })));
    assert!(err.is_retryable());
    assert_eq!(node.opens(), 3);
    // Backoff of 100ms then 200ms between the three attempts.
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(client.state(), ClientState::Closed);

    assert!(matches!(client.get_info().await, Err(LnError::ClientClosed)));
    assert_eq!(node.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried() {
    let (client, _node) = client_with(ClientConfig::default(), &[OpenOutcome::Unreachable]);
    client.open().await.expect("second attempt succeeds");
    assert_eq!(client.state(), ClientState::Ready);
}

#[tokio::test]
async fn refused_session_is_not_retried() {
    let (client, node) = client_with(ClientConfig::default(), &[OpenOutcome::Refuse]);
    assert!(matches!(client.open().await, Err(LnError::Authorization(_))));
    assert_eq!(node.opens(), 1);
    assert_eq!(client.state(), ClientState::Closed);
    assert!(matches!(client.open().await, Err(LnError::ClientClosed)));
}

#[tokio::test]
async fn close_rejects_outstanding_and_future_calls() {
    let (client, mut node) = client();
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.call("waitanyinvoice", json!({}), None).await }
    });
    node.next_command().await;

    client.close().await;
    assert!(matches!(call.await.unwrap(), Err(LnError::ConnectionClosed)));
    assert_eq!(client.state(), ClientState::Closed);
    assert!(matches!(client.list_pays().await, Err(LnError::ClientClosed)));
    assert_eq!(node.opens(), 1);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_connecting() {
    let (client, node) = client();
    assert!(matches!(client.sign_message("").await, Err(LnError::InvalidParams(_))));
    let too_long = "x".repeat(65_536);
    assert!(matches!(
        client.sign_message(&too_long).await,
        Err(LnError::InvalidParams(_))
    ));
    assert!(matches!(client.decode("  ").await, Err(LnError::InvalidParams(_))));
    assert!(matches!(client.wait_invoice("").await, Err(LnError::InvalidParams(_))));
    assert!(matches!(
        client.call("", json!({}), None).await,
        Err(LnError::InvalidParams(_))
    ));
    assert_eq!(node.opens(), 0);
    assert_eq!(client.state(), ClientState::Uninitialized);
}

#[tokio::test]
async fn factory_builds_lazily_or_fails_fast() {
    let auth = Auth::new(NODE, RUNE, "s1");
    assert!(matches!(
        init_backend("eclair", auth.clone()).err(),
        Some(LnError::UnsupportedBackend(id)) if id == "eclair"
    ));
    let api = init_backend("core_lightning", auth).expect("registered");
    assert_eq!(api.state(), ClientState::Uninitialized);
}
