//! Drives [`RelayTunnel`] and [`CoreLn`] against an in-process websocket "relay" whose far
//! end is a fake node speaking BOLT-8 as the responder.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use cln_rs::{
    backend::LnApi,
    transport::{
        brontide::{
            crypto::{compressed, public_from_secret},
            noise_conn::{perform_handshake, reader_loop, writer_loop},
            noise_machine::{BrontideMachine, BrontideMachineConfig},
            wire::Message,
        },
        RelayTunnel, TransportError, Tunnel, TunnelState,
    },
    Auth, ClientConfig, ClientState, CoreLn, LnError,
};
use futures_util::{SinkExt, StreamExt};
use k256::SecretKey;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

const NODE_FEATURES: [u8; 2] = [0x08, 0x00];
const NODE_GLOBAL_FEATURES: [u8; 1] = [0x02];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    RefuseInit,
}

#[derive(Debug, Default)]
struct Report {
    client_features: Option<Bytes>,
    pong_bytes: Option<u16>,
    commands: Vec<Value>,
    handshake_failed: bool,
}

fn node_key() -> SecretKey {
    SecretKey::from_slice(&[0x21; 32]).expect("node key")
}

fn node_id_hex(key: &SecretKey) -> String {
    hex::encode(compressed(&public_from_secret(key)))
}

/// Accept one websocket connection and play a Core Lightning node on it.
async fn spawn_node(mode: Mode) -> (String, oneshot::Receiver<Report>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let relay = format!("ws://{}", listener.local_addr().expect("addr"));
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let ws = accept_async(tcp).await.expect("websocket upgrade");
        let report = serve(ws, mode).await;
        let _ = done_tx.send(report);
    });
    (relay, done_rx)
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mode: Mode,
) -> Report {
    let mut report = Report::default();
    let (mut sink, mut stream) = ws.split();
    let (raw_in_tx, raw_in_rx) = mpsc::channel(64);
    let (raw_out_tx, mut raw_out_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            if let WsMessage::Binary(data) = msg {
                if raw_in_tx.send(data).await.is_err() {
                    break;
                }
            }
        }
    });
    let socket_writer = tokio::spawn(async move {
        while let Some(chunk) = raw_out_rx.recv().await {
            if sink.send(WsMessage::Binary(chunk)).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let machine = BrontideMachine::new(BrontideMachineConfig {
        initiator: false,
        local_static: Arc::new(node_key()),
        remote_static: None,
        ephemeral: None,
    })
    .expect("responder");
    let (machine, raw_in_rx, leftover) =
        match perform_handshake(machine, raw_in_rx, raw_out_tx.clone()).await {
            Ok(parts) => parts,
            Err(_) => {
                report.handshake_failed = true;
                drop(raw_out_tx);
                let _ = socket_writer.await;
                return report;
            }
        };

    let (sealer, opener) = machine.into_split().expect("split");
    let (to_client, plain_out_rx) = mpsc::channel(64);
    let (plain_in_tx, mut from_client) = mpsc::channel(64);
    tokio::spawn(writer_loop(sealer, plain_out_rx, raw_out_tx));
    tokio::spawn(reader_loop(opener, raw_in_rx, leftover, plain_in_tx));

    if mode == Mode::RefuseInit {
        let error = Message::Error {
            channel_id: [0; 32],
            data: Bytes::from_static(b"rune required"),
        };
        to_client.send(error.encode()).await.expect("send error");
        // Give the writer a moment before tearing down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        return report;
    }

    let init = Message::Init {
        global_features: Bytes::from_static(&NODE_GLOBAL_FEATURES),
        features: Bytes::from_static(&NODE_FEATURES),
    };
    to_client.send(init.encode()).await.expect("send init");
    match Message::decode(&from_client.recv().await.expect("client init")) {
        Ok(Message::Init { features, .. }) => report.client_features = Some(features),
        other => panic!("expected init, got {other:?}"),
    }
    let ping = Message::Ping {
        num_pong_bytes: 4,
        ignored_len: 2,
    };
    to_client.send(ping.encode()).await.expect("send ping");

    while let Some(raw) = from_client.recv().await {
        match Message::decode(&raw).expect("client message") {
            Message::Pong { ignored_len } => report.pong_bytes = Some(ignored_len),
            Message::CommandoCmd { req_id, json } => {
                let body: Value = serde_json::from_slice(&json).expect("command json");
                let result = match body["method"].as_str() {
                    Some("getinfo") => json!({
                        "id": node_id_hex(&node_key()),
                        "alias": "fakenode",
                        "color": "021e2e",
                        "num_peers": 1,
                        "version": "v24.02",
                        "blockheight": 830000,
                        "network": "regtest",
                        "address": []
                    }),
                    _ => json!({ "echo": body["params"].clone() }),
                };
                report.commands.push(body);
                let reply = serde_json::to_vec(&json!({
                    "jsonrpc": "2.0",
                    "id": req_id,
                    "result": result,
                }))
                .expect("reply json");
                let (head, tail) = reply.split_at(reply.len() / 2);
                for (chunk, terminal) in [(head, false), (tail, true)] {
                    let frame = Message::CommandoReply {
                        req_id,
                        terminal,
                        chunk: Bytes::copy_from_slice(chunk),
                    };
                    if to_client.send(frame.encode()).await.is_err() {
                        return report;
                    }
                }
            }
            _ => {}
        }
    }
    report
}

fn config(relay: &str) -> ClientConfig {
    ClientConfig {
        relay: relay.to_string(),
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

fn auth_for(node_id: &str) -> Auth {
    Auth::new(format!("{node_id}@127.0.0.1:9735"), "rune-token", "client secret")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tunnel_completes_handshake_and_carries_commands() {
    let (relay, report) = spawn_node(Mode::Serve).await;
    let mut tunnel = RelayTunnel::new(&config(&relay));
    tunnel
        .open(&auth_for(&node_id_hex(&node_key())))
        .await
        .expect("open");
    assert_eq!(tunnel.state(), TunnelState::Ready);
    let mut inbound = tunnel.take_inbound().expect("inbound");
    assert!(tunnel.take_inbound().is_none());

    let cmd = Message::CommandoCmd {
        req_id: 7,
        json: Bytes::from_static(br#"{"method":"listfunds","params":{"x":1},"id":7}"#),
    };
    tunnel.send(cmd.encode()).await.expect("send");

    // The ping never reaches the consumer; only the two reply chunks do.
    let mut body = Vec::new();
    loop {
        let raw = timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("reply in time")
            .expect("stream open");
        match Message::decode(&raw).expect("decode") {
            Message::CommandoReply {
                req_id,
                terminal,
                chunk,
            } => {
                assert_eq!(req_id, 7);
                body.extend_from_slice(&chunk);
                if terminal {
                    break;
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["result"]["echo"], json!({ "x": 1 }));

    tunnel.close().await;
    assert_eq!(tunnel.state(), TunnelState::Disconnected);
    let report = timeout(Duration::from_secs(5), report)
        .await
        .expect("node finished")
        .expect("report");
    assert_eq!(report.client_features.as_deref(), Some(&[0x08, 0x02][..]));
    assert_eq!(report.pong_bytes, Some(4));
    assert_eq!(report.commands.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_calls_node_over_relay() {
    let (relay, report) = spawn_node(Mode::Serve).await;
    let client = CoreLn::new(
        Arc::new(auth_for(&node_id_hex(&node_key()))),
        config(&relay),
    );

    let info = client.get_info().await.expect("getinfo");
    assert_eq!(info.alias, "fakenode");
    assert_eq!(info.blockheight, 830_000);
    assert_eq!(info.id, node_id_hex(&node_key()));
    let echoed = client
        .call("listpeers", json!({ "id": "02ab" }), None)
        .await
        .expect("listpeers");
    assert_eq!(echoed, json!({ "echo": { "id": "02ab" } }));
    assert_eq!(client.state(), ClientState::Ready);

    client.close().await;
    let report = timeout(Duration::from_secs(5), report)
        .await
        .expect("node finished")
        .expect("report");
    assert_eq!(report.commands.len(), 2);
    assert_eq!(report.commands[0]["rune"], "rune-token");
    assert!(report.commands[0]["id"].is_u64());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_node_id_is_a_connection_error() {
    let (relay, report) = spawn_node(Mode::Serve).await;
    let impostor = SecretKey::from_slice(&[0x42; 32]).expect("key");
    let mut tunnel = RelayTunnel::new(&config(&relay));
    let err = tunnel
        .open(&auth_for(&node_id_hex(&impostor)))
        .await
        .expect_err("node cannot decrypt act one");
    assert!(matches!(err, TransportError::Connection { .. }), "{err}");
    assert_eq!(tunnel.state(), TunnelState::Disconnected);
    let report = timeout(Duration::from_secs(5), report)
        .await
        .expect("node finished")
        .expect("report");
    assert!(report.handshake_failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_error_during_init_is_an_authorization_failure() {
    let (relay, _report) = spawn_node(Mode::RefuseInit).await;
    let mut tunnel = RelayTunnel::new(&config(&relay));
    let err = tunnel
        .open(&auth_for(&node_id_hex(&node_key())))
        .await
        .expect_err("node refuses");
    assert!(
        matches!(err, TransportError::Authorization(ref text) if text.contains("rune required")),
        "{err}"
    );
    assert_eq!(tunnel.state(), TunnelState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_session_closes_the_client() {
    let (relay, _report) = spawn_node(Mode::RefuseInit).await;
    let client = CoreLn::new(
        Arc::new(auth_for(&node_id_hex(&node_key()))),
        config(&relay),
    );
    assert!(matches!(client.open().await, Err(LnError::Authorization(_))));
    assert_eq!(client.state(), ClientState::Closed);
}
