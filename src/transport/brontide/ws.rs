use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("websocket closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("relay connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Build the relay URL that proxies to `host_port`: `{relay}/{host}:{port}`, with `wss://`
/// assumed when the relay has no scheme.
#[must_use]
pub fn relay_url(relay: &str, host_port: &str) -> String {
    let relay = relay.trim_end_matches('/');
    if relay.starts_with("ws://") || relay.starts_with("wss://") {
        format!("{relay}/{host_port}")
    } else {
        format!("wss://{relay}/{host_port}")
    }
}

/// Write half of the relay websocket. Everything is sent as binary frames.
pub struct RelaySend {
    sink: SplitSink<WsStream, Message>,
}

/// Read half of the relay websocket.
pub struct RelayRecv {
    stream: SplitStream<WsStream>,
}

/// Open the relay websocket and split it.
///
/// # Errors
/// Returns [`WsError::Timeout`] when the connect exceeds `connect_timeout`, and
/// [`WsError::Transport`] for DNS, TLS or upgrade failures.
pub async fn connect_relay(
    url: &str,
    connect_timeout: Duration,
) -> Result<(RelaySend, RelayRecv), WsError> {
    debug!(target: "cln_rs::relay", %url, "connecting");
    let (ws, _) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| WsError::Timeout(connect_timeout))?
        .map_err(|e| WsError::Transport(e.to_string()))?;
    debug!(target: "cln_rs::relay", "connected");
    let (sink, stream) = ws.split();
    Ok((RelaySend { sink }, RelayRecv { stream }))
}

impl RelaySend {
    /// Send raw bytes to the node.
    ///
    /// # Errors
    /// Returns a [`WsError`] when the websocket write fails.
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<(), WsError> {
        trace!(target: "cln_rs::relay", bytes = payload.len(), "send");
        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(|e| WsError::Transport(e.to_string()))
    }

    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

impl RelayRecv {
    /// Receive the next chunk of raw bytes from the node. Chunk boundaries carry no meaning.
    ///
    /// # Errors
    /// Returns [`WsError::Closed`] when the relay closes the socket.
    pub async fn recv(&mut self) -> Result<Vec<u8>, WsError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    trace!(target: "cln_rs::relay", bytes = data.len(), "recv");
                    return Ok(data);
                }
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(target: "cln_rs::relay", ?frame, "relay closed socket");
                    return Err(WsError::Closed);
                }
                None => return Err(WsError::Closed),
                Some(Err(err)) => {
                    debug!(target: "cln_rs::relay", error = %err, "socket error");
                    return Err(WsError::Transport(err.to_string()));
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
            }
        }
    }
}
