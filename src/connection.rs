//! DevTools WebSocket connection handling
//!
//! Unlike a request/response client, the session driver needs every decoded
//! message — replies *and* asynchronous events — to reach a single place so
//! the page-visit poller can be the sole mutator of visit state (see
//! `DESIGN.md`, "reader worker vs visit fields"). So `Connection` does not
//! correlate replies itself: it forwards everything to an `mpsc` channel and
//! lets the caller route it.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::{Error, Result};

/// A decoded DevTools message, forwarded verbatim from the reader task.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// `{id, result}` or `{id, error}`.
    Reply {
        id: u32,
        result: Option<Value>,
        error: Option<String>,
    },
    /// `{method, params}`.
    Event { method: String, params: Value },
}

/// A live DevTools connection's send half plus command-id allocator.
///
/// Cheap to clone-by-reference (callers hold it behind `Arc`); the actual
/// socket write half lives in a dedicated writer task reached through an
/// unbounded channel, so `send` never blocks on network I/O.
pub struct Connection {
    write_tx: mpsc::UnboundedSender<Message>,
    next_id: Arc<AtomicU32>,
    ws_url: String,
}

impl Connection {
    /// Opens a WebSocket to `ws_url` and spawns the reader/writer tasks.
    /// `next_id` is owned by the [`crate::SessionDriver`], not this
    /// connection, since command ids are required to keep increasing across
    /// the reconnects a driver does between visits (§3: "per Driver").
    /// Returns the `Connection` plus the channel of every message the
    /// reader decodes, in arrival order.
    pub async fn connect(ws_url: &str, next_id: Arc<AtomicU32>) -> Result<(Self, mpsc::UnboundedReceiver<Incoming>)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| Error::WebSocket(format!("failed to connect to {}: {}", ws_url, e)))?;
        Ok(Self::from_stream(ws_url.to_string(), ws_stream, next_id))
    }

    /// Wraps an already-established `WebSocketStream` generic over its
    /// underlying transport. Production code reaches this only via
    /// [`Connection::connect`] (`T = MaybeTlsStream<TcpStream>`); tests
    /// reach it directly with `T = tokio::io::DuplexStream`, giving a fake
    /// transport that speaks real WebSocket framing without a real browser.
    pub fn from_stream<T>(
        ws_url: String,
        ws_stream: WebSocketStream<T>,
        next_id: Arc<AtomicU32>,
    ) -> (Self, mpsc::UnboundedReceiver<Incoming>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, mut read) = ws_stream.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Incoming>();

        tokio::spawn(async move {
            while let Some(msg) = write_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::warn!(error = %e, "devtools websocket write failed, closing writer task");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_url = ws_url.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            let incoming = if let Some(method) = value.get("method").and_then(Value::as_str) {
                                Incoming::Event {
                                    method: method.to_string(),
                                    params: value.get("params").cloned().unwrap_or(Value::Null),
                                }
                            } else if let Some(id) = value.get("id").and_then(Value::as_u64) {
                                Incoming::Reply {
                                    id: id as u32,
                                    result: value.get("result").cloned(),
                                    error: value
                                        .get("error")
                                        .and_then(|e| e.get("message"))
                                        .and_then(Value::as_str)
                                        .map(str::to_string),
                                }
                            } else {
                                tracing::debug!(%text, "devtools message with neither id nor method, dropping");
                                continue;
                            };
                            if incoming_tx.send(incoming).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, %text, "failed to decode devtools message");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::debug!(ws_url = %reader_url, "devtools websocket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(ws_url = %reader_url, error = %e, "devtools websocket read error");
                        break;
                    }
                }
            }
            // Dropping incoming_tx here signals the poller the transport is gone.
        });

        (
            Self {
                write_tx,
                next_id,
                ws_url,
            },
            incoming_rx,
        )
    }

    /// Allocates the next command id, serializes `{id, method, params}`,
    /// and sends it. Returns the allocated id.
    pub fn send(&self, method: &str, params: Value) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({ "id": id, "method": method, "params": params });
        tracing::debug!(%id, %method, "sending devtools command");
        self.write_tx
            .send(Message::Text(msg.to_string().into()))
            .map_err(|_| Error::BrowsingException(format!("devtools websocket closed: {}", self.ws_url)))?;
        Ok(id)
    }

    /// Requests a graceful close of the underlying socket. Best-effort: a
    /// closed writer task (transport already dead) is not an error here,
    /// since teardown must proceed regardless.
    pub fn close(&self) {
        let _ = self.write_tx.send(Message::Close(None));
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::{client_async, tungstenite::Message as WsMessage};

    /// Builds an in-memory pair of `Connection` (client side) and a raw
    /// `WebSocketStream` (server side) a test can drive like a fake chrome.
    async fn fake_pair() -> (Connection, mpsc::UnboundedReceiver<Incoming>, WebSocketStream<tokio::io::DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            tokio_tungstenite::accept_async(server_io).await.unwrap()
        });
        let (client_ws, _) = client_async("ws://localhost/devtools/fake", client_io).await.unwrap();
        let server_ws = server.await.unwrap();
        let (conn, rx) = Connection::from_stream(
            "ws://localhost/devtools/fake".to_string(),
            client_ws,
            Arc::new(AtomicU32::new(1)),
        );
        (conn, rx, server_ws)
    }

    #[tokio::test]
    async fn send_allocates_strictly_increasing_ids() {
        let (conn, _rx, mut server) = fake_pair().await;
        let id1 = conn.send("Network.enable", json!({})).unwrap();
        let id2 = conn.send("Page.enable", json!({})).unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);

        let msg1 = server.next().await.unwrap().unwrap();
        let msg2 = server.next().await.unwrap().unwrap();
        let v1: Value = serde_json::from_str(msg1.to_text().unwrap()).unwrap();
        let v2: Value = serde_json::from_str(msg2.to_text().unwrap()).unwrap();
        assert_eq!(v1["id"], 1);
        assert_eq!(v1["method"], "Network.enable");
        assert_eq!(v2["id"], 2);
    }

    #[tokio::test]
    async fn reply_is_routed_as_incoming_reply() {
        let (conn, mut rx, mut server) = fake_pair().await;
        let id = conn.send("Page.captureScreenshot", json!({})).unwrap();
        server.next().await.unwrap().unwrap();
        server
            .send(WsMessage::Text(json!({"id": id, "result": {"data": "UE5H"}}).to_string().into()))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Incoming::Reply { id: got_id, result, error } => {
                assert_eq!(got_id, id);
                assert_eq!(result.unwrap()["data"], "UE5H");
                assert!(error.is_none());
            }
            other => panic!("expected Reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn event_is_routed_as_incoming_event() {
        let (_conn, mut rx, mut server) = fake_pair().await;
        server
            .send(WsMessage::Text(
                json!({"method": "Page.loadEventFired", "params": {"timestamp": 1.0}})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Incoming::Event { method, .. } => assert_eq!(method, "Page.loadEventFired"),
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_close_ends_incoming_stream() {
        let (_conn, mut rx, mut server) = fake_pair().await;
        server.close(None).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
