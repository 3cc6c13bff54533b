//! Ledger node connection manager
//!
//! Maintains a persistent WebSocket connection to the lifecycle ledger node.
//! Handles reconnection and provides a thread-safe interface for sending
//! requests. Responses are matched to requests by envelope id, so the node
//! may answer out of order.

use futures_util::{SinkExt, StreamExt};
use rmpv::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
};
use tracing::{debug, error, info, warn};

use crate::types::{Result, TraceError};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Ledger connection manager
pub struct LedgerConnection {
    /// Channel for sending messages to the ledger node
    tx: mpsc::Sender<(u64, Vec<u8>, oneshot::Sender<Vec<u8>>)>,
    /// Whether the connection is alive
    connected: Arc<RwLock<bool>>,
}

impl LedgerConnection {
    /// Create a new ledger connection
    pub async fn connect(ledger_url: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<(u64, Vec<u8>, oneshot::Sender<Vec<u8>>)>(1000);
        let connected = Arc::new(RwLock::new(false));

        let conn = Self {
            tx,
            connected: Arc::clone(&connected),
        };

        // Start the connection manager task
        let url = ledger_url.to_string();
        let connected_flag = Arc::clone(&connected);
        tokio::spawn(async move {
            connection_loop(url, rx, connected_flag).await;
        });

        // Wait for initial connection
        for _ in 0..50 {
            if *conn.connected.read().await {
                return Ok(conn);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(TraceError::LedgerUnavailable(
            "Timeout waiting for ledger connection".into(),
        ))
    }

    /// Send a request to the ledger node and wait for the response carrying
    /// the same envelope id. Exceeding the deadline is a typed timeout,
    /// distinct from a semantic rejection carried inside a response.
    pub async fn request(&self, id: u64, data: Vec<u8>, timeout_ms: u64) -> Result<Vec<u8>> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send((id, data, response_tx))
            .await
            .map_err(|_| TraceError::LedgerUnavailable("Ledger connection closed".into()))?;

        match timeout(Duration::from_millis(timeout_ms), response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TraceError::LedgerUnavailable(
                "Response channel closed".into(),
            )),
            Err(_) => Err(TraceError::Timeout("Ledger request timed out".into())),
        }
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }
}

/// In-flight requests keyed by envelope id
#[derive(Default)]
struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>,
}

impl PendingRequests {
    async fn insert(&self, id: u64, tx: oneshot::Sender<Vec<u8>>) {
        self.inner.lock().await.insert(id, tx);
    }

    async fn forget(&self, id: u64) {
        self.inner.lock().await.remove(&id);
    }

    /// Route a response to its waiting request; false when the id is unknown
    async fn complete(&self, id: u64, data: Vec<u8>) -> bool {
        match self.inner.lock().await.remove(&id) {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    ledger_url: String,
    mut rx: mpsc::Receiver<(u64, Vec<u8>, oneshot::Sender<Vec<u8>>)>,
    connected: Arc<RwLock<bool>>,
) {
    let mut reconnect_delay = Duration::from_millis(100);
    let max_reconnect_delay = Duration::from_secs(30);

    loop {
        info!("Connecting to ledger node at {}", ledger_url);

        match connect_to_ledger(&ledger_url).await {
            Ok((ws_sink, ws_stream)) => {
                *connected.write().await = true;
                reconnect_delay = Duration::from_millis(100);
                info!("Connected to ledger node");

                if let Err(e) = handle_messages(ws_sink, ws_stream, &mut rx).await {
                    error!("Ledger connection error: {}", e);
                }

                *connected.write().await = false;
            }
            Err(e) => {
                error!("Failed to connect to ledger node: {}", e);
            }
        }

        warn!("Reconnecting to ledger node in {:?}...", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
    }
}

/// Connect to the ledger node with proper headers
async fn connect_to_ledger(url: &str) -> Result<(WsSink, WsStream)> {
    let request = Request::builder()
        .uri(url)
        .header("Host", url.split("//").last().unwrap_or("localhost"))
        .header("Origin", "http://localhost")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| TraceError::LedgerUnavailable(format!("Failed to build request: {}", e)))?;

    let (ws, _) = connect_async_with_config(request, None, false)
        .await
        .map_err(|e| TraceError::LedgerUnavailable(format!("WebSocket connect failed: {}", e)))?;

    Ok(ws.split())
}

/// Handle messages between the request channel and the ledger WebSocket
async fn handle_messages(
    ws_sink: WsSink,
    mut ws_stream: WsStream,
    rx: &mut mpsc::Receiver<(u64, Vec<u8>, oneshot::Sender<Vec<u8>>)>,
) -> Result<()> {
    let pending = Arc::new(PendingRequests::default());
    let pending_for_send = Arc::clone(&pending);

    let ws_sink = Arc::new(Mutex::new(ws_sink));
    let ws_sink_for_rx = Arc::clone(&ws_sink);

    // Task to handle outgoing requests
    let request_handler = async {
        while let Some((id, data, response_tx)) = rx.recv().await {
            pending_for_send.insert(id, response_tx).await;

            let mut sink = ws_sink_for_rx.lock().await;
            if let Err(e) = sink.send(Message::Binary(data)).await {
                error!("Failed to send to ledger node: {}", e);
                pending_for_send.forget(id).await;
                break;
            }
        }
    };

    // Task to handle responses from the ledger node
    let response_handler = async {
        while let Some(msg) = ws_stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => match envelope_id(&data) {
                    Some(id) => {
                        if !pending.complete(id, data).await {
                            warn!(id, "Received ledger response with no pending request");
                        }
                    }
                    None => warn!("Received ledger response without an id"),
                },
                Ok(Message::Ping(data)) => {
                    let mut sink = ws_sink.lock().await;
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(frame)) => {
                    info!("Ledger node closed connection: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("Ledger WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = request_handler => {
            debug!("Request handler ended");
        }
        _ = response_handler => {
            debug!("Response handler ended");
        }
    }

    Ok(())
}

/// Pull the correlation id out of a response envelope
fn envelope_id(data: &[u8]) -> Option<u64> {
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    let Value::Map(map) = value else {
        return None;
    };
    map.iter().find_map(|(k, v)| match (k, v) {
        (Value::String(key), Value::Integer(id)) if key.as_str() == Some("id") => id.as_u64(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: u64) -> Vec<u8> {
        let value = Value::Map(vec![
            (Value::String("id".into()), Value::Integer(id.into())),
            (
                Value::String("type".into()),
                Value::String("response".into()),
            ),
            (Value::String("data".into()), Value::Binary(vec![1, 2, 3])),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        buf
    }

    #[test]
    fn test_envelope_id_extraction() {
        assert_eq!(envelope_id(&envelope(42)), Some(42));
        assert_eq!(envelope_id(b"not msgpack"), None);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_route_by_id() {
        let pending = PendingRequests::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.insert(1, tx1).await;
        pending.insert(2, tx2).await;

        assert!(pending.complete(2, b"two".to_vec()).await);
        assert!(pending.complete(1, b"one".to_vec()).await);
        assert!(!pending.complete(3, b"stray".to_vec()).await);

        assert_eq!(rx1.await.unwrap(), b"one");
        assert_eq!(rx2.await.unwrap(), b"two");
    }
}
