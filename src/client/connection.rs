//! Client Connection
//!
//! Owns the WebSocket to the server and demultiplexes traffic: response
//! frames resolve the pending request they answer, event frames fan out
//! to subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::server::events::{
    MaterializationComplete, MaterializationError, MaterializationProgress,
};
use crate::server::protocol::{decode_frame, encode_frame, Frame};

use super::ClientError;

/// Capacity of the event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Typed server events as seen by the client.
#[derive(Debug, Clone)]
pub enum ViewerEvent {
    MaterializationProgress(MaterializationProgress),
    MaterializationComplete(MaterializationComplete),
    MaterializationError(MaterializationError),
}

impl ViewerEvent {
    /// Parse a wire event by name. Unknown events are dropped so a
    /// newer server does not break an older client.
    pub fn parse(event: &str, data: Value) -> Option<Self> {
        match event {
            "materializationProgress" => serde_json::from_value(data)
                .ok()
                .map(ViewerEvent::MaterializationProgress),
            "materializationComplete" => serde_json::from_value(data)
                .ok()
                .map(ViewerEvent::MaterializationComplete),
            "materializationError" => serde_json::from_value(data)
                .ok()
                .map(ViewerEvent::MaterializationError),
            _ => None,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            ViewerEvent::MaterializationProgress(e) => &e.document_id,
            ViewerEvent::MaterializationComplete(e) => &e.document_id,
            ViewerEvent::MaterializationError(e) => &e.document_id,
        }
    }
}

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<Value, ClientError>>>>;

/// One WebSocket connection to the query server.
pub struct ServerConnection {
    out_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<ViewerEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ServerConnection {
    /// Connect to the server's loopback port.
    pub async fn connect(port: u16) -> Result<Self, ClientError> {
        let url = format!("ws://127.0.0.1:{port}/");
        debug!("Connecting to query server at {}", url);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(DashMap::new());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let reader_pending = pending.clone();
        let reader_events = events_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match decode_frame(text.as_str()) {
                    Ok(Frame::Response {
                        request_id,
                        result,
                        error,
                    }) => {
                        let Some(id) = request_id.as_u64() else {
                            debug!("Response with unknown request id: {}", request_id);
                            continue;
                        };
                        if let Some((_, respond_to)) = reader_pending.remove(&id) {
                            let outcome = match error {
                                Some(e) => Err(ClientError::Rpc {
                                    code: e.code,
                                    message: e.message,
                                }),
                                None => Ok(result.unwrap_or(Value::Null)),
                            };
                            let _ = respond_to.send(outcome);
                        }
                    }
                    Ok(Frame::Event { event, data }) => {
                        if let Some(parsed) = ViewerEvent::parse(&event, data) {
                            let _ = reader_events.send(parsed);
                        }
                    }
                    Ok(Frame::Request { .. }) => {
                        debug!("Ignoring request frame from server");
                    }
                    Err(e) => {
                        debug!("Failed to decode frame: {}", e);
                    }
                }
            }
            // Fail whatever is still waiting; the socket is gone.
            let stranded: Vec<u64> = reader_pending.iter().map(|e| *e.key()).collect();
            for id in stranded {
                if let Some((_, respond_to)) = reader_pending.remove(&id) {
                    let _ = respond_to.send(Err(ClientError::ConnectionClosed));
                }
            }
        });

        Ok(Self {
            out_tx,
            pending,
            next_id: AtomicU64::new(1),
            events_tx,
            reader,
            writer,
        })
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (respond_to, response) = oneshot::channel();
        self.pending.insert(id, respond_to);

        let frame = Frame::Request {
            request_id: json!(id),
            method: method.to_string(),
            params,
        };
        if self.out_tx.send(encode_frame(&frame)).is_err() {
            self.pending.remove(&id);
            return Err(ClientError::ConnectionClosed);
        }
        response
            .await
            .map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Subscribe to events arriving on this connection.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ViewerEvent> {
        self.events_tx.subscribe()
    }

    /// Tear the connection down.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_known_events() {
        let event = ViewerEvent::parse(
            "materializationProgress",
            json!({
                "documentId": "d1",
                "symbolName": "x",
                "percentage": 50.0,
                "rowsProcessed": 3,
                "totalRows": 6
            }),
        )
        .unwrap();
        match event {
            ViewerEvent::MaterializationProgress(p) => {
                assert_eq!(p.document_id, "d1");
                assert_eq!(p.rows_processed, 3);
            }
            _ => panic!("wrong event variant"),
        }
    }

    #[test]
    fn unknown_events_are_dropped() {
        assert!(ViewerEvent::parse("somethingNew", json!({})).is_none());
    }

    #[test]
    fn malformed_event_payloads_are_dropped() {
        assert!(ViewerEvent::parse("materializationComplete", json!({"nope": 1})).is_none());
    }
}
