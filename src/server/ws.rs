//! WebSocket RPC Layer
//!
//! Accepts loopback connections and speaks single-JSON-object frames.
//! Each connection reads requests sequentially and awaits the
//! dispatcher before reading the next frame, so responses keep arrival
//! order per connection; events are written through a separate outbound
//! channel that background workers feed at any time.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::handler::{Dispatcher, ServerState};
use super::protocol::{decode_frame, encode_frame, ErrorCode, Frame, RpcError};

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    server: Arc<ServerState>,
}

/// The WebSocket RPC server.
pub struct RpcServer {
    app_state: AppState,
}

impl RpcServer {
    pub fn new(dispatcher: Dispatcher, server: Arc<ServerState>) -> Self {
        Self {
            app_state: AppState { dispatcher, server },
        }
    }

    /// Serve connections on an already-bound loopback listener until
    /// the shutdown signal fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(self.app_state)
            .layer(TraceLayer::new_for_http());

        info!(
            "RPC server listening on ws://{}",
            listener.local_addr().context("listener has no address")?
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("RPC server shutting down");
            })
            .await
            .context("RPC server error")?;
        Ok(())
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, app))
}

async fn handle_connection(socket: WebSocket, app: AppState) {
    debug!("Client connected");
    app.server.metrics.record_connection_opened();
    let (mut sink, mut stream) = socket.split();

    // Responses and events share one outbound channel per connection;
    // the writer task is the only place that touches the sink.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

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
            // Pings are answered by the protocol layer.
            _ => continue,
        };

        let frame = match decode_frame(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to decode frame: {}", e);
                let response = Frame::response_err(
                    Value::Null,
                    RpcError {
                        code: ErrorCode::InvalidInput,
                        message: format!("Failed to decode request frame: {e}"),
                    },
                );
                if out_tx.send(encode_frame(&response)).is_err() {
                    break;
                }
                continue;
            }
        };

        let Frame::Request {
            request_id,
            method,
            params,
        } = frame
        else {
            let response = Frame::response_err(
                Value::Null,
                RpcError {
                    code: ErrorCode::InvalidInput,
                    message: "Expected a request frame".to_string(),
                },
            );
            if out_tx.send(encode_frame(&response)).is_err() {
                break;
            }
            continue;
        };

        // Route subsequent events for this document to this connection.
        if let Some(document_id) = params.get("documentId").and_then(|v| v.as_str()) {
            app.server.router.bind(document_id, out_tx.clone());
        }

        let response = match app.dispatcher.dispatch(method, params).await {
            Ok(result) => Frame::response_ok(request_id, result),
            Err(error) => Frame::response_err(request_id, error),
        };
        if out_tx.send(encode_frame(&response)).is_err() {
            break;
        }
    }

    // Stop the writer; event bindings that still point here fail their
    // sends and get dropped by the router.
    writer.abort();
    app.server.metrics.record_connection_closed();
    debug!("Client disconnected");
}
