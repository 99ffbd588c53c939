//! Server → client event types and routing.
//!
//! Events for a document are delivered through the connection that most
//! recently referenced that document id. The binding is a back
//! reference, not ownership: a closed connection leaves its bindings in
//! place until another connection rebinds them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::DocumentId;

use super::protocol::{encode_frame, Frame};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationProgress {
    pub document_id: String,
    pub symbol_name: String,
    pub percentage: f64,
    pub rows_processed: u64,
    pub total_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationComplete {
    pub document_id: String,
    pub symbol_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub total_row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationError {
    pub document_id: String,
    pub symbol_name: String,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Asynchronous notifications pushed to the client that owns a document.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Progress(MaterializationProgress),
    Complete(MaterializationComplete),
    Error(MaterializationError),
}

impl ServerEvent {
    /// The `event` field on the wire frame.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::Progress(_) => "materializationProgress",
            ServerEvent::Complete(_) => "materializationComplete",
            ServerEvent::Error(_) => "materializationError",
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            ServerEvent::Progress(e) => &e.document_id,
            ServerEvent::Complete(e) => &e.document_id,
            ServerEvent::Error(e) => &e.document_id,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let data = match self {
            ServerEvent::Progress(e) => serde_json::to_value(e),
            ServerEvent::Complete(e) => serde_json::to_value(e),
            ServerEvent::Error(e) => serde_json::to_value(e),
        }
        .unwrap_or(serde_json::Value::Null);
        Frame::Event {
            event: self.event_name().to_string(),
            data,
        }
    }
}

/// Outbound channel of one WebSocket connection; carries encoded frames.
pub type EventSender = mpsc::UnboundedSender<String>;

/// Routes events to the connection that last referenced each document.
#[derive(Default)]
pub struct EventRouter {
    bindings: DashMap<DocumentId, EventSender>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a document to a connection. A later request from another
    /// connection rebinds; the last one wins.
    pub fn bind(&self, document_id: &str, sender: EventSender) {
        self.bindings.insert(document_id.to_string(), sender);
    }

    /// Deliver an event through the document's current binding.
    pub fn emit(&self, event: &ServerEvent) {
        let name = event.event_name();
        let Some(sender) = self.bindings.get(event.document_id()) else {
            debug!("No connection bound for {}, dropping {}", event.document_id(), name);
            return;
        };
        if sender.send(encode_frame(&event.to_frame())).is_err() {
            debug!(
                "Connection for {} is gone, dropping {}",
                event.document_id(),
                name
            );
        }
    }
}
