//! Query Server
//!
//! Long-running process that owns the embedded analytics engine and
//! serves the viewer over a WebSocket RPC protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      gdxview server                          │
//! │                                                              │
//! │  ┌───────────────┐      ┌──────────────────────────────┐    │
//! │  │ WebSocket RPC │─────▶│ Dispatcher (serial FIFO)     │    │
//! │  │ (loopback)    │      │  open / query / filter / …   │    │
//! │  └──────┬────────┘      └──────────┬───────────────────┘    │
//! │         │ events                   │ main connection        │
//! │  ┌──────┴────────┐      ┌──────────┴───────────────────┐    │
//! │  │ Event Router  │◀─────│ Engine (DuckDB + GDX reader) │    │
//! │  └───────────────┘      └──────────▲───────────────────┘    │
//! │  ┌───────────────────────┐         │ background connection  │
//! │  │ Materialization       │─────────┘                        │
//! │  │ (preview → full build)│                                  │
//! │  └───────────────────────┘                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All main-connection work flows through one FIFO queue; only the
//! background materialization holds its own connection and runs
//! concurrently with it.

pub mod error;
pub mod events;
pub mod handler;
pub mod lifecycle;
pub mod materialize;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod ws;

pub use error::{sanitize_error_message, ServerError, ServerResult, FRIENDLY_FATAL_MESSAGE};
pub use events::{
    EventRouter, MaterializationComplete, MaterializationError, MaterializationProgress,
    ServerEvent,
};
pub use handler::{Dispatcher, ServerState};
pub use lifecycle::{Server, ServerHandle};
pub use materialize::{MaterializationManager, MaterializeJob};
pub use metrics::{LatencyTrack, MetricsSnapshot, ServerMetrics};
pub use protocol::{decode_frame, encode_frame, ErrorCode, Frame, RpcError};
pub use registry::{DocumentRegistry, DocumentState};
pub use ws::RpcServer;
