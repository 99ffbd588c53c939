//! gdxview: query server for interactive GDX file exploration
//!
//! A GDX (GAMS Data eXchange) file holds named multi-dimensional
//! symbols. This crate implements the server side of an interactive
//! viewer for such files:
//! - an embedded DuckDB engine hosting the GDX reader table functions
//! - two-phase symbol materialization (fast preview, background full
//!   build with progress events and cancellation)
//! - a serialized WebSocket RPC protocol with crash recovery
//! - a client library that forks and monitors the server process

pub mod client;
pub mod config;
pub mod engine;
pub mod filter;
pub mod resolver;
pub mod server;
pub mod types;

pub use config::ServerOptions;
pub use types::*;
