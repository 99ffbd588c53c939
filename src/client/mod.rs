//! Client Library
//!
//! Extension-side access to the query server: forks and monitors the
//! server process, owns the WebSocket, and demultiplexes responses and
//! events. The editor host and the language-model tool wrappers both
//! go through this module.

pub mod connection;
pub mod export;
pub mod process;

pub use connection::{ServerConnection, ViewerEvent};
pub use export::{build_export_statement, ExportFormat};
pub use process::ServerProcess;

use std::path::Path;

use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::ServerOptions;
use crate::filter::Filter;
use crate::server::protocol::{
    ErrorCode, ExecuteQueryResult, GetFilterOptionsResult, MaterializeSymbolResult,
};
use crate::types::Symbol;

/// Errors that can occur when talking to the query server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(String),

    #[error("Server exited before reporting ready; stderr tail:\n{stderr}")]
    StartupFailed { stderr: String },

    #[error("Timed out waiting for the server ready message")]
    ReadyTimeout,

    #[error("Failed to connect to server: {0}")]
    ConnectFailed(String),

    #[error("Connection to server closed")]
    ConnectionClosed,

    #[error("{message}")]
    Rpc { code: ErrorCode, message: String },

    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// The error code when the server answered with an RPC error.
    pub fn rpc_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// High-level client: one server process plus one WebSocket connection.
pub struct GdxViewerClient {
    process: Option<ServerProcess>,
    connection: ServerConnection,
}

impl GdxViewerClient {
    /// Spawn the server binary and connect to it.
    pub async fn launch(
        binary: impl AsRef<Path>,
        options: &ServerOptions,
    ) -> Result<Self, ClientError> {
        let process = ServerProcess::spawn(binary, options).await?;
        match ServerConnection::connect(process.port()).await {
            Ok(connection) => Ok(Self {
                process: Some(process),
                connection,
            }),
            Err(e) => {
                process.dispose().await;
                Err(e)
            }
        }
    }

    /// Connect to an already-running server (used by tests).
    pub async fn connect(port: u16) -> Result<Self, ClientError> {
        Ok(Self {
            process: None,
            connection: ServerConnection::connect(port).await?,
        })
    }

    /// Subscribe to server events (materialization progress and
    /// completion for documents this connection references).
    pub fn events(&self) -> broadcast::Receiver<ViewerEvent> {
        self.connection.subscribe_events()
    }

    pub async fn ping(&self) -> Result<bool, ClientError> {
        let result = self.connection.request("ping", json!({})).await?;
        Ok(result.get("pong").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn open_document(
        &self,
        document_id: &str,
        source: &str,
        force_reload: bool,
    ) -> Result<Vec<Symbol>, ClientError> {
        let result = self
            .connection
            .request(
                "openDocument",
                json!({
                    "documentId": document_id,
                    "source": source,
                    "forceReload": force_reload,
                }),
            )
            .await?;
        let symbols = result
            .get("symbols")
            .cloned()
            .ok_or_else(|| ClientError::UnexpectedResponse("missing symbols".to_string()))?;
        serde_json::from_value(symbols).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    pub async fn close_document(&self, document_id: &str) -> Result<(), ClientError> {
        self.connection
            .request("closeDocument", json!({"documentId": document_id}))
            .await?;
        Ok(())
    }

    pub async fn materialize_symbol(
        &self,
        document_id: &str,
        symbol_name: &str,
        page_size: Option<u64>,
    ) -> Result<MaterializeSymbolResult, ClientError> {
        let mut params = json!({
            "documentId": document_id,
            "symbolName": symbol_name,
        });
        if let Some(page_size) = page_size {
            params["pageSize"] = json!(page_size);
        }
        let result = self.connection.request("materializeSymbol", params).await?;
        serde_json::from_value(result).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    pub async fn cancel_materialization(&self, document_id: &str) -> Result<(), ClientError> {
        self.connection
            .request("cancelMaterialization", json!({"documentId": document_id}))
            .await?;
        Ok(())
    }

    pub async fn execute_query(
        &self,
        document_id: &str,
        sql: &str,
    ) -> Result<ExecuteQueryResult, ClientError> {
        let result = self
            .connection
            .request(
                "executeQuery",
                json!({"documentId": document_id, "sql": sql}),
            )
            .await?;
        serde_json::from_value(result).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    pub async fn get_domain_values(
        &self,
        document_id: &str,
        symbol: &str,
        dim_index: u32,
    ) -> Result<Vec<String>, ClientError> {
        let result = self
            .connection
            .request(
                "getDomainValues",
                json!({
                    "documentId": document_id,
                    "symbol": symbol,
                    "dimIndex": dim_index,
                }),
            )
            .await?;
        let values = result
            .get("values")
            .cloned()
            .ok_or_else(|| ClientError::UnexpectedResponse("missing values".to_string()))?;
        serde_json::from_value(values).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    pub async fn get_filter_options(
        &self,
        document_id: &str,
        symbol_name: &str,
        filters: &[Filter],
    ) -> Result<GetFilterOptionsResult, ClientError> {
        let result = self
            .connection
            .request(
                "getFilterOptions",
                json!({
                    "documentId": document_id,
                    "symbolName": symbol_name,
                    "filters": filters,
                }),
            )
            .await?;
        serde_json::from_value(result).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    /// Export the result of a query to a file, stripping the query's
    /// pagination so the whole result is written.
    pub async fn export_query(
        &self,
        document_id: &str,
        sql: &str,
        target: &std::path::Path,
        format: ExportFormat,
    ) -> Result<(), ClientError> {
        let statement = build_export_statement(sql, target, format);
        self.execute_query(document_id, &statement).await?;
        Ok(())
    }

    /// Diagnostic tail of the server's stderr, when this client owns
    /// the process.
    pub fn server_stderr_tail(&self) -> Option<String> {
        self.process.as_ref().map(|p| p.stderr_tail())
    }

    /// Close the connection and tear the server process down.
    pub async fn dispose(self) {
        self.connection.close();
        if let Some(process) = self.process {
            process.dispose().await;
        }
    }
}
