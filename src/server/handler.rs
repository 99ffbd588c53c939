//! Request Dispatcher
//!
//! A FIFO operation queue is the sole gateway to the engine's main
//! connection: inbound requests become queue items consumed by a single
//! worker task, so at most one handler is in flight at a time.
//! Background materialization runs off-queue on its own connection.
//!
//! The worker also owns crash recovery: a handler error classified as
//! fatal by the engine clears every materialized map, replaces the
//! engine through the factory, and retries the request exactly once.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ServerOptions;
use crate::engine::{Engine, EngineConnection, EngineError, EngineFactory, QueryResult};
use crate::filter::{compile_where_excluding, quote_ident, quote_literal};
use crate::resolver::SourceResolver;
use crate::types::{table_name_for, Symbol, SymbolType};

use super::error::{ServerError, ServerResult};
use super::events::EventRouter;
use super::materialize::{MaterializationManager, MaterializeJob};
use super::metrics::ServerMetrics;
use super::protocol::*;
use super::registry::{DocumentRegistry, DocumentState};

/// Shared server components. The engine slot is swapped atomically by
/// the recovery path; everything else lives for the server's lifetime.
pub struct ServerState {
    engine: RwLock<Arc<dyn Engine>>,
    factory: Arc<dyn EngineFactory>,
    pub registry: Arc<DocumentRegistry>,
    pub resolver: Arc<SourceResolver>,
    pub materializer: Arc<MaterializationManager>,
    pub router: Arc<EventRouter>,
    pub metrics: Arc<ServerMetrics>,
}

impl ServerState {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        options: &ServerOptions,
    ) -> Result<Arc<Self>, EngineError> {
        let engine = factory.create()?;
        let metrics = ServerMetrics::shared();
        Ok(Arc::new(Self {
            engine: RwLock::new(engine),
            factory,
            registry: Arc::new(DocumentRegistry::new()),
            resolver: Arc::new(SourceResolver::new(options.allow_remote_source_loading)),
            materializer: Arc::new(MaterializationManager::new(metrics.clone())),
            router: Arc::new(EventRouter::new()),
            metrics,
        }))
    }

    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.read().clone()
    }

    async fn engine_query(&self, sql: String) -> ServerResult<QueryResult> {
        let engine = self.engine();
        tokio::task::spawn_blocking(move || engine.query(&sql))
            .await
            .map_err(|e| {
                ServerError::Engine(EngineError::transient(format!("engine task failed: {e}")))
            })?
            .map_err(ServerError::from)
    }

    async fn engine_run(&self, sql: String) -> ServerResult<()> {
        let engine = self.engine();
        tokio::task::spawn_blocking(move || engine.run(&sql))
            .await
            .map_err(|e| {
                ServerError::Engine(EngineError::transient(format!("engine task failed: {e}")))
            })?
            .map_err(ServerError::from)
    }

    async fn background_connection(&self) -> ServerResult<Arc<dyn EngineConnection>> {
        let engine = self.engine();
        tokio::task::spawn_blocking(move || engine.background_connection())
            .await
            .map_err(|e| {
                ServerError::Engine(EngineError::transient(format!("engine task failed: {e}")))
            })?
            .map_err(ServerError::from)
    }

    /// Graceful teardown: drain background work, dispose the engine
    /// (removing its database files), and delete staged remote sources.
    pub async fn shutdown(&self) {
        self.materializer.cancel_all_and_wait().await;
        let engine = self.engine();
        let _ = tokio::task::spawn_blocking(move || engine.dispose()).await;
        self.resolver.dispose();
    }
}

/// One queued request.
struct DispatchJob {
    method: String,
    params: Value,
    respond_to: oneshot::Sender<Result<Value, RpcError>>,
}

/// Handle to the serial operation queue.
#[derive(Clone)]
pub struct Dispatcher {
    queue_tx: mpsc::Sender<DispatchJob>,
}

impl Dispatcher {
    /// Spawn the queue worker and return the dispatch handle.
    pub fn start(state: Arc<ServerState>) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::channel::<DispatchJob>(256);
        tokio::spawn(async move {
            while let Some(job) = queue_rx.recv().await {
                debug!("Handling request: {}", job.method);
                let started = std::time::Instant::now();
                let result = handle_with_recovery(&state, &job.method, job.params).await;
                state
                    .metrics
                    .record_request(started.elapsed(), result.is_ok());
                let _ = job
                    .respond_to
                    .send(result.map_err(|e| e.to_rpc()));
            }
            debug!("Dispatcher queue drained");
        });
        Self { queue_tx }
    }

    /// Enqueue one request and wait for its completion. Requests are
    /// processed strictly in arrival order.
    pub async fn dispatch(&self, method: String, params: Value) -> Result<Value, RpcError> {
        let (respond_to, response) = oneshot::channel();
        self.queue_tx
            .send(DispatchJob {
                method,
                params,
                respond_to,
            })
            .await
            .map_err(|_| RpcError {
                code: ErrorCode::TransientEngine,
                message: "Server is shutting down".to_string(),
            })?;
        response.await.map_err(|_| RpcError {
            code: ErrorCode::TransientEngine,
            message: "Request handler dropped".to_string(),
        })?
    }
}

async fn handle_with_recovery(
    state: &Arc<ServerState>,
    method: &str,
    params: Value,
) -> ServerResult<Value> {
    let first = handle(state, method, params.clone()).await;
    let is_fatal = matches!(&first, Err(e) if e.is_fatal_engine());
    if !is_fatal {
        return first;
    }

    if let Err(e) = &first {
        warn!(
            "Fatal engine error during {}: {}. Re-initializing engine and retrying once.",
            method, e
        );
    }
    if let Err(recovery_err) = recover(state).await {
        error!("Engine recovery failed: {}", recovery_err);
        return first;
    }
    match handle(state, method, params).await {
        Ok(result) => {
            info!("Request {} succeeded after engine recovery", method);
            Ok(result)
        }
        Err(retry_err) => {
            error!(
                "Request {} failed again after recovery: {}",
                method, retry_err
            );
            Err(retry_err)
        }
    }
}

/// Replace the invalidated engine with a fresh one. Every materialized
/// table died with the old engine, so the registry caches are cleared;
/// staged remote sources are left untouched so those documents stay
/// valid.
async fn recover(state: &Arc<ServerState>) -> ServerResult<()> {
    state.metrics.record_recovery();
    state.materializer.cancel_all_and_wait().await;
    let cleared = state.registry.clear_all_materialized();
    if cleared > 0 {
        info!("Dropped {} stale materialization records", cleared);
    }

    let old = state.engine();
    let _ = tokio::task::spawn_blocking(move || old.dispose()).await;

    let factory = state.factory.clone();
    let fresh = tokio::task::spawn_blocking(move || factory.create())
        .await
        .map_err(|e| {
            ServerError::Engine(EngineError::transient(format!("engine task failed: {e}")))
        })?
        .map_err(ServerError::from)?;
    *state.engine.write() = fresh;
    info!("Engine re-initialized");
    Ok(())
}

async fn handle(state: &Arc<ServerState>, method: &str, params: Value) -> ServerResult<Value> {
    match method {
        "ping" => to_result(PingResult { pong: true }),
        "openDocument" => open_document(state, parse_params(params)?).await,
        "closeDocument" => close_document(state, parse_params(params)?).await,
        "materializeSymbol" => materialize_symbol(state, parse_params(params)?).await,
        "cancelMaterialization" => cancel_materialization(state, parse_params(params)?),
        "executeQuery" => execute_query(state, parse_params(params)?).await,
        "getDomainValues" => get_domain_values(state, parse_params(params)?).await,
        "getFilterOptions" => get_filter_options(state, parse_params(params)?).await,
        other => Err(ServerError::invalid_input(format!(
            "Unknown method: {other}"
        ))),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> ServerResult<T> {
    serde_json::from_value(params)
        .map_err(|e| ServerError::invalid_input(format!("Invalid params: {e}")))
}

fn to_result<T: serde::Serialize>(value: T) -> ServerResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| ServerError::invalid_input(format!("Failed to encode result: {e}")))
}

// ============ openDocument / closeDocument ============

async fn open_document(
    state: &Arc<ServerState>,
    params: OpenDocumentParams,
) -> ServerResult<Value> {
    if params.document_id.is_empty() {
        return Err(ServerError::invalid_input("documentId must not be empty"));
    }
    if params.source.is_empty() {
        return Err(ServerError::invalid_input("source must not be empty"));
    }

    if let Some(existing) = state.registry.get(&params.document_id) {
        if !params.force_reload {
            return to_result(OpenDocumentResult {
                symbols: existing.symbols,
            });
        }
        return force_reload(state, &params.document_id).await;
    }

    let engine = state.engine();
    let local_path = state
        .resolver
        .resolve(&params.source, engine.as_ref())
        .await?;
    if params.source.starts_with("http://") || params.source.starts_with("https://") {
        state.metrics.record_remote_fetch();
    }
    let symbols = read_symbol_catalog(state, &local_path.to_string_lossy()).await?;
    info!(
        "Opened document {} ({} symbols) from {}",
        params.document_id,
        symbols.len(),
        params.source
    );
    state.metrics.record_document_opened();
    state.registry.insert(
        &params.document_id,
        DocumentState::new(params.source, local_path, symbols.clone()),
    );
    to_result(OpenDocumentResult { symbols })
}

/// The engine caches GDX file state internally and there is no reliable
/// per-file invalidation, so a reload tears the whole engine down and
/// re-opens every document against the fresh instance.
async fn force_reload(state: &Arc<ServerState>, document_id: &str) -> ServerResult<Value> {
    info!("Force reload requested for {}", document_id);
    state.materializer.cancel_and_wait(document_id).await;

    // Best effort: the reset below destroys the tables anyway.
    for materialized in state.registry.clear_materialized(document_id) {
        let drop_sql = format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&materialized.table_name)
        );
        if let Err(e) = state.engine_run(drop_sql).await {
            debug!("Pre-reset drop of {} failed: {}", materialized.table_name, e);
        }
    }

    recover(state).await?;

    // Re-resolve every open document against the fresh engine.
    let engine = state.engine();
    for open_id in state.registry.document_ids() {
        let Some(doc) = state.registry.get(&open_id) else {
            continue;
        };
        let local_path = state.resolver.resolve(&doc.source, engine.as_ref()).await?;
        let symbols = read_symbol_catalog(state, &local_path.to_string_lossy()).await?;
        state
            .registry
            .update_after_reload(&open_id, local_path, symbols);
    }

    let symbols = state
        .registry
        .get(document_id)
        .map(|doc| doc.symbols)
        .ok_or_else(|| ServerError::not_found(document_id))?;
    to_result(OpenDocumentResult { symbols })
}

async fn read_symbol_catalog(state: &Arc<ServerState>, path: &str) -> ServerResult<Vec<Symbol>> {
    let sql = format!("SELECT * FROM gdx_symbols({})", quote_literal(path));
    let result = state.engine_query(sql).await?;
    let symbols = result
        .rows
        .iter()
        .map(|row| Symbol {
            name: row
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            symbol_type: row
                .get("type")
                .and_then(|v| v.as_str())
                .map(SymbolType::from_label)
                .unwrap_or(SymbolType::Other),
            dimension_count: row
                .get("dim_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            record_count: row
                .get("record_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        })
        .collect();
    Ok(symbols)
}

async fn close_document(
    state: &Arc<ServerState>,
    params: CloseDocumentParams,
) -> ServerResult<Value> {
    state
        .materializer
        .cancel_and_wait(&params.document_id)
        .await;
    let doc = state
        .registry
        .remove(&params.document_id)
        .ok_or_else(|| ServerError::not_found(&params.document_id))?;

    for materialized in doc.materialized.values() {
        let drop_sql = format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&materialized.table_name)
        );
        if let Err(e) = state.engine_run(drop_sql).await {
            debug!("Failed to drop {}: {}", materialized.table_name, e);
        }
    }

    // Reclaim disk held by the dropped tables; failure is harmless.
    if let Err(e) = state.engine_run("CHECKPOINT".to_string()).await {
        debug!("Checkpoint after close failed: {}", e);
    }

    info!("Closed document {}", params.document_id);
    state.metrics.record_document_closed();
    to_result(SuccessResult { success: true })
}

// ============ materializeSymbol / cancelMaterialization ============

async fn materialize_symbol(
    state: &Arc<ServerState>,
    params: MaterializeSymbolParams,
) -> ServerResult<Value> {
    let doc = state
        .registry
        .get(&params.document_id)
        .ok_or_else(|| ServerError::not_found(&params.document_id))?;
    let symbol = state
        .registry
        .symbol(&params.document_id, &params.symbol_name)
        .ok_or_else(|| {
            ServerError::invalid_input(format!(
                "Unknown symbol '{}' in document '{}'",
                params.symbol_name, params.document_id
            ))
        })?;

    // Already cached: answer without touching the GDX again.
    if let Some(materialized) = state
        .registry
        .materialized(&params.document_id, &params.symbol_name)
    {
        return to_result(MaterializeSymbolResult {
            table_name: Some(materialized.table_name),
            columns: materialized.columns,
            total_row_count: materialized.total_row_count,
            status: MaterializeStatus::Materialized,
            preview_rows: None,
            preview_row_count: None,
        });
    }

    let local_path = doc.local_path.to_string_lossy().to_string();

    // Phase 1: synchronous preview on the main connection. The record
    // count from the catalog stands in for the true total.
    let preview_sql = format!(
        "SELECT * FROM read_gdx({}, {}) LIMIT {}",
        quote_literal(&local_path),
        quote_literal(&params.symbol_name),
        params.page_size,
    );
    let preview = state.engine_query(preview_sql).await?;
    let preview_row_count = preview.row_count() as u64;

    // Phase 2: background full build on a dedicated connection.
    let connection = state.background_connection().await?;
    let table_name = table_name_for(&params.document_id, &params.symbol_name);
    state
        .materializer
        .spawn(MaterializeJob {
            document_id: params.document_id.clone(),
            symbol: symbol.clone(),
            table_name,
            local_path,
            connection,
            registry: state.registry.clone(),
            router: state.router.clone(),
        })
        .await;

    to_result(MaterializeSymbolResult {
        table_name: None,
        columns: preview.columns,
        total_row_count: symbol.record_count,
        status: MaterializeStatus::Preview,
        preview_rows: Some(preview.rows),
        preview_row_count: Some(preview_row_count),
    })
}

fn cancel_materialization(
    state: &Arc<ServerState>,
    params: CancelMaterializationParams,
) -> ServerResult<Value> {
    // Idempotent: cancelling an idle document is fine.
    state.materializer.cancel(&params.document_id);
    to_result(SuccessResult { success: true })
}

// ============ executeQuery ============

async fn execute_query(
    state: &Arc<ServerState>,
    params: ExecuteQueryParams,
) -> ServerResult<Value> {
    let doc = state
        .registry
        .get(&params.document_id)
        .ok_or_else(|| ServerError::not_found(&params.document_id))?;
    let local_path = doc.local_path.to_string_lossy();

    // Textual rewrite, not a bound parameter: the placeholder and the
    // original source string both become the resolved local path.
    let sql = params
        .sql
        .replace("__GDX_FILE__", &local_path)
        .replace(&doc.source, &local_path);

    let result = state.engine_query(sql).await?;
    let row_count = result.row_count() as u64;
    to_result(ExecuteQueryResult {
        columns: result.columns,
        rows: result.rows,
        row_count,
    })
}

// ============ getDomainValues / getFilterOptions ============

async fn get_domain_values(
    state: &Arc<ServerState>,
    params: GetDomainValuesParams,
) -> ServerResult<Value> {
    if params.dim_index == 0 {
        return Err(ServerError::invalid_input("dimIndex is 1-based"));
    }
    let doc = state
        .registry
        .get(&params.document_id)
        .ok_or_else(|| ServerError::not_found(&params.document_id))?;

    let column = format!("dim_{}", params.dim_index);
    let filters = params.dimension_filters.unwrap_or_default();

    let sql = match state
        .registry
        .materialized(&params.document_id, &params.symbol)
    {
        Some(materialized) => {
            let mut clauses: Vec<String> = Vec::new();
            for (filter_column, values) in &filters {
                if values.is_empty() {
                    continue;
                }
                let list: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
                clauses.push(format!(
                    "{} IN ({})",
                    quote_ident(filter_column),
                    list.join(",")
                ));
            }
            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };
            format!(
                "SELECT DISTINCT {col} FROM {table}{where_clause} ORDER BY {col}",
                col = quote_ident(&column),
                table = quote_ident(&materialized.table_name),
            )
        }
        // Not materialized: ask the raw file. Used by language-model
        // tools that never materialize.
        None => {
            let filter_arg = if filters.is_empty() {
                String::new()
            } else {
                let entries: Vec<String> = filters
                    .iter()
                    .map(|(filter_column, values)| {
                        let list: Vec<String> =
                            values.iter().map(|v| quote_literal(v)).collect();
                        format!("{}: [{}]", quote_literal(filter_column), list.join(","))
                    })
                    .collect();
                format!(", dimension_filters := MAP {{{}}}", entries.join(", "))
            };
            format!(
                "SELECT * FROM gdx_domain_values({}, {}, {}{})",
                quote_literal(&doc.local_path.to_string_lossy()),
                quote_literal(&params.symbol),
                params.dim_index,
                filter_arg,
            )
        }
    };

    let result = state.engine_query(sql).await?;
    let values = result
        .rows
        .iter()
        .filter_map(|row| row.values().next())
        .map(value_to_string)
        .collect();
    to_result(GetDomainValuesResult { values })
}

async fn get_filter_options(
    state: &Arc<ServerState>,
    params: GetFilterOptionsParams,
) -> ServerResult<Value> {
    if !state.registry.is_open(&params.document_id) {
        return Err(ServerError::not_found(&params.document_id));
    }
    let materialized = state
        .registry
        .materialized(&params.document_id, &params.symbol_name)
        .ok_or_else(|| ServerError::NotMaterialized {
            document: params.document_id.clone(),
            symbol: params.symbol_name.clone(),
        })?;

    let mut filter_options = serde_json::Map::new();
    for column in materialized
        .columns
        .iter()
        .filter(|c| c.starts_with("dim_"))
    {
        // Cross-filtering: every active filter applies except the one
        // on the column being computed.
        let where_clause = compile_where_excluding(&params.filters, Some(column));
        let where_sql = if where_clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {where_clause}")
        };
        let sql = format!(
            "SELECT DISTINCT {col} FROM {table}{where_sql} ORDER BY {col}",
            col = quote_ident(column),
            table = quote_ident(&materialized.table_name),
        );
        let result = state.engine_query(sql).await?;
        let values: Vec<Value> = result
            .rows
            .iter()
            .filter_map(|row| row.values().next())
            .map(|v| Value::String(value_to_string(v)))
            .collect();
        filter_options.insert(column.clone(), Value::Array(values));
    }

    to_result(GetFilterOptionsResult { filter_options })
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StubController;
    use crate::server::error::FRIENDLY_FATAL_MESSAGE;
    use crate::server::protocol::decode_frame;
    use crate::server::protocol::Frame;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;

    struct Fixture {
        stub: StubController,
        state: Arc<ServerState>,
        dispatcher: Dispatcher,
        events: tokio_mpsc::UnboundedReceiver<String>,
    }

    fn fixture() -> Fixture {
        let stub = StubController::new();
        stub.on_query(
            "gdx_symbols",
            &["name", "type", "dim_count", "record_count"],
            vec![vec![json!("x"), json!("parameter"), json!(2), json!(6)]],
        );
        stub.on_query(
            "LIMIT 4",
            &["dim_1", "dim_2", "value"],
            vec![
                vec![json!("a"), json!("x"), json!(1.0)],
                vec![json!("a"), json!("y"), json!(2.0)],
                vec![json!("b"), json!("x"), json!(3.0)],
                vec![json!("b"), json!("y"), json!(4.0)],
            ],
        );
        stub.on_query(
            "information_schema.columns",
            &["column_name"],
            vec![
                vec![json!("dim_1")],
                vec![json!("dim_2")],
                vec![json!("value")],
            ],
        );
        stub.on_query("SELECT COUNT(*) AS total", &["total"], vec![vec![json!(6)]]);
        stub.on_query("COUNT(*) AS n", &["n"], vec![vec![json!(6)]]);
        stub.on_query(
            "SELECT DISTINCT \"dim_1\"",
            &["dim_1"],
            vec![vec![json!("a")], vec![json!("b")]],
        );
        stub.on_query(
            "SELECT DISTINCT \"dim_2\"",
            &["dim_2"],
            vec![vec![json!("x")], vec![json!("y")]],
        );

        let state = ServerState::new(stub.factory(), &ServerOptions::default()).unwrap();
        let (tx, events) = tokio_mpsc::unbounded_channel();
        state.router.bind("d1", tx);
        let dispatcher = Dispatcher::start(state.clone());
        Fixture {
            stub,
            state,
            dispatcher,
            events,
        }
    }

    async fn dispatch(fx: &Fixture, method: &str, params: Value) -> Result<Value, RpcError> {
        fx.dispatcher.dispatch(method.to_string(), params).await
    }

    async fn open_d1(fx: &Fixture) -> Value {
        dispatch(
            fx,
            "openDocument",
            json!({"documentId": "d1", "source": "/tmp/transport.gdx"}),
        )
        .await
        .unwrap()
    }

    async fn next_event(fx: &mut Fixture) -> (String, Value) {
        let raw = tokio::time::timeout(Duration::from_secs(5), fx.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        match decode_frame(&raw).unwrap() {
            Frame::Event { event, data } => (event, data),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    async fn next_terminal_event(fx: &mut Fixture) -> (String, Value) {
        loop {
            let (event, data) = next_event(fx).await;
            if event != "materializationProgress" {
                return (event, data);
            }
        }
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let fx = fixture();
        let result = dispatch(&fx, "ping", Value::Null).await.unwrap();
        assert_eq!(result, json!({"pong": true}));
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_input() {
        let fx = fixture();
        let err = dispatch(&fx, "frobnicate", Value::Null).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.contains("frobnicate"));
    }

    #[tokio::test]
    async fn missing_params_are_invalid_input() {
        let fx = fixture();
        let err = dispatch(&fx, "openDocument", json!({"documentId": "d1"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn open_document_reads_catalog_once_and_caches() {
        let fx = fixture();
        let result = open_d1(&fx).await;
        assert_eq!(result["symbols"][0]["name"], "x");
        assert_eq!(result["symbols"][0]["type"], "parameter");
        assert_eq!(result["symbols"][0]["dimensionCount"], 2);
        assert_eq!(result["symbols"][0]["recordCount"], 6);

        let catalog_reads = |stub: &StubController| {
            stub.executed()
                .iter()
                .filter(|sql| sql.contains("gdx_symbols"))
                .count()
        };
        assert_eq!(catalog_reads(&fx.stub), 1);
        open_d1(&fx).await;
        assert_eq!(catalog_reads(&fx.stub), 1);
    }

    #[tokio::test]
    async fn requests_against_unknown_documents_are_not_found() {
        let fx = fixture();
        for (method, params) in [
            ("executeQuery", json!({"documentId":"nope","sql":"SELECT 1"})),
            ("closeDocument", json!({"documentId":"nope"})),
            (
                "materializeSymbol",
                json!({"documentId":"nope","symbolName":"x"}),
            ),
            (
                "getFilterOptions",
                json!({"documentId":"nope","symbolName":"x","filters":[]}),
            ),
        ] {
            let err = dispatch(&fx, method, params).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::NotFound, "method {method}");
        }
    }

    #[tokio::test]
    async fn open_preview_materialize_query_flow() {
        let mut fx = fixture();
        open_d1(&fx).await;

        let preview = dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        assert_eq!(preview["status"], "preview");
        assert_eq!(preview["tableName"], Value::Null);
        assert_eq!(preview["previewRowCount"], 4);
        assert_eq!(preview["totalRowCount"], 6);
        assert_eq!(preview["columns"], json!(["dim_1", "dim_2", "value"]));

        let (event, data) = next_terminal_event(&mut fx).await;
        assert_eq!(event, "materializationComplete");
        assert_eq!(data["tableName"], "d1__x");
        assert_eq!(data["totalRowCount"], 6);

        let result = dispatch(
            &fx,
            "executeQuery",
            json!({"documentId":"d1","sql":"SELECT COUNT(*) AS n FROM \"d1__x\""}),
        )
        .await
        .unwrap();
        assert_eq!(result["rows"], json!([{"n": 6}]));
        assert_eq!(result["rowCount"], 1);

        // Cached on the second call: no preview, no new build.
        let cached = dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x"}),
        )
        .await
        .unwrap();
        assert_eq!(cached["status"], "materialized");
        assert_eq!(cached["tableName"], "d1__x");
        assert!(cached.get("previewRows").is_none());
    }

    #[tokio::test]
    async fn cancel_during_materialize_then_retry() {
        let mut fx = fixture();
        open_d1(&fx).await;
        fx.stub.hold_on("CREATE OR REPLACE TABLE");

        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        {
            let stub = fx.stub.clone();
            let held =
                tokio::task::spawn_blocking(move || stub.wait_until_held(Duration::from_secs(5)))
                    .await
                    .unwrap();
            assert!(held);
        }

        let result = dispatch(
            &fx,
            "cancelMaterialization",
            json!({"documentId":"d1"}),
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"success": true}));

        let (event, data) = next_terminal_event(&mut fx).await;
        assert_eq!(event, "materializationError");
        assert_eq!(data["cancelled"], json!(true));

        // Same symbol materializes fine afterwards.
        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        let (event, _) = next_terminal_event(&mut fx).await;
        assert_eq!(event, "materializationComplete");
    }

    #[tokio::test]
    async fn filter_options_exclude_the_filtered_column() {
        let mut fx = fixture();
        open_d1(&fx).await;
        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        let (event, _) = next_terminal_event(&mut fx).await;
        assert_eq!(event, "materializationComplete");

        let result = dispatch(
            &fx,
            "getFilterOptions",
            json!({
                "documentId": "d1",
                "symbolName": "x",
                "filters": [
                    {"columnName": "dim_1", "filterValue": {"selectedValues": ["a"]}}
                ]
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            result["filterOptions"],
            json!({"dim_1": ["a", "b"], "dim_2": ["x", "y"]})
        );

        // dim_1's own dropdown query carries no dim_1 predicate; dim_2's
        // does.
        let executed = fx.stub.executed();
        let dim_1_sql = executed
            .iter()
            .find(|sql| sql.contains("SELECT DISTINCT \"dim_1\""))
            .unwrap();
        assert!(!dim_1_sql.contains("\"dim_1\" IN"));
        let dim_2_sql = executed
            .iter()
            .find(|sql| sql.contains("SELECT DISTINCT \"dim_2\""))
            .unwrap();
        assert!(dim_2_sql.contains("\"dim_1\" IN ('a')"));
        assert!(dim_2_sql.ends_with("ORDER BY \"dim_2\""));
    }

    #[tokio::test]
    async fn filter_options_require_materialization() {
        let fx = fixture();
        open_d1(&fx).await;
        let err = dispatch(
            &fx,
            "getFilterOptions",
            json!({"documentId":"d1","symbolName":"x","filters":[]}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotMaterialized);
    }

    #[tokio::test]
    async fn execute_query_rewrites_placeholder_and_source() {
        let fx = fixture();
        open_d1(&fx).await;
        dispatch(
            &fx,
            "executeQuery",
            json!({
                "documentId": "d1",
                "sql": "SELECT * FROM read_gdx('__GDX_FILE__', 'x')"
            }),
        )
        .await
        .unwrap();
        let executed = fx.stub.executed();
        assert!(executed
            .last()
            .unwrap()
            .contains("read_gdx('/tmp/transport.gdx', 'x')"));
    }

    #[tokio::test]
    async fn domain_values_fall_back_to_the_raw_file() {
        let fx = fixture();
        open_d1(&fx).await;
        fx.stub.on_query(
            "gdx_domain_values",
            &["value"],
            vec![vec![json!("a")], vec![json!("b")]],
        );

        let result = dispatch(
            &fx,
            "getDomainValues",
            json!({
                "documentId": "d1",
                "symbol": "x",
                "dimIndex": 1,
                "dimensionFilters": {"dim_2": ["x"]}
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["values"], json!(["a", "b"]));

        let executed = fx.stub.executed();
        let sql = executed.last().unwrap();
        assert!(sql.contains("gdx_domain_values('/tmp/transport.gdx', 'x', 1"));
        assert!(sql.contains("dimension_filters := MAP {'dim_2': ['x']}"));
    }

    #[tokio::test]
    async fn domain_values_answer_from_the_table_once_materialized() {
        let mut fx = fixture();
        open_d1(&fx).await;
        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        next_terminal_event(&mut fx).await;

        let result = dispatch(
            &fx,
            "getDomainValues",
            json!({"documentId":"d1","symbol":"x","dimIndex":1}),
        )
        .await
        .unwrap();
        assert_eq!(result["values"], json!(["a", "b"]));
        let executed = fx.stub.executed();
        assert!(executed
            .last()
            .unwrap()
            .contains("SELECT DISTINCT \"dim_1\" FROM \"d1__x\""));
    }

    #[tokio::test]
    async fn close_document_drops_tables_and_checkpoints() {
        let mut fx = fixture();
        open_d1(&fx).await;
        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        next_terminal_event(&mut fx).await;

        let result = dispatch(&fx, "closeDocument", json!({"documentId":"d1"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"success": true}));

        let executed = fx.stub.executed();
        assert!(executed
            .iter()
            .any(|sql| sql == "DROP TABLE IF EXISTS \"d1__x\""));
        assert!(executed.iter().any(|sql| sql == "CHECKPOINT"));

        let err = dispatch(
            &fx,
            "executeQuery",
            json!({"documentId":"d1","sql":"SELECT 1"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn serial_execution_preserves_arrival_order() {
        let fx = fixture();
        open_d1(&fx).await;
        fx.stub.hold_on("SELECT 'first'");

        let d1 = fx.dispatcher.clone();
        let first = tokio::spawn(async move {
            d1.dispatch(
                "executeQuery".to_string(),
                json!({"documentId":"d1","sql":"SELECT 'first'"}),
            )
            .await
        });
        {
            let stub = fx.stub.clone();
            let held =
                tokio::task::spawn_blocking(move || stub.wait_until_held(Duration::from_secs(5)))
                    .await
                    .unwrap();
            assert!(held);
        }

        let d2 = fx.dispatcher.clone();
        let second = tokio::spawn(async move {
            d2.dispatch(
                "executeQuery".to_string(),
                json!({"documentId":"d1","sql":"SELECT 'second'"}),
            )
            .await
        });

        // The second statement must not reach the engine while the
        // first is in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fx
            .stub
            .executed()
            .iter()
            .any(|sql| sql.contains("'second'")));

        fx.stub.release();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let executed = fx.stub.executed();
        let first_pos = executed.iter().position(|s| s.contains("'first'")).unwrap();
        let second_pos = executed
            .iter()
            .position(|s| s.contains("'second'"))
            .unwrap();
        assert!(first_pos < second_pos);
    }

    #[tokio::test]
    async fn fatal_error_recovers_and_retries_once() {
        let mut fx = fixture();
        open_d1(&fx).await;
        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        next_terminal_event(&mut fx).await;
        assert!(fx.state.registry.is_materialized("d1", "x"));

        fx.stub.fail_once(
            "SELECT 'probe'",
            EngineError::classify("IO Error: database has been invalidated"),
        );
        let result = dispatch(
            &fx,
            "executeQuery",
            json!({"documentId":"d1","sql":"SELECT 'probe'"}),
        )
        .await
        .unwrap();
        assert_eq!(result["rowCount"], 0);

        // A fresh engine generation took over and the stale caches are
        // gone.
        assert_eq!(fx.stub.engines_created(), 2);
        assert_eq!(fx.stub.engines_disposed(), 1);
        assert!(!fx.state.registry.is_materialized("d1", "x"));
    }

    #[tokio::test]
    async fn fatal_retry_failure_surfaces_sanitized_message() {
        let fx = fixture();
        open_d1(&fx).await;
        fx.stub.fail_once(
            "SELECT 'probe'",
            EngineError::classify("database has been invalidated"),
        );
        fx.stub.fail_once(
            "SELECT 'probe'",
            EngineError::classify("database has been invalidated"),
        );

        let err = dispatch(
            &fx,
            "executeQuery",
            json!({"documentId":"d1","sql":"SELECT 'probe'"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::FatalEngine);
        assert_eq!(err.message, FRIENDLY_FATAL_MESSAGE);
        // Exactly one retry: two generations, no third.
        assert_eq!(fx.stub.engines_created(), 2);
    }

    #[tokio::test]
    async fn transient_errors_do_not_recover() {
        let fx = fixture();
        open_d1(&fx).await;
        fx.stub.fail_once(
            "SELECT 'probe'",
            EngineError::transient("Binder Error: no such table"),
        );
        let err = dispatch(
            &fx,
            "executeQuery",
            json!({"documentId":"d1","sql":"SELECT 'probe'"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::TransientEngine);
        assert_eq!(err.message, "Binder Error: no such table");
        assert_eq!(fx.stub.engines_created(), 1);
    }

    #[tokio::test]
    async fn remote_source_rejected_when_disabled() {
        let fx = fixture();
        let err = dispatch(
            &fx,
            "openDocument",
            json!({"documentId":"d2","source":"https://x/y.gdx"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert!(err.message.starts_with("Remote source loading is disabled"));
        assert!(!fx.state.registry.is_open("d2"));
    }

    #[tokio::test]
    async fn metrics_track_requests_and_recoveries() {
        let fx = fixture();
        open_d1(&fx).await;
        fx.stub.fail_once(
            "SELECT 'probe'",
            EngineError::classify("database has been invalidated"),
        );
        dispatch(
            &fx,
            "executeQuery",
            json!({"documentId":"d1","sql":"SELECT 'probe'"}),
        )
        .await
        .unwrap();

        let snapshot = fx.state.metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.request_errors, 0);
        assert_eq!(snapshot.recoveries, 1);
        assert_eq!(snapshot.documents_open, 1);
        assert_eq!(fx.state.metrics.request_latency.count(), 2);

        let err = dispatch(&fx, "frobnicate", Value::Null).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert_eq!(fx.state.metrics.snapshot().request_errors, 1);
    }

    #[tokio::test]
    async fn force_reload_resets_the_engine_and_rereads_catalogs() {
        let mut fx = fixture();
        open_d1(&fx).await;
        dispatch(
            &fx,
            "materializeSymbol",
            json!({"documentId":"d1","symbolName":"x","pageSize":4}),
        )
        .await
        .unwrap();
        next_terminal_event(&mut fx).await;
        assert!(fx.state.registry.is_materialized("d1", "x"));

        let result = dispatch(
            &fx,
            "openDocument",
            json!({"documentId":"d1","source":"/tmp/transport.gdx","forceReload":true}),
        )
        .await
        .unwrap();
        assert_eq!(result["symbols"][0]["name"], "x");

        assert_eq!(fx.stub.engines_created(), 2);
        assert_eq!(fx.stub.engines_disposed(), 1);
        assert!(!fx.state.registry.is_materialized("d1", "x"));
        // The catalog was re-read on the fresh engine.
        let catalog_reads = fx
            .stub
            .executed()
            .iter()
            .filter(|sql| sql.contains("gdx_symbols"))
            .count();
        assert_eq!(catalog_reads, 2);
    }
}
