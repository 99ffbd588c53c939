//! Materialization Manager
//!
//! Runs phase 2 of the two-phase protocol: the background build of one
//! symbol's full table, with periodic progress events and cancellation.
//! Phase 1 (the synchronous preview) happens in the request handler on
//! the main connection; this module only ever touches the dedicated
//! background connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{EngineConnection, EngineError};
use crate::filter::{quote_ident, quote_literal};
use crate::types::{DocumentId, MaterializedSymbol, Symbol};

use super::error::sanitize_error_message;
use super::events::{
    EventRouter, MaterializationComplete, MaterializationError, MaterializationProgress,
    ServerEvent,
};
use super::metrics::ServerMetrics;
use super::registry::DocumentRegistry;

/// Cadence of `materializationProgress` events.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// One in-flight background build. At most one exists per document.
struct ActiveMaterialization {
    id: Uuid,
    symbol_name: String,
    cancelled: Arc<AtomicBool>,
    connection: Arc<dyn EngineConnection>,
    task: JoinHandle<()>,
}

/// Everything a background build needs, captured at spawn time.
pub struct MaterializeJob {
    pub document_id: DocumentId,
    pub symbol: Symbol,
    pub table_name: String,
    pub local_path: String,
    pub connection: Arc<dyn EngineConnection>,
    pub registry: Arc<DocumentRegistry>,
    pub router: Arc<EventRouter>,
}

/// Tracks and controls active materializations.
pub struct MaterializationManager {
    active: Arc<DashMap<DocumentId, ActiveMaterialization>>,
    metrics: Arc<ServerMetrics>,
}

impl MaterializationManager {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn has_active(&self, document_id: &str) -> bool {
        self.active.contains_key(document_id)
    }

    pub fn active_symbol(&self, document_id: &str) -> Option<String> {
        self.active.get(document_id).map(|a| a.symbol_name.clone())
    }

    /// Start the background build for one symbol. A build already
    /// active for the same document is cancelled and drained first.
    pub async fn spawn(&self, job: MaterializeJob) {
        self.cancel_and_wait(&job.document_id).await;

        let id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        let document_id = job.document_id.clone();
        let symbol_name = job.symbol.name.clone();
        let connection = job.connection.clone();

        info!(
            "Materializing {}/{} into \"{}\"",
            document_id, symbol_name, job.table_name
        );

        self.metrics.record_build_started();

        // The worker waits for the go signal so the active entry is in
        // place before it can possibly finish and try to remove itself.
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let active = self.active.clone();
        let metrics = self.metrics.clone();
        let worker_cancelled = cancelled.clone();
        let task = tokio::spawn(async move {
            let _ = go_rx.await;
            run_materialization(job, worker_cancelled, active, metrics, id).await;
        });

        self.active.insert(
            document_id,
            ActiveMaterialization {
                id,
                symbol_name,
                cancelled,
                connection,
                task,
            },
        );
        let _ = go_tx.send(());
    }

    /// Request cancellation of the document's active build, if any.
    ///
    /// Sets the flag and interrupts the in-flight statement; the worker
    /// observes the flag and emits the terminal cancelled event itself.
    /// Idempotent.
    pub fn cancel(&self, document_id: &str) -> bool {
        match self.active.get(document_id) {
            Some(active) => {
                debug!("Cancelling materialization of {}/{}", document_id, active.symbol_name);
                active.cancelled.store(true, Ordering::SeqCst);
                active.connection.interrupt();
                true
            }
            None => false,
        }
    }

    /// Cancel the document's active build and wait for its worker to
    /// finish, so no table write can land after the caller proceeds.
    pub async fn cancel_and_wait(&self, document_id: &str) {
        if let Some((_, active)) = self.active.remove(document_id) {
            active.cancelled.store(true, Ordering::SeqCst);
            active.connection.interrupt();
            if let Err(e) = active.task.await {
                warn!("Materialization worker for {} panicked: {}", document_id, e);
            }
        }
    }

    /// Cancel and drain every active build. Used at shutdown and by the
    /// force-reload engine reset.
    pub async fn cancel_all_and_wait(&self) {
        let documents: Vec<DocumentId> = self.active.iter().map(|e| e.key().clone()).collect();
        for document_id in documents {
            self.cancel_and_wait(&document_id).await;
        }
    }
}

async fn run_materialization(
    job: MaterializeJob,
    cancelled: Arc<AtomicBool>,
    active: Arc<DashMap<DocumentId, ActiveMaterialization>>,
    metrics: Arc<ServerMetrics>,
    id: Uuid,
) {
    let document_id = job.document_id.clone();
    let symbol_name = job.symbol.name.clone();
    let registry = job.registry.clone();
    let router = job.router.clone();

    let build_started = Instant::now();
    let result = build_table(&job, &cancelled).await;

    // The cancel flag wins over whatever the build returned: a cancel
    // that lands after the CREATE finished must still not be recorded.
    if cancelled.load(Ordering::SeqCst) {
        info!("Materialization of {}/{} cancelled", document_id, symbol_name);
        metrics.record_build_cancelled();
        router.emit(&ServerEvent::Error(MaterializationError {
            document_id: document_id.clone(),
            symbol_name: symbol_name.clone(),
            cancelled: true,
            error: None,
        }));
    } else {
        match result {
            Ok(materialized) => {
                info!(
                    "Materialized {}/{}: {} rows",
                    document_id, symbol_name, materialized.total_row_count
                );
                metrics.record_build_completed(build_started.elapsed());
                registry.record_materialized(&document_id, &symbol_name, materialized.clone());
                router.emit(&ServerEvent::Complete(MaterializationComplete {
                    document_id: document_id.clone(),
                    symbol_name: symbol_name.clone(),
                    table_name: materialized.table_name,
                    columns: materialized.columns,
                    total_row_count: materialized.total_row_count,
                }));
            }
            Err(e) => {
                warn!(
                    "Materialization of {}/{} failed: {}",
                    document_id, symbol_name, e
                );
                metrics.record_build_failed();
                router.emit(&ServerEvent::Error(MaterializationError {
                    document_id: document_id.clone(),
                    symbol_name: symbol_name.clone(),
                    cancelled: false,
                    error: Some(sanitize_error_message(e.message())),
                }));
            }
        }
    }

    active.remove_if(&document_id, |_, entry| entry.id == id);
}

async fn build_table(
    job: &MaterializeJob,
    cancelled: &Arc<AtomicBool>,
) -> Result<MaterializedSymbol, EngineError> {
    let poller = tokio::spawn(poll_progress(
        job.connection.clone(),
        cancelled.clone(),
        job.router.clone(),
        job.document_id.clone(),
        job.symbol.name.clone(),
        job.symbol.record_count,
    ));

    let create_sql = format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_gdx({}, {})",
        quote_ident(&job.table_name),
        quote_literal(&job.local_path),
        quote_literal(&job.symbol.name),
    );
    let create_result = run_blocking(job.connection.clone(), create_sql).await;
    poller.abort();
    create_result?;

    if cancelled.load(Ordering::SeqCst) {
        return Err(EngineError::transient("cancelled"));
    }

    let columns_sql = format!(
        "SELECT column_name FROM information_schema.columns WHERE table_name = {} ORDER BY ordinal_position",
        quote_literal(&job.table_name),
    );
    let columns_result = query_blocking(job.connection.clone(), columns_sql).await?;
    let columns: Vec<String> = columns_result
        .rows
        .iter()
        .filter_map(|row| row.values().next())
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();

    if cancelled.load(Ordering::SeqCst) {
        return Err(EngineError::transient("cancelled"));
    }

    let count_sql = format!("SELECT COUNT(*) AS total FROM {}", quote_ident(&job.table_name));
    let count_result = query_blocking(job.connection.clone(), count_sql).await?;
    let total_row_count = count_result.scalar_u64().unwrap_or(0);

    Ok(MaterializedSymbol {
        table_name: job.table_name.clone(),
        columns,
        total_row_count,
    })
}

async fn run_blocking(
    connection: Arc<dyn EngineConnection>,
    sql: String,
) -> Result<(), EngineError> {
    tokio::task::spawn_blocking(move || connection.run(&sql))
        .await
        .map_err(|e| EngineError::transient(format!("background task failed: {e}")))?
}

async fn query_blocking(
    connection: Arc<dyn EngineConnection>,
    sql: String,
) -> Result<crate::engine::QueryResult, EngineError> {
    tokio::task::spawn_blocking(move || connection.query(&sql))
        .await
        .map_err(|e| EngineError::transient(format!("background task failed: {e}")))?
}

async fn poll_progress(
    connection: Arc<dyn EngineConnection>,
    cancelled: Arc<AtomicBool>,
    router: Arc<EventRouter>,
    document_id: DocumentId,
    symbol_name: String,
    total_rows: u64,
) {
    let mut interval = interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let progress = connection.progress();
        let rows_processed = progress.map(|p| p.rows_processed).unwrap_or(0);
        let percentage = if total_rows > 0 {
            ((rows_processed as f64 / total_rows as f64) * 100.0).min(100.0)
        } else {
            progress.and_then(|p| p.percentage).unwrap_or(0.0)
        };
        router.emit(&ServerEvent::Progress(MaterializationProgress {
            document_id: document_id.clone(),
            symbol_name: symbol_name.clone(),
            percentage,
            rows_processed,
            total_rows,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{QueryProgress, StubController};
    use crate::server::protocol::{decode_frame, Frame};
    use crate::types::SymbolType;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn sample_symbol() -> Symbol {
        Symbol {
            name: "x".to_string(),
            symbol_type: SymbolType::Parameter,
            dimension_count: 2,
            record_count: 6,
        }
    }

    struct Fixture {
        stub: StubController,
        manager: Arc<MaterializationManager>,
        registry: Arc<DocumentRegistry>,
        router: Arc<EventRouter>,
        events: mpsc::UnboundedReceiver<String>,
    }

    fn fixture() -> Fixture {
        let stub = StubController::new();
        stub.on_query(
            "information_schema.columns",
            &["column_name"],
            vec![
                vec![json!("dim_1")],
                vec![json!("dim_2")],
                vec![json!("value")],
            ],
        );
        stub.on_query("COUNT(*)", &["total"], vec![vec![json!(6)]]);

        let registry = Arc::new(DocumentRegistry::new());
        registry.insert(
            "d1",
            super::super::registry::DocumentState::new(
                "/tmp/transport.gdx".to_string(),
                "/tmp/transport.gdx".into(),
                vec![sample_symbol()],
            ),
        );

        let router = Arc::new(EventRouter::new());
        let (tx, events) = mpsc::unbounded_channel();
        router.bind("d1", tx);

        Fixture {
            stub,
            manager: Arc::new(MaterializationManager::new(ServerMetrics::shared())),
            registry,
            router,
            events,
        }
    }

    fn job(fx: &Fixture) -> MaterializeJob {
        MaterializeJob {
            document_id: "d1".to_string(),
            symbol: sample_symbol(),
            table_name: "d1__x".to_string(),
            local_path: "/tmp/transport.gdx".to_string(),
            connection: fx.stub.engine().background_connection().unwrap(),
            registry: fx.registry.clone(),
            router: fx.router.clone(),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> (String, serde_json::Value) {
        let raw = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        match decode_frame(&raw).unwrap() {
            Frame::Event { event, data } => (event, data),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    async fn wait_until_held(stub: &StubController) {
        let stub = stub.clone();
        let held =
            tokio::task::spawn_blocking(move || stub.wait_until_held(Duration::from_secs(5)))
                .await
                .unwrap();
        assert!(held, "worker never reached the gate");
    }

    #[tokio::test]
    async fn successful_build_records_and_emits_complete() {
        let mut fx = fixture();
        fx.manager.spawn(job(&fx)).await;

        let (event, data) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationComplete");
        assert_eq!(data["tableName"], "d1__x");
        assert_eq!(data["totalRowCount"], 6);
        assert_eq!(
            data["columns"],
            json!(["dim_1", "dim_2", "value"])
        );

        // Bookkeeping landed and the slot is free again.
        assert!(fx.registry.is_materialized("d1", "x"));
        for _ in 0..50 {
            if !fx.manager.has_active("d1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.manager.has_active("d1"));

        // The exact statement sequence of phase 2.
        let executed = fx.stub.executed();
        assert!(executed[0].starts_with("CREATE OR REPLACE TABLE \"d1__x\" AS SELECT * FROM read_gdx('/tmp/transport.gdx', 'x')"));
        assert!(executed[1].contains("information_schema.columns"));
        assert!(executed[2].contains("COUNT(*)"));
    }

    #[tokio::test]
    async fn cancel_emits_single_cancelled_error_and_records_nothing() {
        let mut fx = fixture();
        fx.stub.hold_on("CREATE OR REPLACE TABLE");
        fx.manager.spawn(job(&fx)).await;
        wait_until_held(&fx.stub).await;

        assert!(fx.manager.cancel("d1"));

        let (event, data) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationError");
        assert_eq!(data["cancelled"], json!(true));
        assert!(data.get("error").is_none());
        assert!(!fx.registry.is_materialized("d1", "x"));

        // Cancellation is idempotent and the slot frees up.
        for _ in 0..50 {
            if !fx.manager.has_active("d1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fx.manager.cancel("d1"));
    }

    #[tokio::test]
    async fn a_cancelled_build_can_be_retried() {
        let mut fx = fixture();
        fx.stub.hold_on("CREATE OR REPLACE TABLE");
        fx.manager.spawn(job(&fx)).await;
        wait_until_held(&fx.stub).await;
        fx.manager.cancel("d1");

        let (event, _) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationError");

        // Second attempt: gate cleared, runs through.
        fx.manager.spawn(job(&fx)).await;
        let (event, _) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationComplete");
        assert!(fx.registry.is_materialized("d1", "x"));
    }

    #[tokio::test]
    async fn failure_emits_error_with_message() {
        let mut fx = fixture();
        fx.stub.fail_once(
            "CREATE OR REPLACE TABLE",
            EngineError::transient("IO Error: file truncated"),
        );
        fx.manager.spawn(job(&fx)).await;

        let (event, data) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationError");
        assert_eq!(data["cancelled"], json!(false));
        assert_eq!(data["error"], json!("IO Error: file truncated"));
        assert!(!fx.registry.is_materialized("d1", "x"));
    }

    #[tokio::test]
    async fn spawning_again_supersedes_the_active_build() {
        let mut fx = fixture();
        fx.stub.hold_on("CREATE OR REPLACE TABLE");
        fx.manager.spawn(job(&fx)).await;
        wait_until_held(&fx.stub).await;

        // Second spawn for the same document cancels the first.
        fx.manager.spawn(job(&fx)).await;

        let (event, data) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationError");
        assert_eq!(data["cancelled"], json!(true));

        let (event, _) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationComplete");
    }

    #[tokio::test]
    async fn progress_events_precede_completion() {
        let mut fx = fixture();
        fx.stub.set_progress(Some(QueryProgress {
            rows_processed: 3,
            percentage: None,
        }));
        fx.stub.hold_on("CREATE OR REPLACE TABLE");
        fx.manager.spawn(job(&fx)).await;
        wait_until_held(&fx.stub).await;

        // Let at least one poller tick fire, then finish the build.
        let (event, data) = next_event(&mut fx.events).await;
        assert_eq!(event, "materializationProgress");
        assert_eq!(data["rowsProcessed"], 3);
        assert_eq!(data["totalRows"], 6);
        assert_eq!(data["percentage"], json!(50.0));

        fx.stub.release();
        loop {
            let (event, _) = next_event(&mut fx.events).await;
            if event == "materializationProgress" {
                continue;
            }
            assert_eq!(event, "materializationComplete");
            break;
        }
    }
}
