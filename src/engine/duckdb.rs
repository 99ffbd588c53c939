//! DuckDB-backed engine implementation.
//!
//! Owns the main connection behind a mutex (callers serialize through
//! the dispatcher queue, so the lock is uncontended) and hands out
//! interruptible cloned connections for background materialization.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use duckdb::types::Value as DuckValue;
use duckdb::{Connection, InterruptHandle};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::filter::quote_literal;

use super::traits::{
    Engine, EngineConnection, EngineError, EngineFactory, EngineResult, QueryProgress, QueryResult,
};

/// Largest integer a JSON consumer can hold without precision loss.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Options for opening the embedded engine.
#[derive(Debug, Clone, Default)]
pub struct DuckDbConfig {
    /// Directory for the persistent database file. In-memory when absent.
    pub storage_dir: Option<PathBuf>,
    /// Loadable GDX reader extension, handed to `LOAD`.
    pub gdx_extension_path: Option<PathBuf>,
}

/// The embedded DuckDB engine.
pub struct DuckDbEngine {
    main: Mutex<Option<Connection>>,
    db_path: Option<PathBuf>,
    config: DuckDbConfig,
    blob_dir: PathBuf,
}

impl DuckDbEngine {
    /// Open a database (persistent file or in-memory), load the
    /// required extensions, and run a warmup statement.
    pub fn initialize(config: DuckDbConfig) -> EngineResult<Self> {
        let (conn, db_path) = match &config.storage_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::transient(format!(
                        "failed to create storage directory {}: {e}",
                        dir.display()
                    ))
                })?;
                let path = dir.join(format!("gdx-viewer-{}.duckdb", Uuid::new_v4()));
                let conn = Connection::open(&path).map_err(engine_err)?;
                (conn, Some(path))
            }
            None => (Connection::open_in_memory().map_err(engine_err)?, None),
        };

        load_extensions(&conn, &config);

        // Warmup so the first real statement does not pay init cost.
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
            .map_err(engine_err)?;

        let blob_dir = std::env::temp_dir().join("gdxview-blobs");
        fs::create_dir_all(&blob_dir).map_err(|e| {
            EngineError::transient(format!("failed to create blob directory: {e}"))
        })?;

        debug!(
            db = %db_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".to_string()),
            "Engine initialized"
        );

        Ok(Self {
            main: Mutex::new(Some(conn)),
            db_path,
            config,
            blob_dir,
        })
    }

    /// Path of the persistent database file, if any.
    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    fn with_main<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let guard = self.main.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| EngineError::transient("engine has been disposed"))?;
        f(conn)
    }
}

impl Engine for DuckDbEngine {
    fn run(&self, sql: &str) -> EngineResult<()> {
        self.with_main(|conn| conn.execute_batch(sql).map_err(engine_err))
    }

    fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        self.with_main(|conn| collect_rows(conn, sql))
    }

    fn background_connection(&self) -> EngineResult<Arc<dyn EngineConnection>> {
        let conn = self.with_main(|main| main.try_clone().map_err(engine_err))?;
        // The clone starts without the session-local extension state.
        if let Some(path) = &self.config.gdx_extension_path {
            conn.execute_batch(&format!("LOAD {};", quote_literal(&path.to_string_lossy())))
                .map_err(engine_err)?;
        }
        let interrupt = conn.interrupt_handle();
        Ok(Arc::new(DuckDbConnection {
            conn: Mutex::new(conn),
            interrupt,
        }))
    }

    fn register_blob(&self, name: &str, bytes: &[u8]) -> EngineResult<PathBuf> {
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let file = tempfile::Builder::new()
            .prefix(&format!("{sanitized}-"))
            .suffix(".gdx")
            .tempfile_in(&self.blob_dir)
            .map_err(|e| EngineError::transient(format!("failed to stage blob: {e}")))?;
        let (mut handle, temp_path) = file.into_parts();
        handle
            .write_all(bytes)
            .and_then(|()| handle.flush())
            .map_err(|e| EngineError::transient(format!("failed to write blob: {e}")))?;
        drop(handle);
        temp_path
            .keep()
            .map_err(|e| EngineError::transient(format!("failed to keep blob file: {e}")))
    }

    fn dispose(&self) {
        if let Some(conn) = self.main.lock().take() {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close engine connection: {}", e);
            }
        }
        if let Some(path) = &self.db_path {
            let wal = PathBuf::from(format!("{}.wal", path.display()));
            for file in [path, &wal] {
                match fs::remove_file(file) {
                    Ok(()) => debug!("Removed {}", file.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
                }
            }
        }
    }
}

/// Interruptible cloned connection used by background materialization.
struct DuckDbConnection {
    conn: Mutex<Connection>,
    interrupt: Arc<InterruptHandle>,
}

impl EngineConnection for DuckDbConnection {
    fn run(&self, sql: &str) -> EngineResult<()> {
        self.conn.lock().execute_batch(sql).map_err(engine_err)
    }

    fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        collect_rows(&self.conn.lock(), sql)
    }

    fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    fn progress(&self) -> Option<QueryProgress> {
        // The bindings do not surface per-statement progress; callers
        // fall back to their own estimate.
        None
    }
}

/// Factory handing out fresh engines; each one gets its own database
/// file name so a recovery reset never reuses an invalidated file.
pub struct DuckDbEngineFactory {
    config: DuckDbConfig,
}

impl DuckDbEngineFactory {
    pub fn new(config: DuckDbConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for DuckDbEngineFactory {
    fn create(&self) -> EngineResult<Arc<dyn Engine>> {
        Ok(Arc::new(DuckDbEngine::initialize(self.config.clone())?))
    }
}

fn load_extensions(conn: &Connection, config: &DuckDbConfig) {
    // XLSX export support; CSV and Parquet are built in.
    if let Err(e) = conn.execute_batch("INSTALL excel; LOAD excel;") {
        warn!("Excel extension unavailable, XLSX export disabled: {}", e);
    }
    if let Some(path) = &config.gdx_extension_path {
        let stmt = format!("LOAD {};", quote_literal(&path.to_string_lossy()));
        if let Err(e) = conn.execute_batch(&stmt) {
            warn!(
                "Failed to load GDX reader extension from {}: {}",
                path.display(),
                e
            );
        }
    }
}

fn engine_err(e: duckdb::Error) -> EngineError {
    EngineError::classify(e.to_string())
}

fn collect_rows(conn: &Connection, sql: &str) -> EngineResult<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(engine_err)?;
    let mut rows = stmt.query([]).map_err(engine_err)?;
    let columns: Vec<String> = rows
        .as_ref()
        .map(|s| s.column_names().into_iter().map(Into::into).collect())
        .unwrap_or_default();

    let mut collected = Vec::new();
    while let Some(row) = rows.next().map_err(engine_err)? {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            let value: DuckValue = row.get(i).map_err(engine_err)?;
            object.insert(name.clone(), duck_value_to_json(value));
        }
        collected.push(object);
    }

    Ok(QueryResult {
        columns,
        rows: collected,
    })
}

fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(v) => Value::from(v),
        DuckValue::SmallInt(v) => Value::from(v),
        DuckValue::Int(v) => Value::from(v),
        DuckValue::BigInt(v) => json_int(v),
        DuckValue::HugeInt(v) => {
            if v >= -(MAX_SAFE_INTEGER as i128) && v <= MAX_SAFE_INTEGER as i128 {
                Value::from(v as i64)
            } else {
                json_float(v as f64)
            }
        }
        DuckValue::UTinyInt(v) => Value::from(v),
        DuckValue::USmallInt(v) => Value::from(v),
        DuckValue::UInt(v) => Value::from(v),
        DuckValue::UBigInt(v) => {
            if v <= MAX_SAFE_INTEGER as u64 {
                Value::from(v)
            } else {
                json_float(v as f64)
            }
        }
        DuckValue::Float(v) => json_float(f64::from(v)),
        DuckValue::Double(v) => json_float(v),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(json_float)
            .unwrap_or_else(|_| Value::String(d.to_string())),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::List(items) => {
            Value::Array(items.into_iter().map(duck_value_to_json).collect())
        }
        other => Value::String(format!("{other:?}")),
    }
}

/// 64-bit integers above 2^53 are coerced lossily, matching what a
/// JSON consumer could represent anyway.
fn json_int(v: i64) -> Value {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&v) {
        Value::from(v)
    } else {
        json_float(v as f64)
    }
}

/// Non-finite doubles have no JSON encoding; surface them with the
/// engine's VARCHAR spelling so special values stay recognizable.
fn json_float(v: f64) -> Value {
    match serde_json::Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None if v.is_nan() => Value::String("NaN".to_string()),
        None if v > 0.0 => Value::String("Infinity".to_string()),
        None => Value::String("-Infinity".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_in_memory_and_query() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        let result = engine
            .query("SELECT 1::BIGINT AS n, 'x' AS label, 2.5::DOUBLE AS v")
            .unwrap();
        assert_eq!(result.columns, vec!["n", "label", "v"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["n"], serde_json::json!(1));
        assert_eq!(result.rows[0]["label"], serde_json::json!("x"));
        assert_eq!(result.rows[0]["v"], serde_json::json!(2.5));
    }

    #[test]
    fn run_executes_statements() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        engine
            .run("CREATE TABLE t(a INTEGER); INSERT INTO t VALUES (1), (2);")
            .unwrap();
        let result = engine.query("SELECT COUNT(*) AS n FROM t").unwrap();
        assert_eq!(result.scalar_u64(), Some(2));
    }

    #[test]
    fn background_connection_sees_committed_tables() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        engine.run("CREATE TABLE shared(a INTEGER)").unwrap();
        let bg = engine.background_connection().unwrap();
        bg.run("INSERT INTO shared VALUES (7)").unwrap();
        let result = engine.query("SELECT a FROM shared").unwrap();
        assert_eq!(result.rows[0]["a"], serde_json::json!(7));
    }

    #[test]
    fn infinity_surfaces_as_varchar_spelling() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        let result = engine
            .query("SELECT 'Infinity'::DOUBLE AS pos, '-Infinity'::DOUBLE AS neg")
            .unwrap();
        assert_eq!(result.rows[0]["pos"], serde_json::json!("Infinity"));
        assert_eq!(result.rows[0]["neg"], serde_json::json!("-Infinity"));
    }

    #[test]
    fn large_bigint_is_coerced() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        let result = engine
            .query("SELECT 9223372036854775807::BIGINT AS big")
            .unwrap();
        // Above 2^53: coerced, so it is a float now.
        assert!(result.rows[0]["big"].is_f64());
    }

    #[test]
    fn register_blob_stages_readable_file() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        let path = engine.register_blob("model.gdx", b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn dispose_removes_persistent_files() {
        let dir = TempDir::new().unwrap();
        let engine = DuckDbEngine::initialize(DuckDbConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            gdx_extension_path: None,
        })
        .unwrap();
        let db_path = engine.db_path().unwrap().clone();
        assert!(db_path.exists());
        engine.dispose();
        assert!(!db_path.exists());
    }

    #[test]
    fn error_classification_flows_through_query() {
        let engine = DuckDbEngine::initialize(DuckDbConfig::default()).unwrap();
        let err = engine.query("SELECT * FROM missing_table").unwrap_err();
        assert!(!err.is_fatal());
    }
}
