//! Scriptable in-process engine used by the test suite.
//!
//! Statements are matched by substring against a script table and
//! answered with canned rows. The controller can inject one-shot
//! failures, hold a matching statement open until released or
//! interrupted, and inspect the exact statement sequence the server
//! ran, which is how the serialization and recovery properties are
//! asserted.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use super::traits::{
    Engine, EngineConnection, EngineError, EngineFactory, EngineResult, QueryProgress, QueryResult,
};

#[derive(Clone)]
struct Script {
    pattern: String,
    result: QueryResult,
}

#[derive(Default)]
struct GateState {
    pattern: Option<String>,
    held: bool,
    released: bool,
    interrupted: bool,
}

#[derive(Default)]
struct Gate {
    state: StdMutex<GateState>,
    condvar: Condvar,
}

impl Gate {
    /// Block the calling statement while it matches the held pattern.
    /// Returns an error when the hold ends via interrupt.
    fn pass(&self, sql: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let matches = state
            .pattern
            .as_ref()
            .map(|p| sql.contains(p.as_str()))
            .unwrap_or(false);
        if !matches {
            return Ok(());
        }
        state.held = true;
        self.condvar.notify_all();
        while !state.released && !state.interrupted {
            state = self.condvar.wait(state).unwrap();
        }
        let interrupted = state.interrupted;
        *state = GateState::default();
        self.condvar.notify_all();
        if interrupted {
            Err(EngineError::transient("INTERRUPT Error: query interrupted"))
        } else {
            Ok(())
        }
    }

    fn hold_on(&self, pattern: &str) {
        let mut state = self.state.lock().unwrap();
        *state = GateState {
            pattern: Some(pattern.to_string()),
            ..GateState::default()
        };
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.released = true;
        self.condvar.notify_all();
    }

    fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        if state.pattern.is_some() {
            state.interrupted = true;
            self.condvar.notify_all();
        }
    }

    fn wait_until_held(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, result) = self
            .condvar
            .wait_timeout_while(state, timeout, |s| !s.held)
            .unwrap();
        drop(state);
        !result.timed_out()
    }
}

#[derive(Default)]
struct StubState {
    scripts: Mutex<Vec<Script>>,
    failures: Mutex<VecDeque<(String, EngineError)>>,
    log: Mutex<Vec<String>>,
    progress: Mutex<Option<QueryProgress>>,
    gate: Gate,
    engines_created: AtomicUsize,
    engines_disposed: AtomicUsize,
}

impl StubState {
    fn record(&self, sql: &str) {
        self.log.lock().push(sql.to_string());
    }

    fn injected_failure(&self, sql: &str) -> Option<EngineError> {
        let mut failures = self.failures.lock();
        let index = failures.iter().position(|(p, _)| sql.contains(p.as_str()))?;
        failures.remove(index).map(|(_, e)| e)
    }

    fn execute(&self, sql: &str) -> EngineResult<QueryResult> {
        self.record(sql);
        if let Some(err) = self.injected_failure(sql) {
            return Err(err);
        }
        self.gate.pass(sql)?;
        let scripts = self.scripts.lock();
        Ok(scripts
            .iter()
            .find(|s| sql.contains(s.pattern.as_str()))
            .map(|s| s.result.clone())
            .unwrap_or_default())
    }
}

/// Handle for scripting and inspecting stub engines.
///
/// All engines created from one controller share the script table and
/// the statement log; each created engine is a fresh generation, which
/// is what the recovery path expects from the factory.
#[derive(Clone, Default)]
pub struct StubController {
    state: Arc<StubState>,
}

impl StubController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a canned result for any statement containing `pattern`.
    /// Earlier scripts win when several match.
    pub fn on_query(&self, pattern: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|cells| {
                let mut object = serde_json::Map::new();
                for (name, cell) in columns.iter().zip(cells) {
                    object.insert(name.clone(), cell);
                }
                object
            })
            .collect();
        self.state.scripts.lock().push(Script {
            pattern: pattern.to_string(),
            result: QueryResult { columns, rows },
        });
    }

    /// Fail the next statement containing `pattern`, once.
    pub fn fail_once(&self, pattern: &str, error: EngineError) {
        self.state
            .failures
            .lock()
            .push_back((pattern.to_string(), error));
    }

    /// Block the next statement containing `pattern` until
    /// [`release`](Self::release) or an interrupt.
    pub fn hold_on(&self, pattern: &str) {
        self.state.gate.hold_on(pattern);
    }

    /// Release a held statement so it completes normally.
    pub fn release(&self) {
        self.state.gate.release();
    }

    /// Wait until a statement is blocked on the hold gate.
    pub fn wait_until_held(&self, timeout: Duration) -> bool {
        self.state.gate.wait_until_held(timeout)
    }

    /// Script the progress that background connections report.
    pub fn set_progress(&self, progress: Option<QueryProgress>) {
        *self.state.progress.lock() = progress;
    }

    /// Every statement executed so far, in order, across connections.
    pub fn executed(&self) -> Vec<String> {
        self.state.log.lock().clone()
    }

    pub fn engines_created(&self) -> usize {
        self.state.engines_created.load(Ordering::SeqCst)
    }

    pub fn engines_disposed(&self) -> usize {
        self.state.engines_disposed.load(Ordering::SeqCst)
    }

    /// A fresh engine generation sharing this controller's scripts.
    pub fn engine(&self) -> Arc<dyn Engine> {
        self.state.engines_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(StubEngine {
            state: self.state.clone(),
        })
    }

    /// A factory whose engines all share this controller's scripts.
    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        Arc::new(StubEngineFactory {
            controller: self.clone(),
        })
    }
}

struct StubEngine {
    state: Arc<StubState>,
}

impl Engine for StubEngine {
    fn run(&self, sql: &str) -> EngineResult<()> {
        self.state.execute(sql).map(|_| ())
    }

    fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        self.state.execute(sql)
    }

    fn background_connection(&self) -> EngineResult<Arc<dyn EngineConnection>> {
        Ok(Arc::new(StubConnection {
            state: self.state.clone(),
        }))
    }

    fn register_blob(&self, name: &str, bytes: &[u8]) -> EngineResult<PathBuf> {
        let dir = std::env::temp_dir().join("gdxview-stub-blobs");
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::transient(format!("failed to stage blob: {e}")))?;
        let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), name.replace('/', "_")));
        std::fs::write(&path, bytes)
            .map_err(|e| EngineError::transient(format!("failed to write blob: {e}")))?;
        Ok(path)
    }

    fn dispose(&self) {
        self.state.engines_disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct StubConnection {
    state: Arc<StubState>,
}

impl EngineConnection for StubConnection {
    fn run(&self, sql: &str) -> EngineResult<()> {
        self.state.execute(sql).map(|_| ())
    }

    fn query(&self, sql: &str) -> EngineResult<QueryResult> {
        self.state.execute(sql)
    }

    fn interrupt(&self) {
        self.state.gate.interrupt();
    }

    fn progress(&self) -> Option<QueryProgress> {
        *self.state.progress.lock()
    }
}

struct StubEngineFactory {
    controller: StubController,
}

impl EngineFactory for StubEngineFactory {
    fn create(&self) -> EngineResult<Arc<dyn Engine>> {
        Ok(self.controller.engine())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scripted_query_matches_by_substring() {
        let stub = StubController::new();
        stub.on_query("gdx_symbols", &["name"], vec![vec![json!("x")]]);
        let engine = stub.engine();
        let result = engine
            .query("SELECT * FROM gdx_symbols('/tmp/a.gdx')")
            .unwrap();
        assert_eq!(result.rows[0]["name"], json!("x"));
        assert_eq!(stub.executed().len(), 1);
    }

    #[test]
    fn unmatched_statement_returns_empty_result() {
        let stub = StubController::new();
        let engine = stub.engine();
        let result = engine.query("SELECT 1").unwrap();
        assert!(result.rows.is_empty());
    }

    #[test]
    fn injected_failure_fires_once() {
        let stub = StubController::new();
        stub.fail_once(
            "COUNT",
            EngineError::classify("database has been invalidated"),
        );
        let engine = stub.engine();
        assert!(engine.query("SELECT COUNT(*) FROM t").unwrap_err().is_fatal());
        assert!(engine.query("SELECT COUNT(*) FROM t").is_ok());
    }

    #[test]
    fn interrupt_breaks_a_held_statement() {
        let stub = StubController::new();
        stub.hold_on("CREATE OR REPLACE TABLE");
        let engine = stub.engine();
        let conn = engine.background_connection().unwrap();

        let worker = {
            let conn = conn.clone();
            std::thread::spawn(move || conn.run("CREATE OR REPLACE TABLE \"t\" AS SELECT 1"))
        };
        assert!(stub.wait_until_held(Duration::from_secs(1)));
        conn.interrupt();
        let result = worker.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn release_lets_a_held_statement_finish() {
        let stub = StubController::new();
        stub.hold_on("CREATE");
        let engine = stub.engine();
        let conn = engine.background_connection().unwrap();

        let worker = {
            let conn = conn.clone();
            std::thread::spawn(move || conn.run("CREATE TABLE t AS SELECT 1"))
        };
        assert!(stub.wait_until_held(Duration::from_secs(1)));
        stub.release();
        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn factory_counts_generations() {
        let stub = StubController::new();
        let factory = stub.factory();
        let first = factory.create().unwrap();
        let _second = factory.create().unwrap();
        first.dispose();
        assert_eq!(stub.engines_created(), 2);
        assert_eq!(stub.engines_disposed(), 1);
    }
}
