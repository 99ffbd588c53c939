//! Engine trait definitions.
//!
//! The server talks to the embedded analytics engine exclusively through
//! these traits. All calls are blocking; async callers run them inside
//! `tokio::task::spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

/// Message fragment that marks the engine as unrecoverable.
pub const FATAL_ENGINE_PATTERN: &str = "database has been invalidated";

/// Errors raised by the embedded engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The engine is in an unrecoverable state; callers must tear it
    /// down and start over.
    #[error("{message}")]
    Fatal { message: String },

    /// Any other engine error, propagated verbatim.
    #[error("{message}")]
    Transient { message: String },
}

impl EngineError {
    /// Classify a raw engine message: fatal iff it contains the
    /// invalidation pattern (case-insensitive).
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains(FATAL_ENGINE_PATTERN) {
            Self::Fatal { message }
        } else {
            Self::Transient { message }
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Fatal { message } | Self::Transient { message } => message,
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Rows returned by a query, with column order preserved.
///
/// Each row is an ordered map keyed by column name. 64-bit integers are
/// coerced to a JSON number; magnitudes above 2^53 lose precision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First cell of the first row, if any. Convenience for scalar
    /// queries such as `COUNT(*)`.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.values().next())
    }

    /// First cell of the first row as u64, when it is one.
    pub fn scalar_u64(&self) -> Option<u64> {
        match self.scalar()? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            _ => None,
        }
    }
}

/// Progress of an in-flight statement on a background connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryProgress {
    pub rows_processed: u64,
    pub percentage: Option<f64>,
}

/// An independent engine connection whose statements may be interrupted.
///
/// A background connection is exclusive to one materialization at a
/// time. `interrupt` may be called from any thread while a statement is
/// in flight on another.
pub trait EngineConnection: Send + Sync {
    /// Execute a statement without materializing rows.
    fn run(&self, sql: &str) -> EngineResult<()>;

    /// Execute a query and collect its rows.
    fn query(&self, sql: &str) -> EngineResult<QueryResult>;

    /// Abort the statement currently executing on this connection.
    /// Idempotent; a no-op when nothing is running.
    fn interrupt(&self);

    /// Progress of the in-flight statement, when the engine exposes it.
    fn progress(&self) -> Option<QueryProgress>;
}

/// The embedded analytics engine.
pub trait Engine: Send + Sync {
    /// Execute a statement on the main connection.
    fn run(&self, sql: &str) -> EngineResult<()>;

    /// Execute a query on the main connection.
    fn query(&self, sql: &str) -> EngineResult<QueryResult>;

    /// Open an independent, interruptible connection for background
    /// work. The GDX reader is available on the returned connection.
    fn background_connection(&self) -> EngineResult<Arc<dyn EngineConnection>>;

    /// Stage bytes as a file the engine can read; returns its path.
    ///
    /// Staged files outlive the engine instance (the caller owns their
    /// cleanup), so documents backed by them stay valid across an
    /// engine reset.
    fn register_blob(&self, name: &str, bytes: &[u8]) -> EngineResult<PathBuf>;

    /// Close all connections and delete any persistent database files,
    /// including write-ahead logs.
    fn dispose(&self);
}

/// Creates engine instances; used at startup and by the recovery path
/// to replace an invalidated engine with a fresh one.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> EngineResult<Arc<dyn Engine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_fatal_pattern_case_insensitive() {
        let err = EngineError::classify("FATAL: Database Has Been Invalidated!");
        assert!(err.is_fatal());

        let err = EngineError::classify("Binder Error: no such table");
        assert!(!err.is_fatal());
    }

    #[test]
    fn classify_keeps_message_verbatim() {
        let err = EngineError::classify("IO Error: file missing");
        assert_eq!(err.message(), "IO Error: file missing");
        assert_eq!(err.to_string(), "IO Error: file missing");
    }

    #[test]
    fn scalar_u64_reads_first_cell() {
        let mut row = serde_json::Map::new();
        row.insert("n".to_string(), serde_json::json!(6));
        let result = QueryResult {
            columns: vec!["n".to_string()],
            rows: vec![row],
        };
        assert_eq!(result.scalar_u64(), Some(6));
        assert_eq!(result.row_count(), 1);
    }

    #[test]
    fn scalar_of_empty_result_is_none() {
        assert!(QueryResult::default().scalar().is_none());
        assert_eq!(QueryResult::default().scalar_u64(), None);
    }
}
