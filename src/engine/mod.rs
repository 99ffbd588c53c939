//! Embedded analytics engine boundary.
//!
//! The server depends only on the [`Engine`] traits; `duckdb` provides
//! the production implementation, `stub` a scriptable one for tests.

pub mod duckdb;
pub mod stub;
pub mod traits;

pub use self::duckdb::{DuckDbConfig, DuckDbEngine, DuckDbEngineFactory};
pub use self::stub::StubController;
pub use self::traits::{
    Engine, EngineConnection, EngineError, EngineFactory, EngineResult, QueryProgress, QueryResult,
    FATAL_ENGINE_PATTERN,
};
