//! Server-side error type and message sanitization.

use crate::engine::EngineError;
use crate::resolver::ResolveError;

use super::protocol::{ErrorCode, RpcError};

/// Fixed message surfaced whenever the engine reports invalidation.
pub const FRIENDLY_FATAL_MESSAGE: &str = "The GDX file could not be read. It may have been \
     modified or deleted externally. The viewer will attempt to recover automatically.";

/// Longest error message surfaced to clients, in characters.
const MAX_MESSAGE_CHARS: usize = 500;

/// Errors produced by request handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Document not open: {0}")]
    NotFound(String),

    #[error("Symbol '{symbol}' is not materialized for document '{document}'")]
    NotMaterialized { document: String, symbol: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(document_id: impl Into<String>) -> Self {
        Self::NotFound(document_id.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::NotMaterialized { .. } => ErrorCode::NotMaterialized,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Engine(e) if e.is_fatal() => ErrorCode::FatalEngine,
            Self::Engine(_) => ErrorCode::TransientEngine,
        }
    }

    pub fn is_fatal_engine(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_fatal())
    }

    /// Convert to the wire error payload, sanitizing the message.
    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: sanitize_error_message(&self.to_string()),
        }
    }
}

impl From<ResolveError> for ServerError {
    fn from(e: ResolveError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

/// Sanitize an error string before it reaches a client.
///
/// Fatal-pattern messages collapse to a fixed friendly sentence. For
/// everything else: drop text from `Stack Trace:` onward, drop
/// engine frame lines, and bound the length.
pub fn sanitize_error_message(raw: &str) -> String {
    if raw
        .to_lowercase()
        .contains(crate::engine::FATAL_ENGINE_PATTERN)
    {
        return FRIENDLY_FATAL_MESSAGE.to_string();
    }

    let before_trace = match raw.find("Stack Trace:") {
        Some(index) => &raw[..index],
        None => raw,
    };

    let kept: Vec<&str> = before_trace
        .lines()
        .filter(|line| !is_frame_line(line))
        .collect();
    let message = kept.join("\n");
    let message = message.trim();

    if message.chars().count() > MAX_MESSAGE_CHARS {
        let mut truncated: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
        truncated.push('…');
        truncated
    } else {
        message.to_string()
    }
}

/// Matches `^\d+\s+(native::|0x)`, the shape of a stack frame line.
fn is_frame_line(line: &str) -> bool {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let rest = &line[digits..];
    let spaces = rest.chars().take_while(|c| c.is_whitespace()).count();
    if spaces == 0 {
        return false;
    }
    let rest = rest.trim_start();
    rest.starts_with("native::") || rest.starts_with("0x")
}
