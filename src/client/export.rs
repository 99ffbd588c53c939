//! Export statement construction.
//!
//! Export goes through `executeQuery` as a `COPY (…) TO '…'` statement;
//! there is no dedicated server method. The user's current query drives
//! the export, minus its pagination clauses, so the whole filtered
//! result lands in the file rather than the visible page.

use std::path::Path;

use crate::filter::quote_literal;

/// Supported export file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Parquet,
    Xlsx,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
            Self::Xlsx => "xlsx",
        }
    }

    /// Pick a format from a file extension, if it is one we can write.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "parquet" => Some(Self::Parquet),
            "xlsx" => Some(Self::Xlsx),
            _ => None,
        }
    }
}

/// Build the `COPY` statement exporting `query` to `path`.
pub fn build_export_statement(query: &str, path: &Path, format: ExportFormat) -> String {
    format!(
        "COPY ({}) TO {} (FORMAT '{}')",
        strip_pagination(query),
        quote_literal(&path.to_string_lossy()),
        format.as_str(),
    )
}

/// Remove trailing `LIMIT n [OFFSET m]` / `OFFSET m` from a query.
///
/// Only the outermost, trailing clauses are touched; pagination inside
/// subqueries is part of the query's meaning and stays.
pub fn strip_pagination(query: &str) -> String {
    let mut remaining = query.trim().trim_end_matches(';').trim_end();

    // At most one OFFSET then one LIMIT can trail the query.
    if let Some(stripped) = strip_trailing_clause(remaining, "OFFSET") {
        remaining = stripped;
    }
    if let Some(stripped) = strip_trailing_clause(remaining, "LIMIT") {
        remaining = stripped;
    }
    remaining.to_string()
}

/// Strip a trailing `<keyword> <integer>` clause, case-insensitively.
fn strip_trailing_clause<'a>(query: &'a str, keyword: &str) -> Option<&'a str> {
    let trimmed = query.trim_end();
    let (head, last) = trimmed.rsplit_once(char::is_whitespace)?;
    if last.is_empty() || !last.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let head = head.trim_end();
    let (rest, candidate) = head.rsplit_once(char::is_whitespace)?;
    if !candidate.eq_ignore_ascii_case(keyword) {
        return None;
    }
    Some(rest.trim_end())
}
