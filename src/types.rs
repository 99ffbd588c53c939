//! Core types shared between the server and client sides.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque client-supplied document identifier.
///
/// The server never interprets it; the same underlying source may be
/// open under several document ids at once.
pub type DocumentId = String;

/// Classification of a symbol inside a GDX file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolType {
    Set,
    Parameter,
    Variable,
    Equation,
    Alias,
    Other,
}

impl SymbolType {
    /// Parse the type string reported by `gdx_symbols()`.
    ///
    /// Unknown strings map to `Other` rather than failing; GDX files in
    /// the wild carry a handful of vendor-specific type labels.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "set" => Self::Set,
            "parameter" => Self::Parameter,
            "variable" => Self::Variable,
            "equation" => Self::Equation,
            "alias" => Self::Alias,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Parameter => "parameter",
            Self::Variable => "variable",
            Self::Equation => "equation",
            Self::Alias => "alias",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named tabular object inside a GDX file, as listed by the
/// symbol catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub name: String,
    #[serde(rename = "type")]
    pub symbol_type: SymbolType,
    pub dimension_count: u32,
    pub record_count: u64,
}

/// A symbol fully cached as a table inside the embedded engine.
///
/// `table_name` exists as a real table exactly as long as this record
/// is held by a document's materialized map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedSymbol {
    pub table_name: String,
    pub columns: Vec<String>,
    pub total_row_count: u64,
}

/// Derive the engine table name for a (document, symbol) pair.
///
/// The document part is restricted to `[A-Za-z0-9_]` so the name stays
/// a plain identifier; the symbol part is preserved verbatim and
/// escaped at the quoting layer instead.
pub fn table_name_for(document_id: &str, symbol_name: &str) -> String {
    let sanitized: String = document_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{}__{}", sanitized, symbol_name)
}
