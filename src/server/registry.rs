//! Document Registry
//!
//! Holds the per-document state: resolved path, symbol catalog, and the
//! map of materialized symbols. The registry is a state container; the
//! engine-touching orchestration (resolving, dropping tables, the
//! force-reload reset) lives in the request handler.

use std::collections::HashMap;
use std::path::PathBuf;

use dashmap::DashMap;
use tracing::debug;

use crate::types::{DocumentId, MaterializedSymbol, Symbol};

/// State of one open document.
#[derive(Debug, Clone)]
pub struct DocumentState {
    /// The source string the client supplied.
    pub source: String,
    /// Resolved local path handed to the GDX reader.
    pub local_path: PathBuf,
    /// Symbol catalog as of the last (re)load.
    pub symbols: Vec<Symbol>,
    /// Symbol name → cached table.
    pub materialized: HashMap<String, MaterializedSymbol>,
}

impl DocumentState {
    pub fn new(source: String, local_path: PathBuf, symbols: Vec<Symbol>) -> Self {
        Self {
            source,
            local_path,
            symbols,
            materialized: HashMap::new(),
        }
    }
}

/// Registry of open documents keyed by document id.
#[derive(Default)]
pub struct DocumentRegistry {
    documents: DashMap<DocumentId, DocumentState>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document_id: &str, state: DocumentState) {
        self.documents.insert(document_id.to_string(), state);
    }

    pub fn remove(&self, document_id: &str) -> Option<DocumentState> {
        self.documents.remove(document_id).map(|(_, state)| state)
    }

    pub fn get(&self, document_id: &str) -> Option<DocumentState> {
        self.documents.get(document_id).map(|s| s.value().clone())
    }

    pub fn is_open(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.documents.iter().map(|e| e.key().clone()).collect()
    }

    pub fn symbol(&self, document_id: &str, symbol_name: &str) -> Option<Symbol> {
        self.documents
            .get(document_id)?
            .symbols
            .iter()
            .find(|s| s.name == symbol_name)
            .cloned()
    }

    pub fn is_materialized(&self, document_id: &str, symbol_name: &str) -> bool {
        self.documents
            .get(document_id)
            .map(|s| s.materialized.contains_key(symbol_name))
            .unwrap_or(false)
    }

    pub fn materialized(&self, document_id: &str, symbol_name: &str) -> Option<MaterializedSymbol> {
        self.documents
            .get(document_id)?
            .materialized
            .get(symbol_name)
            .cloned()
    }

    pub fn columns_of(&self, document_id: &str, symbol_name: &str) -> Option<Vec<String>> {
        self.materialized(document_id, symbol_name).map(|m| m.columns)
    }

    pub fn table_name_of(&self, document_id: &str, symbol_name: &str) -> Option<String> {
        self.materialized(document_id, symbol_name)
            .map(|m| m.table_name)
    }

    /// Record a completed materialization. Ignored when the document was
    /// closed while the build was in flight.
    pub fn record_materialized(
        &self,
        document_id: &str,
        symbol_name: &str,
        materialized: MaterializedSymbol,
    ) -> bool {
        match self.documents.get_mut(document_id) {
            Some(mut state) => {
                state
                    .materialized
                    .insert(symbol_name.to_string(), materialized);
                true
            }
            None => {
                debug!(
                    "Dropping materialization record for closed document {}",
                    document_id
                );
                false
            }
        }
    }

    /// Drop one document's materialized map, returning the evicted
    /// entries so the caller can drop their tables.
    pub fn clear_materialized(&self, document_id: &str) -> Vec<MaterializedSymbol> {
        self.documents
            .get_mut(document_id)
            .map(|mut state| state.materialized.drain().map(|(_, m)| m).collect())
            .unwrap_or_default()
    }

    /// Clear every document's materialized map. Used when the engine is
    /// reset and all tables are gone regardless.
    pub fn clear_all_materialized(&self) -> usize {
        let mut cleared = 0;
        for mut entry in self.documents.iter_mut() {
            cleared += entry.materialized.len();
            entry.materialized.clear();
        }
        cleared
    }

    /// Replace a document's path and catalog after a reload; the
    /// materialized map starts empty again.
    pub fn update_after_reload(
        &self,
        document_id: &str,
        local_path: PathBuf,
        symbols: Vec<Symbol>,
    ) {
        if let Some(mut state) = self.documents.get_mut(document_id) {
            state.local_path = local_path;
            state.symbols = symbols;
            state.materialized.clear();
        }
    }
}
