//! Column filter model and SQL compilation.
//!
//! Filters arrive over the wire as a tagged union discriminated by the
//! presence of the `exclude` field (numeric) versus `selectedValues`
//! (text). They are parsed into a proper enum here and compiled to a
//! `WHERE` fragment. The compiler is pure; it never touches the engine.

use serde::{Deserialize, Serialize};

/// A filter applied to one column of a materialized symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub column_name: String,
    pub filter_value: FilterValue,
}

/// Text or numeric filter payload.
///
/// Deserialization tries the numeric shape first: a numeric filter
/// always carries `exclude`, a text filter always carries
/// `selectedValues`, so the untagged match is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Numeric(NumericFilter),
    Text(TextFilter),
}

/// Keep rows whose column value is in the selected set.
///
/// An empty selection means the column is unfiltered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFilter {
    pub selected_values: Vec<String>,
}

/// Range plus special-value visibility for a numeric column.
///
/// `show_acronyms` is carried for wire compatibility but has no effect
/// on the compiled SQL: acronym cells have no stable textual label at
/// the engine boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub exclude: bool,
    #[serde(default = "default_true")]
    pub show_eps: bool,
    #[serde(default = "default_true")]
    pub show_na: bool,
    #[serde(default = "default_true")]
    pub show_pos_inf: bool,
    #[serde(default = "default_true")]
    pub show_neg_inf: bool,
    #[serde(default = "default_true")]
    pub show_undf: bool,
    #[serde(default = "default_true")]
    pub show_acronyms: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NumericFilter {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
            exclude: false,
            show_eps: true,
            show_na: true,
            show_pos_inf: true,
            show_neg_inf: true,
            show_undf: true,
            show_acronyms: true,
        }
    }
}

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal with single quotes, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Compile an ordered filter list to a `WHERE` fragment.
///
/// Returns the empty string when no filter contributes a clause.
/// Contributing clauses are conjoined with `AND`.
pub fn compile_where(filters: &[Filter]) -> String {
    compile_where_excluding(filters, None)
}

/// Like [`compile_where`], but skips the filter on `excluded_column`.
///
/// This is the cross-filtering entry point: a dropdown shows the
/// feasible domain under every *other* active filter, never its own.
pub fn compile_where_excluding(filters: &[Filter], excluded_column: Option<&str>) -> String {
    let clauses: Vec<String> = filters
        .iter()
        .filter(|f| excluded_column != Some(f.column_name.as_str()))
        .filter_map(compile_filter)
        .collect();
    clauses.join(" AND ")
}

fn compile_filter(filter: &Filter) -> Option<String> {
    match &filter.filter_value {
        FilterValue::Text(text) => compile_text(&filter.column_name, text),
        FilterValue::Numeric(numeric) => compile_numeric(&filter.column_name, numeric),
    }
}

fn compile_text(column: &str, filter: &TextFilter) -> Option<String> {
    if filter.selected_values.is_empty() {
        return None;
    }
    let list: Vec<String> = filter
        .selected_values
        .iter()
        .map(|v| quote_literal(v))
        .collect();
    Some(format!("{} IN ({})", quote_ident(column), list.join(",")))
}

fn compile_numeric(column: &str, filter: &NumericFilter) -> Option<String> {
    let ident = quote_ident(column);
    let mut conjuncts: Vec<String> = Vec::new();

    if !filter.show_pos_inf {
        conjuncts.push(format!("{ident} != CAST('Infinity' AS DOUBLE)"));
    }
    if !filter.show_neg_inf {
        conjuncts.push(format!("{ident} != CAST('-Infinity' AS DOUBLE)"));
    }

    // Specials that surface as text labels in the value column.
    let mut hidden_labels: Vec<&str> = Vec::new();
    if !filter.show_eps {
        hidden_labels.push("EPS");
    }
    if !filter.show_na {
        hidden_labels.push("NA");
    }
    if !filter.show_undf {
        hidden_labels.push("UNDF");
    }
    if !hidden_labels.is_empty() {
        let list: Vec<String> = hidden_labels.iter().map(|l| quote_literal(l)).collect();
        conjuncts.push(format!(
            "CAST({ident} AS VARCHAR) NOT IN ({})",
            list.join(",")
        ));
    }

    if let Some(min) = filter.min {
        conjuncts.push(format!("{ident} >= {min}"));
    }
    if let Some(max) = filter.max {
        conjuncts.push(format!("{ident} <= {max}"));
    }

    if conjuncts.is_empty() {
        return None;
    }

    let body = conjuncts.join(" AND ");
    if filter.exclude {
        Some(format!("(NOT ({body}))"))
    } else {
        Some(format!("({body})"))
    }
}
