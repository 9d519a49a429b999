//! Renders a [`FilterSpec`] into a flat `AND` predicate for the source store.
//!
//! String literals are single-quoted without escaping; a value containing `'`
//! produces a malformed clause. Producers are trusted to pass plain
//! identifiers.

use crate::filter::{check_fragment, FilterIssue, FilterSpec, FilterValue};

const CONJUNCTION: &str = " AND ";

/// Compiles every honored fragment; `{}` yields an empty string.
pub fn compile(filters: &FilterSpec) -> String {
    if filters.is_empty() {
        return String::new();
    }

    let mut fragments: Vec<String> = Vec::new();

    for (column, operator, value) in filters.iter() {
        match check_fragment(column, operator, value) {
            Ok(op) => {
                fragments.push(format!("{column} {} {}", op.as_str(), render_operand(value)));
            }
            Err(issue @ FilterIssue::NullValue { .. }) => {
                tracing::debug!(%issue, "skipping filter fragment");
            }
            Err(issue) => {
                tracing::warn!(%issue, filter = ?filters, "invalid filter fragment skipped");
            }
        }
    }

    fragments.join(CONJUNCTION)
}

/// `SELECT * FROM <table>`, with a `WHERE` clause only when something compiled.
pub fn select_with_predicate(table: &str, predicate: &str) -> String {
    if predicate.is_empty() {
        tracing::warn!(table, "filter compiled to no predicate; query is unfiltered");
        return format!("SELECT * FROM {table}");
    }
    format!("SELECT * FROM {table} WHERE {predicate}")
}

fn render_operand(value: &FilterValue) -> String {
    match value {
        FilterValue::Null => "NULL".to_string(),
        FilterValue::Bool(flag) => flag.to_string(),
        FilterValue::Int(number) => number.to_string(),
        FilterValue::Float(number) => format!("{number:?}"),
        FilterValue::Str(text) => format!("'{text}'"),
        FilterValue::List(items) => {
            let rendered: Vec<String> = items.iter().map(render_operand).collect();
            format!("({})", rendered.join(", "))
        }
    }
}
