//! Structured predicate model shared by discovery, extraction and the clause
//! compiler.
//!
//! Wire format is `{column: {operator: value, ...}, ...}`. Column and operator
//! order is kept as supplied so the compiled clause is stable for a given
//! producer.

use crate::window::QueryWindow;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEVICE_ID_COLUMN: &str = "device_id";
pub const DATAPOINT_COLUMN: &str = "datapoint";
pub const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FilterValue::Null)
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, FilterValue::List(_))
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Str(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Str(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Float(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl<T: Into<FilterValue>> From<Vec<T>> for FilterValue {
    fn from(values: Vec<T>) -> Self {
        FilterValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FilterValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    NotLike,
    In,
    NotIn,
}

impl Operator {
    /// Comparison symbols match exactly; membership keywords ignore case.
    pub fn parse(raw: &str) -> Option<Self> {
        let op = match raw {
            "=" => Self::Eq,
            "!=" => Self::NotEq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::Gte,
            "<=" => Self::Lte,
            "LIKE" => Self::Like,
            "NOT LIKE" => Self::NotLike,
            _ => match raw.to_ascii_uppercase().as_str() {
                "IN" => Self::In,
                "NOT IN" => Self::NotIn,
                _ => return None,
            },
        };
        Some(op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }

    pub fn is_membership(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// A fragment the compiler will not emit. None of these fail compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterIssue {
    #[error("null value for {column} {operator}; constraint dropped")]
    NullValue { column: String, operator: String },
    #[error("unsupported operator {operator:?} for column {column}")]
    UnsupportedOperator { column: String, operator: String },
    #[error("{operator} on column {column} needs a sequence value")]
    MembershipNeedsSequence { column: String, operator: String },
}

/// Resolves one `(operator, value)` pair to the operator the compiler renders.
pub fn check_fragment(
    column: &str,
    operator: &str,
    value: &FilterValue,
) -> Result<Operator, FilterIssue> {
    if value.is_null() {
        return Err(FilterIssue::NullValue {
            column: column.to_string(),
            operator: operator.to_string(),
        });
    }
    let Some(op) = Operator::parse(operator) else {
        return Err(FilterIssue::UnsupportedOperator {
            column: column.to_string(),
            operator: operator.to_string(),
        });
    };
    if op.is_membership() && !value.is_sequence() {
        return Err(FilterIssue::MembershipNeedsSequence {
            column: column.to_string(),
            operator: op.as_str().to_string(),
        });
    }
    Ok(op)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSpec {
    columns: IndexMap<String, IndexMap<String, FilterValue>>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `column operator value`, replacing an earlier value for the same pair.
    pub fn with(
        mut self,
        column: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<FilterValue>,
    ) -> Self {
        self.columns
            .entry(column.into())
            .or_default()
            .insert(operator.into(), value.into());
        self
    }

    /// The per-device spec a run issues against the source table.
    pub fn for_device<I, S>(device_id: &str, datapoints: I, window: &QueryWindow) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let datapoints: Vec<String> = datapoints.into_iter().map(Into::into).collect();
        Self::new()
            .with(DEVICE_ID_COLUMN, "=", device_id)
            .with(DATAPOINT_COLUMN, "IN", datapoints)
            .with(TIMESTAMP_COLUMN, ">=", window.start_ms())
            .with(TIMESTAMP_COLUMN, "<", window.end_ms())
    }

    pub fn time_range(window: &QueryWindow) -> Self {
        Self::new()
            .with(TIMESTAMP_COLUMN, ">=", window.start_ms())
            .with(TIMESTAMP_COLUMN, "<", window.end_ms())
    }

    #[cfg(test)]
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.values().all(|ops| ops.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &FilterValue)> + '_ {
        self.columns.iter().flat_map(|(column, ops)| {
            ops.iter()
                .map(move |(op, value)| (column.as_str(), op.as_str(), value))
        })
    }

    pub fn get(&self, column: &str, operator: &str) -> Option<&FilterValue> {
        self.columns.get(column).and_then(|ops| ops.get(operator))
    }

    pub fn device_id(&self) -> Option<&str> {
        match self.get(DEVICE_ID_COLUMN, "=") {
            Some(FilterValue::Str(device_id)) => Some(device_id.as_str()),
            _ => None,
        }
    }

    pub fn datapoints(&self) -> Vec<&str> {
        match self.get(DATAPOINT_COLUMN, "IN") {
            Some(FilterValue::List(values)) => values
                .iter()
                .filter_map(|value| match value {
                    FilterValue::Str(name) => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every fragment the compiler would drop, in compile order.
    pub fn validate(&self) -> Vec<FilterIssue> {
        self.iter()
            .filter_map(|(column, op, value)| check_fragment(column, op, value).err())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_wire_format_in_order() {
        let spec = FilterSpec::from_json(
            r#"{"timestamp": {">": 100000, "<": 200000}, "device_id": {"=": "device_1"}, "datapoint": {"IN": ["power", "temp"]}}"#,
        )
        .expect("parsed");
        let fragments: Vec<_> = spec.iter().map(|(c, o, _)| (c, o)).collect();
        assert_eq!(
            fragments,
            vec![
                ("timestamp", ">"),
                ("timestamp", "<"),
                ("device_id", "="),
                ("datapoint", "IN"),
            ]
        );
        assert_eq!(spec.get("timestamp", ">"), Some(&FilterValue::Int(100000)));
        assert_eq!(spec.device_id(), Some("device_1"));
        assert_eq!(spec.datapoints(), vec!["power", "temp"]);
    }

    #[test]
    fn null_json_value_is_kept_as_null() {
        let spec = FilterSpec::from_json(r#"{"device_id": {"=": null}}"#).expect("parsed");
        assert_eq!(spec.get("device_id", "="), Some(&FilterValue::Null));
    }

    #[test]
    fn operator_parsing_matches_symbols_and_membership_keywords() {
        assert_eq!(Operator::parse(">="), Some(Operator::Gte));
        assert_eq!(Operator::parse("NOT LIKE"), Some(Operator::NotLike));
        assert_eq!(Operator::parse("in"), Some(Operator::In));
        assert_eq!(Operator::parse("Not In"), Some(Operator::NotIn));
        assert_eq!(Operator::parse("like"), None);
        assert_eq!(Operator::parse("BETWEEN"), None);
    }

    #[test]
    fn validate_reports_each_dropped_fragment() {
        let spec = FilterSpec::new()
            .with("device_id", "=", Option::<String>::None)
            .with("datapoint", "IN", "power")
            .with("value", "~", 3_i64)
            .with("timestamp", ">=", 10_i64);
        let issues = spec.validate();
        assert_eq!(issues.len(), 3);
        assert!(matches!(issues[0], FilterIssue::NullValue { .. }));
        assert!(matches!(issues[1], FilterIssue::MembershipNeedsSequence { .. }));
        assert!(matches!(issues[2], FilterIssue::UnsupportedOperator { .. }));
    }

    #[test]
    fn device_spec_covers_window_in_millis() {
        let window = QueryWindow::trailing(Utc.timestamp_opt(1_000, 0).unwrap(), 60);
        let spec = FilterSpec::for_device("dev1", ["power", "temp"], &window);
        assert_eq!(spec.device_id(), Some("dev1"));
        assert_eq!(spec.get("timestamp", ">="), Some(&FilterValue::Int(940_000)));
        assert_eq!(spec.get("timestamp", "<"), Some(&FilterValue::Int(1_000_000)));
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn empty_spec_reports_empty() {
        assert!(FilterSpec::new().is_empty());
        assert!(FilterSpec::from_json("{}").expect("parsed").is_empty());
    }
}
