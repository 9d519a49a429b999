use thiserror::Error;

/// Failures surfaced by a rollup run.
///
/// Only `Query` is ever degraded instead of propagated: discovery and
/// extraction log it and carry on with an empty result.
#[derive(Debug, Error)]
pub enum RollupError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no aggregated rows to insert into {table}")]
    EmptyInput { table: String },

    #[error("record {record} has no value for destination column {column}")]
    MissingField { record: String, column: String },

    #[error("destination table {table} exposes no columns")]
    DestinationSchema { table: String },

    #[error("failed to insert {rows} row(s) into {table}: {source}")]
    Write {
        table: String,
        rows: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("source query failed: {0}")]
    Query(String),
}

impl RollupError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<reqwest::Error> for RollupError {
    fn from(err: reqwest::Error) -> Self {
        Self::Query(err.to_string())
    }
}
