//! Source store access: the capability trait the stages depend on and the
//! CrateDB implementation over its HTTP `_sql` endpoint.

use crate::compiler;
use crate::config::CrateDbSettings;
use crate::error::RollupError;
use crate::filter::{FilterSpec, DATAPOINT_COLUMN, DEVICE_ID_COLUMN};
use crate::window::QueryWindow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result set in column order, as returned by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Rows of `table` matching a compiled predicate; an empty predicate reads
    /// the whole table.
    async fn query(&self, table: &str, predicate: &str) -> Result<QueryRows, RollupError>;

    /// Distinct `(device_id, datapoint)` pairs, optionally limited to a window.
    async fn distinct_pairs(
        &self,
        table: &str,
        window: Option<&QueryWindow>,
    ) -> Result<Vec<(String, String)>, RollupError>;
}

pub fn distinct_pairs_statement(table: &str, window: Option<&QueryWindow>) -> String {
    let base = format!("SELECT DISTINCT {DEVICE_ID_COLUMN}, {DATAPOINT_COLUMN} FROM {table}");
    match window {
        Some(window) => {
            let predicate = compiler::compile(&FilterSpec::time_range(window));
            format!("{base} WHERE {predicate}")
        }
        None => base,
    }
}

#[derive(Serialize)]
struct SqlRequest<'a> {
    stmt: &'a str,
}

#[derive(Deserialize)]
struct SqlResponse {
    cols: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct SqlErrorResponse {
    error: SqlErrorBody,
}

#[derive(Deserialize)]
struct SqlErrorBody {
    message: String,
}

#[derive(Clone)]
pub struct CrateSource {
    client: Client,
    endpoint: String,
    username: Option<String>,
    password: Option<String>,
}

impl CrateSource {
    pub fn new(settings: &CrateDbSettings) -> Self {
        Self {
            client: Client::new(),
            endpoint: settings.sql_endpoint(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }

    pub async fn execute(&self, stmt: &str) -> Result<QueryRows, RollupError> {
        tracing::debug!(stmt, "querying CrateDB");
        let mut request = self.client.post(&self.endpoint).json(&SqlRequest { stmt });
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        let mut body = response.bytes().await?.to_vec();

        if !status.is_success() {
            let raw = String::from_utf8_lossy(&body).into_owned();
            let message = simd_json::serde::from_slice::<SqlErrorResponse>(&mut body)
                .map(|parsed| parsed.error.message)
                .unwrap_or(raw);
            return Err(RollupError::Query(format!(
                "CrateDB returned {status}: {message}"
            )));
        }

        let parsed: SqlResponse = simd_json::serde::from_slice(&mut body)
            .map_err(|err| RollupError::Query(format!("unreadable CrateDB response: {err}")))?;
        tracing::debug!(rows = parsed.rows.len(), "finished querying CrateDB");
        Ok(QueryRows {
            columns: parsed.cols,
            rows: parsed.rows,
        })
    }
}

#[async_trait]
impl SourceStore for CrateSource {
    async fn query(&self, table: &str, predicate: &str) -> Result<QueryRows, RollupError> {
        let stmt = compiler::select_with_predicate(table, predicate);
        self.execute(&stmt).await
    }

    async fn distinct_pairs(
        &self,
        table: &str,
        window: Option<&QueryWindow>,
    ) -> Result<Vec<(String, String)>, RollupError> {
        let rows = self.execute(&distinct_pairs_statement(table, window)).await?;
        Ok(pairs_from_rows(rows))
    }
}

fn pairs_from_rows(rows: QueryRows) -> Vec<(String, String)> {
    rows.rows
        .into_iter()
        .filter_map(|row| match (row.first(), row.get(1)) {
            (Some(Value::String(device_id)), Some(Value::String(datapoint))) => {
                Some((device_id.clone(), datapoint.clone()))
            }
            other => {
                tracing::warn!(row = ?other, "skipping distinct pair with non-text columns");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn distinct_pairs_statement_with_and_without_window() {
        let window = QueryWindow::trailing(Utc.timestamp_opt(120, 0).unwrap(), 60);
        assert_eq!(
            distinct_pairs_statement("doc.raw", Some(&window)),
            "SELECT DISTINCT device_id, datapoint FROM doc.raw WHERE timestamp >= 60000 AND timestamp < 120000"
        );
        assert_eq!(
            distinct_pairs_statement("doc.raw", None),
            "SELECT DISTINCT device_id, datapoint FROM doc.raw"
        );
    }

    #[test]
    fn parses_sql_response_body() {
        let mut body = br#"{"cols":["device_id","datapoint"],"rows":[["d1","power"],["d1",null],["d2","temp"]],"rowcount":3,"duration":1.2}"#.to_vec();
        let parsed: SqlResponse = simd_json::serde::from_slice(&mut body).expect("parsed");
        let rows = QueryRows {
            columns: parsed.cols,
            rows: parsed.rows,
        };
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.rows[1][1], json!(null));
        assert_eq!(
            pairs_from_rows(rows),
            vec![
                ("d1".to_string(), "power".to_string()),
                ("d2".to_string(), "temp".to_string()),
            ]
        );
    }

    #[test]
    fn parses_sql_error_body() {
        let mut body =
            br#"{"error":{"message":"RelationUnknown[Relation 'raw' unknown]","code":4041}}"#
                .to_vec();
        let parsed: SqlErrorResponse = simd_json::serde::from_slice(&mut body).expect("parsed");
        assert_eq!(parsed.error.message, "RelationUnknown[Relation 'raw' unknown]");
    }
}
