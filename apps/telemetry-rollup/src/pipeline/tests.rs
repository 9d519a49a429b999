use super::run_once;
use crate::aggregate::Reduction;
use crate::config::RollupSettings;
use crate::error::RollupError;
use crate::payload::{ColumnValue, PayloadRow};
use crate::sink::DestinationStore;
use crate::source::{QueryRows, SourceStore};
use crate::window::QueryWindow;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// In-memory stand-in for the raw CrateDB table.
struct MemorySource {
    rows: Vec<(i64, &'static str, &'static str, Value)>,
}

impl MemorySource {
    fn in_window(ms: i64, window: Option<&QueryWindow>) -> bool {
        window.map_or(true, |w| ms >= w.start_ms() && ms < w.end_ms())
    }

    fn bound(predicate: &str, prefix: &str) -> Option<i64> {
        let rest = &predicate[predicate.find(prefix)? + prefix.len()..];
        rest.split_whitespace().next()?.parse().ok()
    }
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn query(&self, _table: &str, predicate: &str) -> Result<QueryRows, RollupError> {
        let columns = ["timestamp", "device_id", "datapoint", "value"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let start = Self::bound(predicate, "timestamp >= ").unwrap_or(i64::MIN);
        let end = Self::bound(predicate, "timestamp < ").unwrap_or(i64::MAX);
        let rows = self
            .rows
            .iter()
            .filter(|(_, device, _, _)| predicate.contains(&format!("device_id = '{device}'")))
            .filter(|(ms, _, _, _)| *ms >= start && *ms < end)
            .map(|(ms, device, datapoint, value)| {
                vec![json!(ms), json!(device), json!(datapoint), value.clone()]
            })
            .collect();
        Ok(QueryRows { columns, rows })
    }

    async fn distinct_pairs(
        &self,
        _table: &str,
        window: Option<&QueryWindow>,
    ) -> Result<Vec<(String, String)>, RollupError> {
        let pairs: BTreeSet<(String, String)> = self
            .rows
            .iter()
            .filter(|(ms, _, _, _)| Self::in_window(*ms, window))
            .map(|(_, device, datapoint, _)| (device.to_string(), datapoint.to_string()))
            .collect();
        Ok(pairs.into_iter().collect())
    }
}

struct MemorySink {
    columns: Vec<String>,
    written: Mutex<Vec<PayloadRow>>,
}

impl MemorySink {
    fn new() -> Self {
        Self {
            columns: ["timestamp", "device_id", "aggregation_type", "datapoint", "value"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            written: Mutex::new(Vec::new()),
        }
    }

    fn text_rows(&self) -> Vec<Vec<String>> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|value| match value {
                        ColumnValue::Timestamp(ts) => ts.to_rfc3339(),
                        ColumnValue::Text(text) => text.clone(),
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl DestinationStore for MemorySink {
    async fn column_order(&self, _table: &str) -> Result<Vec<String>, sqlx::Error> {
        Ok(self.columns.clone())
    }

    async fn batch_insert(
        &self,
        _table: &str,
        _columns: &[String],
        rows: &[PayloadRow],
    ) -> Result<u64, sqlx::Error> {
        self.written.lock().unwrap().extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}

fn settings() -> RollupSettings {
    let mut settings = RollupSettings::new("doc.raw");
    settings.zone = chrono_tz::UTC;
    settings
}

#[tokio::test]
async fn two_readings_roll_up_into_one_mean_row() {
    let source = MemorySource {
        rows: vec![
            (0, "d1", "p1", json!("1")),
            (30_000, "d1", "p1", json!("3")),
        ],
    };
    let sink = MemorySink::new();
    let summary = run_once(&settings(), &source, &sink, Utc.timestamp_opt(60, 0).unwrap())
        .await
        .expect("run");

    assert_eq!(summary.devices, 1);
    assert_eq!(summary.readings, 2);
    assert_eq!(summary.records, 1);
    assert_eq!(summary.rows_written, 1);
    assert!(!summary.used_fallback);
    assert_eq!(
        sink.text_rows(),
        vec![vec![
            "1970-01-01T00:00:00+00:00".to_string(),
            "d1".to_string(),
            "mean_1min".to_string(),
            "p1".to_string(),
            "2.0".to_string(),
        ]]
    );
}

#[tokio::test]
async fn mixed_series_over_a_longer_window() {
    let source = MemorySource {
        rows: vec![
            (0, "d1", "power", json!(10.0)),
            (20_000, "d1", "power", json!(11.0)),
            (65_000, "d1", "power", json!(12.0)),
            (5_000, "d1", "state", json!("on")),
            (6_000, "d1", "state", json!("off")),
            (7_000, "d1", "state", json!("off")),
            (1_000, "d2", "temp", json!("21.12346")),
        ],
    };
    let sink = MemorySink::new();
    let mut settings = settings();
    settings.query_period_seconds = 120;
    settings.numeric_reductions = vec![Reduction::Mean, Reduction::Max];
    let summary = run_once(&settings, &source, &sink, Utc.timestamp_opt(120, 0).unwrap())
        .await
        .expect("run");

    assert_eq!(summary.pairs, 3);
    assert_eq!(summary.filters, 2);
    let rows = sink.text_rows();
    let compact: Vec<(&str, &str, &str, &str)> = rows
        .iter()
        .map(|r| (r[1].as_str(), r[3].as_str(), r[2].as_str(), r[4].as_str()))
        .collect();
    assert_eq!(
        compact,
        vec![
            ("d1", "power", "mean_1min", "10.5"),
            ("d1", "power", "mean_1min", "12.0"),
            ("d1", "power", "max_1min", "11.0"),
            ("d1", "power", "max_1min", "12.0"),
            ("d1", "state", "mode_1min", "off"),
            ("d2", "temp", "mean_1min", "21.1235"),
            ("d2", "temp", "max_1min", "21.1235"),
        ]
    );
}

#[tokio::test]
async fn quiet_window_falls_back_and_fails_on_empty_write() {
    // Only stale data: discovery widens to the whole table, but extraction
    // stays inside the window and finds nothing to write.
    let source = MemorySource {
        rows: vec![(0, "d1", "p1", json!("1"))],
    };
    let sink = MemorySink::new();
    let result = run_once(
        &settings(),
        &source,
        &sink,
        Utc.timestamp_opt(3_600, 0).unwrap(),
    )
    .await;

    assert!(matches!(result, Err(RollupError::EmptyInput { .. })));
    assert!(sink.text_rows().is_empty());
}
