//! Maps aggregate records onto the destination table's column order and hands
//! them to the sink as one batch.

use crate::aggregate::AggregateRecord;
use crate::error::RollupError;
use crate::sink::DestinationStore;
use chrono::{DateTime, FixedOffset};

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Timestamp(DateTime<FixedOffset>),
    Text(String),
}

pub type PayloadRow = Vec<ColumnValue>;

fn column_value(record: &AggregateRecord, column: &str) -> Option<ColumnValue> {
    let value = match column {
        "timestamp" => ColumnValue::Timestamp(record.timestamp.fixed_offset()),
        "device_id" => ColumnValue::Text(record.device_id.clone()),
        "aggregation_type" => ColumnValue::Text(record.aggregation_type.clone()),
        "datapoint" => ColumnValue::Text(record.datapoint.clone()),
        "value" => ColumnValue::Text(record.value.to_column_text()),
        _ => return None,
    };
    Some(value)
}

/// One row per record, each laid out exactly in `schema` order.
pub fn build_payload(
    records: &[AggregateRecord],
    schema: &[String],
) -> Result<Vec<PayloadRow>, RollupError> {
    records
        .iter()
        .map(|record| {
            schema
                .iter()
                .map(|column| {
                    column_value(record, column).ok_or_else(|| RollupError::MissingField {
                        record: record.describe(),
                        column: column.clone(),
                    })
                })
                .collect()
        })
        .collect()
}

/// Writes `records` into `table` as one batch and returns the rows inserted.
pub async fn write_aggregates<S>(
    sink: &S,
    table: &str,
    records: &[AggregateRecord],
) -> Result<u64, RollupError>
where
    S: DestinationStore + ?Sized,
{
    if records.is_empty() {
        return Err(RollupError::EmptyInput {
            table: table.to_string(),
        });
    }

    let columns = sink
        .column_order(table)
        .await
        .map_err(|source| RollupError::Write {
            table: table.to_string(),
            rows: records.len(),
            source,
        })?;
    if columns.is_empty() {
        return Err(RollupError::DestinationSchema {
            table: table.to_string(),
        });
    }
    tracing::debug!(table, columns = ?columns, "resolved destination columns");

    let rows = build_payload(records, &columns)?;
    let inserted = sink
        .batch_insert(table, &columns, &rows)
        .await
        .map_err(|source| RollupError::Write {
            table: table.to_string(),
            rows: rows.len(),
            source,
        })?;
    tracing::info!(table, rows = inserted, "inserted aggregated rows");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateValue;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    fn record(device: &str, value: AggregateValue) -> AggregateRecord {
        AggregateRecord {
            timestamp: Utc
                .timestamp_opt(1_693_045_320, 0)
                .unwrap()
                .with_timezone(&chrono_tz::Asia::Bangkok),
            device_id: device.to_string(),
            aggregation_type: "mean_1min".to_string(),
            datapoint: "power".to_string(),
            value,
        }
    }

    fn schema(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    #[derive(Default)]
    struct MemorySink {
        columns: Vec<String>,
        fail_insert: bool,
        written: Mutex<Vec<PayloadRow>>,
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
            if self.fail_insert {
                return Err(sqlx::Error::PoolClosed);
            }
            self.written.lock().unwrap().extend(rows.iter().cloned());
            Ok(rows.len() as u64)
        }
    }

    #[test]
    fn rows_follow_destination_column_order() {
        let rows = build_payload(
            &[record("d1", AggregateValue::Number(2.0))],
            &schema(&["value", "datapoint", "timestamp", "device_id", "aggregation_type"]),
        )
        .expect("payload");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], ColumnValue::Text("2.0".to_string()));
        assert_eq!(rows[0][1], ColumnValue::Text("power".to_string()));
        match &rows[0][2] {
            ColumnValue::Timestamp(ts) => {
                assert_eq!(ts.to_rfc3339(), "2023-08-26T17:22:00+07:00")
            }
            other => panic!("expected timestamp, got {other:?}"),
        }
        assert_eq!(rows[0][3], ColumnValue::Text("d1".to_string()));
        assert_eq!(rows[0][4], ColumnValue::Text("mean_1min".to_string()));
    }

    #[test]
    fn unknown_destination_column_names_the_column() {
        let err = build_payload(
            &[record("d1", AggregateValue::Text("on".into()))],
            &schema(&["timestamp", "device_id", "location"]),
        )
        .unwrap_err();
        match err {
            RollupError::MissingField { column, record } => {
                assert_eq!(column, "location");
                assert!(record.starts_with("d1/power"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let sink = MemorySink::default();
        let err = write_aggregates(&sink, "aggregated_data", &[]).await.unwrap_err();
        assert!(matches!(err, RollupError::EmptyInput { .. }));
    }

    #[tokio::test]
    async fn table_without_columns_is_a_schema_error() {
        let sink = MemorySink::default();
        let err = write_aggregates(&sink, "missing", &[record("d1", AggregateValue::Number(1.0))])
            .await
            .unwrap_err();
        assert!(matches!(err, RollupError::DestinationSchema { .. }));
    }

    #[tokio::test]
    async fn writes_batch_and_wraps_sink_failures() {
        let sink = MemorySink {
            columns: schema(&["timestamp", "device_id", "aggregation_type", "datapoint", "value"]),
            ..Default::default()
        };
        let records = vec![
            record("d1", AggregateValue::Number(1.5)),
            record("d2", AggregateValue::Number(3.0)),
        ];
        let inserted = write_aggregates(&sink, "aggregated_data", &records)
            .await
            .expect("write");
        assert_eq!(inserted, 2);
        assert_eq!(sink.written.lock().unwrap().len(), 2);

        let failing = MemorySink {
            columns: sink.columns.clone(),
            fail_insert: true,
            ..Default::default()
        };
        let err = write_aggregates(&failing, "aggregated_data", &records)
            .await
            .unwrap_err();
        match err {
            RollupError::Write { table, rows, .. } => {
                assert_eq!(table, "aggregated_data");
                assert_eq!(rows, 2);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
