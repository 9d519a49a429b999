//! Destination store access: the capability trait and the TimescaleDB
//! implementation over a sqlx Postgres pool.

use crate::payload::{ColumnValue, PayloadRow};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};


// Postgres caps a single statement at u16::MAX bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Column names of `table` in ordinal order; empty when the table is unknown.
    async fn column_order(&self, table: &str) -> Result<Vec<String>, sqlx::Error>;

    async fn batch_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[PayloadRow],
    ) -> Result<u64, sqlx::Error>;
}

#[derive(Clone)]
pub struct TimescaleSink {
    pool: PgPool,
}

impl TimescaleSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the aggregate table when missing and turns it into a hypertable
    /// partitioned on `timestamp`.
    pub async fn ensure_destination_table(
        &self,
        table: &str,
        chunk_interval: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                timestamp TIMESTAMPTZ NOT NULL,
                device_id VARCHAR(128) NOT NULL,
                aggregation_type VARCHAR(32),
                datapoint VARCHAR(64) NOT NULL,
                value TEXT
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "SELECT create_hypertable($1::regclass, 'timestamp', chunk_time_interval => $2::interval, if_not_exists => TRUE)",
        )
        .bind(table)
        .bind(chunk_interval)
        .execute(&self.pool)
        .await?;

        tracing::info!(table, chunk_interval, "destination hypertable ready");
        Ok(())
    }
}

fn split_table(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}

fn insert_prefix(table: &str, columns: &[String]) -> String {
    let quoted: Vec<String> = columns
        .iter()
        .map(|column| format!("\"{}\"", column.replace('"', "\"\"")))
        .collect();
    format!("INSERT INTO {table} ({}) ", quoted.join(", "))
}

#[async_trait]
impl DestinationStore for TimescaleSink {
    async fn column_order(&self, table: &str) -> Result<Vec<String>, sqlx::Error> {
        let (schema, name) = split_table(table);
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name
            FROM information_schema.columns
            WHERE table_schema = COALESCE($2::text, current_schema()::text)
              AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(name)
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("column_name"))
            .collect()
    }

    async fn batch_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[PayloadRow],
    ) -> Result<u64, sqlx::Error> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
        let prefix = insert_prefix(table, columns);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            builder.push_values(chunk.iter(), |mut b, row| {
                for value in row {
                    match value {
                        ColumnValue::Timestamp(ts) => {
                            b.push_bind(ts.with_timezone(&Utc));
                        }
                        ColumnValue::Text(text) => {
                            b.push_bind(text.as_str());
                        }
                    }
                }
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
            tracing::debug!(table, rows = chunk.len(), "inserted chunk");
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
