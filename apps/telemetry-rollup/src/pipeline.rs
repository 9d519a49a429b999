use crate::aggregate::Aggregator;
use crate::config::{RollupSettings, TimescaleSettings};
use crate::discovery::discover;
use crate::error::RollupError;
use crate::extract::{build_filters, extract};
use crate::payload::write_aggregates;
use crate::sink::DestinationStore;
use crate::source::SourceStore;
use crate::window::QueryWindow;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

#[cfg(test)]
mod tests;

pub async fn build_pool(
    settings: &TimescaleSettings,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let options = PgPoolOptions::new().max_connections(max_connections);
    let pool = match settings {
        TimescaleSettings::Url(url) => options.connect(url).await?,
        TimescaleSettings::Parts {
            database,
            username,
            password,
            host,
            port,
        } => {
            let connect = PgConnectOptions::new()
                .host(host)
                .port(*port)
                .username(username)
                .password(password)
                .database(database);
            options.connect_with(connect).await?
        }
    };
    Ok(pool)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub window: QueryWindow,
    pub devices: usize,
    pub pairs: usize,
    pub used_fallback: bool,
    pub filters: usize,
    pub readings: usize,
    pub records: usize,
    pub rows_written: u64,
}

/// One invocation: discover, extract, aggregate and write the window ending
/// at `interval_start`.
pub async fn run_once<S, D>(
    settings: &RollupSettings,
    source: &S,
    sink: &D,
    interval_start: DateTime<Utc>,
) -> Result<RunSummary, RollupError>
where
    S: SourceStore + ?Sized,
    D: DestinationStore + ?Sized,
{
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "rollup_run",
        %run_id,
        source = %settings.source_table,
        destination = %settings.destination_table
    );
    run_stages(run_id, settings, source, sink, interval_start)
        .instrument(span)
        .await
}

async fn run_stages<S, D>(
    run_id: Uuid,
    settings: &RollupSettings,
    source: &S,
    sink: &D,
    interval_start: DateTime<Utc>,
) -> Result<RunSummary, RollupError>
where
    S: SourceStore + ?Sized,
    D: DestinationStore + ?Sized,
{
    let started = Instant::now();
    let window = QueryWindow::trailing(interval_start, settings.query_period_seconds);
    tracing::info!(
        start = %window.start,
        end = %window.end,
        period_seconds = window.width_seconds(),
        "starting rollup"
    );

    let discovery = discover(source, &settings.source_table, &window).await;
    let filters = build_filters(&discovery.index, &window);
    let readings = extract(source, &settings.source_table, &filters).await;

    let aggregator = Aggregator::new(
        settings.bucket_width,
        settings.zone,
        settings.query_period_seconds,
    )
    .with_numeric_reductions(settings.numeric_reductions.clone());
    let records = aggregator.aggregate(&readings, &discovery.index);
    tracing::info!(
        readings = readings.len(),
        records = records.len(),
        "aggregation finished"
    );

    let rows_written = write_aggregates(sink, &settings.destination_table, &records).await?;

    let summary = RunSummary {
        run_id,
        window,
        devices: discovery.index.len(),
        pairs: discovery.index.pair_count(),
        used_fallback: discovery.used_fallback,
        filters: filters.len(),
        readings: readings.len(),
        records: records.len(),
        rows_written,
    };
    tracing::info!(
        rows_written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rollup finished"
    );
    Ok(summary)
}
