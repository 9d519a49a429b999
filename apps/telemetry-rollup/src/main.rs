mod aggregate;
mod compiler;
mod config;
mod discovery;
mod error;
mod extract;
mod filter;
mod payload;
mod pipeline;
mod reading;
mod sink;
mod source;
mod window;

use crate::config::Config;
use crate::pipeline::{build_pool, run_once};
use crate::sink::TimescaleSink;
use crate::source::CrateSource;
use anyhow::{Context, Result};
use chrono::Utc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_rollup=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-rollup"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{trimmed}/v1/traces")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let source = CrateSource::new(&config.cratedb);
    let pool = build_pool(&config.timescale, config.db_pool_size)
        .await
        .context("failed to connect to TimescaleDB")?;
    let sink = TimescaleSink::new(pool);

    if config.provision_table {
        sink.ensure_destination_table(&config.rollup.destination_table, &config.chunk_interval)
            .await
            .with_context(|| {
                format!(
                    "failed to provision destination table {}",
                    config.rollup.destination_table
                )
            })?;
    }

    let interval_start = config.interval_start.unwrap_or_else(Utc::now);
    let result = run_once(&config.rollup, &source, &sink, interval_start).await;
    match &result {
        Ok(summary) => tracing::info!(
            run_id = %summary.run_id,
            window_start = %summary.window.start,
            window_end = %summary.window.end,
            filters = summary.filters,
            devices = summary.devices,
            pairs = summary.pairs,
            fallback = summary.used_fallback,
            readings = summary.readings,
            records = summary.records,
            rows_written = summary.rows_written,
            "rollup run complete"
        ),
        Err(err) => tracing::error!(error = %err, "rollup run failed"),
    }

    opentelemetry::global::shutdown_tracer_provider();
    result?;
    Ok(())
}
