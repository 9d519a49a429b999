use crate::aggregate::{BucketWidth, Reduction};
use crate::error::RollupError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_QUERY_PERIOD_SECONDS: u64 = 60;
const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Bangkok;
const DEFAULT_DESTINATION_TABLE: &str = "aggregated_data";
const DEFAULT_CHUNK_INTERVAL: &str = "1 day";

fn setup_config_path() -> Option<PathBuf> {
    env::var("ROLLUP_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Setup file keys follow the names operators already use for the job's
/// connection parameters.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    source_table: Option<String>,
    #[serde(default)]
    destination_table: Option<String>,
    #[serde(default)]
    query_period: Option<u64>,
    #[serde(default)]
    resample: Option<u64>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    cratedb_host: Option<String>,
    #[serde(default)]
    cratedb_port: Option<u16>,
    #[serde(default)]
    cratedb_username: Option<String>,
    #[serde(default)]
    cratedb_password: Option<String>,
    #[serde(default)]
    timescaledb_url: Option<String>,
    #[serde(default)]
    timescaledb_db_name: Option<String>,
    #[serde(default)]
    timescaledb_username: Option<String>,
    #[serde(default)]
    timescaledb_password: Option<String>,
    #[serde(default)]
    timescaledb_host: Option<String>,
    #[serde(default)]
    timescaledb_port: Option<u16>,
    #[serde(default)]
    numeric_reductions: Option<Vec<String>>,
    #[serde(default)]
    db_pool_size: Option<u32>,
    #[serde(default)]
    provision_table: Option<bool>,
    #[serde(default)]
    chunk_interval: Option<String>,
    #[serde(default)]
    interval_start: Option<String>,
}

impl SetupConfigOverrides {
    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "ROLLUP_SOURCE_TABLE" => self.source_table.clone(),
            "ROLLUP_DESTINATION_TABLE" => self.destination_table.clone(),
            "ROLLUP_QUERY_PERIOD_SECONDS" => self.query_period.map(|v| v.to_string()),
            "ROLLUP_RESAMPLE_SECONDS" => self.resample.map(|v| v.to_string()),
            "ROLLUP_TIMEZONE" => self.timezone.clone(),
            "ROLLUP_CRATEDB_HOST" => self.cratedb_host.clone(),
            "ROLLUP_CRATEDB_PORT" => self.cratedb_port.map(|v| v.to_string()),
            "ROLLUP_CRATEDB_USERNAME" => self.cratedb_username.clone(),
            "ROLLUP_CRATEDB_PASSWORD" => self.cratedb_password.clone(),
            "ROLLUP_TIMESCALE_URL" => self.timescaledb_url.clone(),
            "ROLLUP_TIMESCALE_DB" => self.timescaledb_db_name.clone(),
            "ROLLUP_TIMESCALE_USERNAME" => self.timescaledb_username.clone(),
            "ROLLUP_TIMESCALE_PASSWORD" => self.timescaledb_password.clone(),
            "ROLLUP_TIMESCALE_HOST" => self.timescaledb_host.clone(),
            "ROLLUP_TIMESCALE_PORT" => self.timescaledb_port.map(|v| v.to_string()),
            "ROLLUP_NUMERIC_REDUCTIONS" => {
                self.numeric_reductions.as_ref().map(|names| names.join(","))
            }
            "ROLLUP_DB_POOL_SIZE" => self.db_pool_size.map(|v| v.to_string()),
            "ROLLUP_PROVISION_TABLE" => self.provision_table.map(|v| v.to_string()),
            "ROLLUP_CHUNK_INTERVAL" => self.chunk_interval.clone(),
            "ROLLUP_INTERVAL_START" => self.interval_start.clone(),
            _ => None,
        };
        value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env only");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-rollup failed to read setup config; using env only"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-rollup failed to parse setup config; using env only"
            );
            None
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// What one run reads, how it buckets, and where it writes.
#[derive(Clone, Debug)]
pub struct RollupSettings {
    pub source_table: String,
    pub destination_table: String,
    pub query_period_seconds: u64,
    pub bucket_width: BucketWidth,
    pub zone: Tz,
    pub numeric_reductions: Vec<Reduction>,
}

impl RollupSettings {
    pub fn new(source_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            destination_table: DEFAULT_DESTINATION_TABLE.to_string(),
            query_period_seconds: DEFAULT_QUERY_PERIOD_SECONDS,
            bucket_width: BucketWidth::DEFAULT,
            zone: DEFAULT_TIMEZONE,
            numeric_reductions: vec![Reduction::Mean],
        }
    }
}

#[derive(Clone, Debug)]
pub struct CrateDbSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CrateDbSettings {
    pub fn sql_endpoint(&self) -> String {
        format!("http://{}:{}/_sql", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub enum TimescaleSettings {
    Url(String),
    Parts {
        database: String,
        username: String,
        password: String,
        host: String,
        port: u16,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub rollup: RollupSettings,
    pub cratedb: CrateDbSettings,
    pub timescale: TimescaleSettings,
    pub db_pool_size: u32,
    pub provision_table: bool,
    pub chunk_interval: String,
    pub interval_start: Option<DateTime<Utc>>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Environment (after `.env`) first, then the optional setup file.
    pub fn from_env() -> Result<Self, RollupError> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();
        Self::from_lookup(|key| {
            env_value(key).or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|overrides| overrides.lookup(key))
            })
        })
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RollupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut rollup = RollupSettings::new(required(&lookup, "ROLLUP_SOURCE_TABLE")?);
        if let Some(table) = lookup("ROLLUP_DESTINATION_TABLE") {
            rollup.destination_table = table;
        }
        rollup.query_period_seconds = parse_or(
            &lookup,
            "ROLLUP_QUERY_PERIOD_SECONDS",
            rollup.query_period_seconds,
        )?;
        let resample_seconds = parse_or(
            &lookup,
            "ROLLUP_RESAMPLE_SECONDS",
            rollup.bucket_width.seconds(),
        )?;
        rollup.bucket_width = BucketWidth::from_seconds(resample_seconds).ok_or_else(|| {
            RollupError::config(format!(
                "ROLLUP_RESAMPLE_SECONDS must be a positive number of seconds, got {resample_seconds}"
            ))
        })?;
        rollup.zone = parse_or(&lookup, "ROLLUP_TIMEZONE", rollup.zone)?;
        if let Some(raw) = lookup("ROLLUP_NUMERIC_REDUCTIONS") {
            rollup.numeric_reductions = parse_reductions(&raw)?;
        }

        let cratedb = CrateDbSettings {
            host: lookup("ROLLUP_CRATEDB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(&lookup, "ROLLUP_CRATEDB_PORT", 4200u16)?,
            username: lookup("ROLLUP_CRATEDB_USERNAME"),
            password: lookup("ROLLUP_CRATEDB_PASSWORD"),
        };

        let timescale = match lookup("ROLLUP_TIMESCALE_URL") {
            Some(url) => TimescaleSettings::Url(normalize_database_url(url)),
            None => TimescaleSettings::Parts {
                database: required(&lookup, "ROLLUP_TIMESCALE_DB")?,
                username: required(&lookup, "ROLLUP_TIMESCALE_USERNAME")?,
                password: required(&lookup, "ROLLUP_TIMESCALE_PASSWORD")?,
                host: required(&lookup, "ROLLUP_TIMESCALE_HOST")?,
                port: parse_or(&lookup, "ROLLUP_TIMESCALE_PORT", 5432u16)?,
            },
        };

        let db_pool_size = parse_or(&lookup, "ROLLUP_DB_POOL_SIZE", 2u32)?;
        if db_pool_size == 0 {
            return Err(RollupError::config("ROLLUP_DB_POOL_SIZE must be at least 1"));
        }
        let provision_table = match lookup("ROLLUP_PROVISION_TABLE") {
            Some(raw) => parse_flag("ROLLUP_PROVISION_TABLE", &raw)?,
            None => false,
        };
        let chunk_interval = lookup("ROLLUP_CHUNK_INTERVAL")
            .unwrap_or_else(|| DEFAULT_CHUNK_INTERVAL.to_string());
        let interval_start = lookup("ROLLUP_INTERVAL_START")
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|err| {
                        RollupError::config(format!(
                            "ROLLUP_INTERVAL_START {raw:?} is not RFC 3339: {err}"
                        ))
                    })
            })
            .transpose()?;
        let otlp_endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            rollup,
            cratedb,
            timescale,
            db_pool_size,
            provision_table,
            chunk_interval,
            interval_start,
            otlp_endpoint,
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, RollupError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).ok_or_else(|| RollupError::config(format!("{key} is required")))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, RollupError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| RollupError::config(format!("{key}={raw:?} is invalid: {err}"))),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, RollupError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RollupError::config(format!(
            "{key}={raw:?} is not a boolean"
        ))),
    }
}

fn parse_reductions(raw: &str) -> Result<Vec<Reduction>, RollupError> {
    let mut reductions = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let reduction = Reduction::parse(name).ok_or_else(|| {
            RollupError::config(format!(
                "ROLLUP_NUMERIC_REDUCTIONS: unknown reduction {name:?}"
            ))
        })?;
        if !reductions.contains(&reduction) {
            reductions.push(reduction);
        }
    }
    if reductions.is_empty() {
        return Err(RollupError::config(
            "ROLLUP_NUMERIC_REDUCTIONS names no reduction",
        ));
    }
    Ok(reductions)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
