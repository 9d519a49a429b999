use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Number, Value};

/// Raw `value` cell as CrateDB returns it: text for most datapoints, numbers
/// for some, and occasionally null.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingValue {
    Null,
    Number(Number),
    Text(String),
}

impl ReadingValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ReadingValue::Null,
            Value::Number(number) => ReadingValue::Number(number.clone()),
            Value::String(text) => ReadingValue::Text(text.clone()),
            other => ReadingValue::Text(other.to_string()),
        }
    }

    /// Float view used by the numeric type check. Null reads as NaN so a missing
    /// sample does not turn a numeric series into a text one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Null => Some(f64::NAN),
            ReadingValue::Number(number) => number.as_f64(),
            ReadingValue::Text(text) => text.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            ReadingValue::Null => None,
            ReadingValue::Number(number) => Some(number.to_string()),
            ReadingValue::Text(text) => Some(text.clone()),
        }
    }
}

impl From<&str> for ReadingValue {
    fn from(value: &str) -> Self {
        ReadingValue::Text(value.to_string())
    }
}

impl From<f64> for ReadingValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value)
            .map(ReadingValue::Number)
            .unwrap_or(ReadingValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub datapoint: String,
    pub value: ReadingValue,
    pub aggregation_type: Option<String>,
}

impl RawReading {
    #[cfg(test)]
    pub fn new(
        timestamp_ms: i64,
        device_id: impl Into<String>,
        datapoint: impl Into<String>,
        value: impl Into<ReadingValue>,
    ) -> Result<Self> {
        Ok(Self {
            timestamp: millis_to_dt(timestamp_ms)?,
            device_id: device_id.into(),
            datapoint: datapoint.into(),
            value: value.into(),
            aggregation_type: None,
        })
    }

    /// Builds a reading from one source row addressed by column name.
    pub fn from_row(columns: &[String], row: &[Value]) -> Result<Self> {
        let cell = |name: &str| -> Option<&Value> {
            columns
                .iter()
                .position(|column| column == name)
                .and_then(|idx| row.get(idx))
        };

        let timestamp = cell("timestamp")
            .context("row has no timestamp column")
            .and_then(parse_timestamp)?;
        let device_id = cell("device_id")
            .and_then(Value::as_str)
            .context("row has no device_id")?;
        let datapoint = cell("datapoint")
            .and_then(Value::as_str)
            .context("row has no datapoint")?;
        let value = cell("value")
            .map(ReadingValue::from_json)
            .unwrap_or(ReadingValue::Null);
        let aggregation_type = cell("aggregation_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            timestamp,
            device_id: device_id.to_string(),
            datapoint: datapoint.to_string(),
            value,
            aggregation_type,
        })
    }
}

/// Source timestamps are integer epoch milliseconds; anything else is refused.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(number) => match number.as_i64() {
            Some(ms) => millis_to_dt(ms),
            None => bail!("timestamp {number} is not integer milliseconds"),
        },
        other => bail!("unsupported timestamp value {other}"),
    }
}

pub fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp {ms}ms is out of range"))
}
