//! Time-bucketing aggregation engine.
//!
//! Readings are grouped per (device, datapoint), ordered by timestamp and cut
//! into epoch-aligned buckets of one fixed width. A series whose every value
//! parses as a float gets the numeric reductions (mean unless configured
//! otherwise); anything else gets the per-bucket mode of the raw text. Bucket
//! starts are stamped in one configured zone, so output only depends on the
//! input readings and the engine settings.

mod bucket;
mod reduce;

pub use bucket::BucketWidth;
pub use reduce::Reduction;

use crate::discovery::DeviceDatapointIndex;
use crate::reading::RawReading;
use bucket::{partition, Bucket};
use chrono::DateTime;
use chrono_tz::Tz;
use reduce::{first_seen_mode, round4};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Number(f64),
    Text(String),
}

impl AggregateValue {
    /// Text written to the destination `value` column.
    pub fn to_column_text(&self) -> String {
        match self {
            AggregateValue::Number(value) => format!("{value:?}"),
            AggregateValue::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub timestamp: DateTime<Tz>,
    pub device_id: String,
    pub aggregation_type: String,
    pub datapoint: String,
    pub value: AggregateValue,
}

impl AggregateRecord {
    pub fn describe(&self) -> String {
        format!(
            "{}/{} {} @ {}",
            self.device_id,
            self.datapoint,
            self.aggregation_type,
            self.timestamp.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    width: BucketWidth,
    zone: Tz,
    numeric_reductions: Vec<Reduction>,
    expected_buckets: u64,
}

impl Aggregator {
    pub fn new(width: BucketWidth, zone: Tz, query_period_seconds: u64) -> Self {
        Self {
            width,
            zone,
            numeric_reductions: vec![Reduction::Mean],
            expected_buckets: width.expected_buckets(query_period_seconds),
        }
    }

    /// Replaces the reductions applied to numeric series; an empty list keeps
    /// the current set.
    pub fn with_numeric_reductions(mut self, reductions: Vec<Reduction>) -> Self {
        if !reductions.is_empty() {
            self.numeric_reductions = reductions;
        }
        self
    }

    pub fn aggregation_type(&self, reduction: Reduction) -> String {
        format!("{}_{}", reduction.name(), self.width.label())
    }

    pub fn aggregate(
        &self,
        readings: &[RawReading],
        pairs: &DeviceDatapointIndex,
    ) -> Vec<AggregateRecord> {
        let mut records = Vec::new();
        if readings.is_empty() {
            tracing::info!("no raw data to aggregate for any device");
            return records;
        }

        let mut by_series: HashMap<(&str, &str), Vec<&RawReading>> = HashMap::new();
        let mut devices_with_data: HashSet<&str> = HashSet::new();
        for reading in readings {
            devices_with_data.insert(reading.device_id.as_str());
            by_series
                .entry((reading.device_id.as_str(), reading.datapoint.as_str()))
                .or_default()
                .push(reading);
        }

        for (device_id, datapoints) in pairs.iter() {
            if !devices_with_data.contains(device_id) {
                tracing::info!(device = device_id, "no data for device");
                continue;
            }
            for datapoint in datapoints.iter().map(String::as_str) {
                let Some(selected) = by_series.remove(&(device_id, datapoint)) else {
                    tracing::info!(device = device_id, datapoint, "datapoint has no data");
                    continue;
                };
                self.aggregate_series(device_id, datapoint, selected, &mut records);
            }
        }

        records
    }

    fn aggregate_series(
        &self,
        device_id: &str,
        datapoint: &str,
        mut selected: Vec<&RawReading>,
        out: &mut Vec<AggregateRecord>,
    ) {
        selected.sort_by_key(|reading| reading.timestamp);
        let buckets = partition(self.width, &selected);
        let numeric = selected
            .iter()
            .all(|reading| reading.value.as_f64().is_some());

        if numeric {
            for &reduction in &self.numeric_reductions {
                let before = out.len();
                for bucket in &buckets {
                    let values: Vec<f64> = bucket
                        .readings
                        .iter()
                        .filter_map(|reading| reading.value.as_f64())
                        .collect();
                    if let Some(value) = reduction.reduce_numeric(&values) {
                        out.push(self.record(
                            device_id,
                            datapoint,
                            reduction,
                            bucket,
                            AggregateValue::Number(round4(value)),
                        ));
                    }
                }
                self.log_bucket_count(device_id, datapoint, reduction, out.len() - before);
            }
            return;
        }

        tracing::info!(
            device = device_id,
            datapoint,
            "values do not parse as float; aggregating with mode"
        );
        let before = out.len();
        for bucket in &buckets {
            let modal = first_seen_mode(
                bucket
                    .readings
                    .iter()
                    .filter_map(|reading| reading.value.as_text()),
                |text: &String| text.clone(),
            );
            if let Some(text) = modal {
                out.push(self.record(
                    device_id,
                    datapoint,
                    Reduction::Mode,
                    bucket,
                    AggregateValue::Text(text),
                ));
            }
        }
        self.log_bucket_count(device_id, datapoint, Reduction::Mode, out.len() - before);
    }

    fn record(
        &self,
        device_id: &str,
        datapoint: &str,
        reduction: Reduction,
        bucket: &Bucket<'_>,
        value: AggregateValue,
    ) -> AggregateRecord {
        AggregateRecord {
            timestamp: bucket.start.with_timezone(&self.zone),
            device_id: device_id.to_string(),
            aggregation_type: self.aggregation_type(reduction),
            datapoint: datapoint.to_string(),
            value,
        }
    }

    fn log_bucket_count(&self, device_id: &str, datapoint: &str, reduction: Reduction, emitted: usize) {
        tracing::info!(
            device = device_id,
            datapoint,
            reduction = reduction.name(),
            buckets = emitted,
            expected = self.expected_buckets,
            "{}/{} buckets aggregated",
            emitted,
            self.expected_buckets
        );
    }
}
