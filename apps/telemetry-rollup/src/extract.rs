use crate::compiler;
use crate::discovery::DeviceDatapointIndex;
use crate::filter::FilterSpec;
use crate::reading::RawReading;
use crate::source::SourceStore;
use crate::window::QueryWindow;

/// One spec per discovered device, covering all of its datapoints.
pub fn build_filters(index: &DeviceDatapointIndex, window: &QueryWindow) -> Vec<FilterSpec> {
    index
        .iter()
        .map(|(device_id, datapoints)| {
            FilterSpec::for_device(device_id, datapoints.iter().cloned(), window)
        })
        .collect()
}

/// Runs every filter against `table` and returns the readings ordered by
/// timestamp. A failed query counts as no rows for that device.
pub async fn extract<S>(source: &S, table: &str, filters: &[FilterSpec]) -> Vec<RawReading>
where
    S: SourceStore + ?Sized,
{
    let mut readings = Vec::new();

    for filter in filters {
        let device = filter.device_id().unwrap_or("<any>");
        let dropped = filter.validate().len();
        if dropped > 0 {
            tracing::debug!(device, dropped, "filter carries fragments the compiler skips");
        }
        let predicate = compiler::compile(filter);
        let rows = match source.query(table, &predicate).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(table, device, error = %err, "raw data query failed");
                continue;
            }
        };

        if rows.is_empty() {
            tracing::info!(device, "no raw data found");
            continue;
        }
        tracing::info!(
            device,
            datapoints = ?filter.datapoints(),
            rows = rows.len(),
            "raw data found"
        );

        for row in &rows.rows {
            match RawReading::from_row(&rows.columns, row) {
                Ok(reading) => readings.push(reading),
                Err(err) => tracing::warn!(device, error = %err, "skipping unreadable row"),
            }
        }
    }

    readings.sort_by_key(|reading| reading.timestamp);
    readings
}
