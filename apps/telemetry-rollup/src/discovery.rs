//! Finds which (device, datapoint) pairs have data to roll up.

use crate::source::SourceStore;
use crate::window::QueryWindow;
use std::collections::{BTreeMap, BTreeSet};

/// Device id to the set of its datapoints, both kept sorted so every stage
/// downstream walks pairs in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDatapointIndex(BTreeMap<String, BTreeSet<String>>);

impl DeviceDatapointIndex {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut index = Self::default();
        for (device_id, datapoint) in pairs {
            index.insert(device_id, datapoint);
        }
        index
    }

    pub fn insert(&mut self, device_id: String, datapoint: String) -> bool {
        self.0.entry(device_id).or_default().insert(datapoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> + '_ {
        self.0
            .iter()
            .map(|(device_id, datapoints)| (device_id.as_str(), datapoints))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn pair_count(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub index: DeviceDatapointIndex,
    pub used_fallback: bool,
}

/// Looks up the pairs active inside `window`. An empty windowed result falls
/// back to every pair the table has ever held; a failed query yields an empty
/// index. Never returns an error.
pub async fn discover<S>(source: &S, table: &str, window: &QueryWindow) -> Discovery
where
    S: SourceStore + ?Sized,
{
    let windowed = match source.distinct_pairs(table, Some(window)).await {
        Ok(pairs) => pairs,
        Err(err) => {
            tracing::warn!(table, error = %err, "device discovery failed");
            return Discovery::default();
        }
    };

    let mut discovery = Discovery::default();
    let pairs = if windowed.is_empty() {
        tracing::warn!(
            table,
            start = %window.start,
            end = %window.end,
            "no device in the query window; discovering over the whole table"
        );
        discovery.used_fallback = true;
        match source.distinct_pairs(table, None).await {
            Ok(pairs) => pairs,
            Err(err) => {
                tracing::warn!(table, error = %err, "unfiltered device discovery failed");
                return discovery;
            }
        }
    } else {
        windowed
    };

    discovery.index = DeviceDatapointIndex::from_pairs(pairs);
    if discovery.index.is_empty() {
        tracing::warn!(table, "no device found to roll up");
        return discovery;
    }
    for (device_id, datapoints) in discovery.index.iter() {
        tracing::info!(device = device_id, datapoints = ?datapoints, "discovered device");
    }
    tracing::info!(
        devices = discovery.index.len(),
        pairs = discovery.index.pair_count(),
        fallback = discovery.used_fallback,
        "device discovery finished"
    );
    discovery
}
