use crate::reading::RawReading;
use chrono::{DateTime, TimeZone, Utc};

/// Longest width whose millisecond span still fits an `i64`.
const MAX_WIDTH_SECONDS: u64 = (i64::MAX / 1000) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWidth {
    seconds: u64,
}

impl BucketWidth {
    pub const DEFAULT: Self = Self { seconds: 60 };

    pub fn from_seconds(seconds: u64) -> Option<Self> {
        if seconds == 0 || seconds > MAX_WIDTH_SECONDS {
            return None;
        }
        Some(Self { seconds })
    }

    pub fn seconds(self) -> u64 {
        self.seconds
    }

    fn millis(self) -> i64 {
        self.seconds as i64 * 1000
    }

    /// `"30sec"`, `"1min"`, `"2h"`. Floor division: 90s reads as `"1min"`.
    pub fn label(self) -> String {
        let seconds = self.seconds;
        if seconds < 60 {
            format!("{seconds}sec")
        } else if seconds < 3600 {
            format!("{}min", seconds / 60)
        } else {
            format!("{}h", seconds / 3600)
        }
    }

    pub fn expected_buckets(self, period_seconds: u64) -> u64 {
        period_seconds / self.seconds
    }

    pub fn align_down(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width_ms = self.millis();
        let bucket_ms = ts.timestamp_millis().div_euclid(width_ms) * width_ms;
        Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
    }
}

#[derive(Debug)]
pub(in crate::aggregate) struct Bucket<'a> {
    pub(in crate::aggregate) start: DateTime<Utc>,
    pub(in crate::aggregate) readings: Vec<&'a RawReading>,
}

/// Splits time-ordered readings into consecutive non-empty buckets.
pub(in crate::aggregate) fn partition<'a>(
    width: BucketWidth,
    ordered: &[&'a RawReading],
) -> Vec<Bucket<'a>> {
    let mut buckets: Vec<Bucket<'a>> = Vec::new();
    for &reading in ordered {
        let start = width.align_down(reading.timestamp);
        match buckets.last_mut() {
            Some(bucket) if bucket.start == start => bucket.readings.push(reading),
            _ => buckets.push(Bucket {
                start,
                readings: vec![reading],
            }),
        }
    }
    buckets
}
