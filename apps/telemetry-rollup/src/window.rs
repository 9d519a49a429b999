use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};

/// Half-open `[start, end)` trailing window a run looks back over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryWindow {
    /// Window ending at `interval_start`, both bounds truncated to whole seconds.
    pub fn trailing(interval_start: DateTime<Utc>, period_seconds: u64) -> Self {
        let end = interval_start.trunc_subsecs(0);
        let start = i64::try_from(period_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|period| end.checked_sub_signed(period))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn width_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}
