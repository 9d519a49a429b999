use indexmap::IndexMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Mean,
    First,
    Last,
    Mode,
    Max,
    Sum,
}

impl Reduction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::First => "first",
            Self::Last => "last",
            Self::Mode => "mode",
            Self::Max => "max",
            Self::Sum => "sum",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mean" => Some(Self::Mean),
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "mode" => Some(Self::Mode),
            "max" => Some(Self::Max),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }

    /// Reduces one bucket of a numeric series. NaN samples are ignored; a
    /// bucket with nothing else yields `None`.
    pub fn reduce_numeric(self, values: &[f64]) -> Option<f64> {
        let mut present = values.iter().copied().filter(|value| !value.is_nan());
        match self {
            Self::Mean => {
                let (sum, count) = present.fold((0.0, 0usize), |(sum, count), value| {
                    (sum + value, count + 1)
                });
                (count > 0).then(|| sum / count as f64)
            }
            Self::First => present.next(),
            Self::Last => present.last(),
            Self::Mode => first_seen_mode(present, |value| normalized_bits(*value)),
            Self::Max => present.reduce(f64::max),
            Self::Sum => present.reduce(|acc, value| acc + value),
        }
    }
}

/// Most frequent item; on equal counts the one seen first wins.
pub(in crate::aggregate) fn first_seen_mode<T, K, I, F>(items: I, key: F) -> Option<T>
where
    I: IntoIterator<Item = T>,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut counts: IndexMap<K, (T, usize)> = IndexMap::new();
    for item in items {
        counts
            .entry(key(&item))
            .and_modify(|(_, count)| *count += 1)
            .or_insert((item, 1));
    }

    let mut best: Option<(T, usize)> = None;
    for (_, (item, count)) in counts {
        let replace = best
            .as_ref()
            .map_or(true, |(_, best_count)| count > *best_count);
        if replace {
            best = Some((item, count));
        }
    }
    best.map(|(item, _)| item)
}

/// Magnitude past which a double has no fractional digits left to round.
const ROUNDING_LIMIT: f64 = 1e15;

pub(in crate::aggregate) fn round4(value: f64) -> f64 {
    if !value.is_finite() || value.abs() >= ROUNDING_LIMIT {
        return value;
    }
    (value * 10_000.0).round() / 10_000.0
}

fn normalized_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0_f64.to_bits()
    } else {
        value.to_bits()
    }
}
