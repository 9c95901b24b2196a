//! Append-only run history: named scalar series over simulation time plus
//! cumulative phase durations.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::objects::BodyId;
use crate::timing::Timings;

/// Identity of one recorded scalar series.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesKey {
    KineticEnergy(BodyId),
    InternalEnergy(BodyId),
    TotalKineticEnergy,
    TotalInternalEnergy,
    ContactCount,
    SparsifiedCount,
    /// Tributary surface area summed over the kept contacts.
    ContactArea,
    SolverIterations,
    SolverResidual,
    Merit,
}

#[derive(Default)]
pub struct History {
    series: AHashMap<SeriesKey, Vec<(f64, f64)>>,
    timings: Timings,
}

impl History {
    pub fn new() -> Self {
        History::default()
    }

    /// Appends a sample. Samples arrive in time order; out-of-order times are
    /// rejected to keep range queries meaningful.
    pub fn record(&mut self, key: SeriesKey, time: f64, value: f64) {
        let series = self.series.entry(key).or_default();
        if let Some(&(last, _)) = series.last() {
            if time < last {
                log::warn!(
                    "dropping out-of-order sample for {:?}: {} < {}",
                    key,
                    time,
                    last
                );
                return;
            }
        }
        series.push((time, value));
    }

    pub fn series(&self, key: SeriesKey) -> &[(f64, f64)] {
        self.series.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Samples with `begin <= time < end`.
    pub fn range(&self, key: SeriesKey, begin: f64, end: f64) -> &[(f64, f64)] {
        let series = self.series(key);
        let lo = series.partition_point(|&(t, _)| t < begin);
        let hi = series.partition_point(|&(t, _)| t < end);
        &series[lo..hi]
    }

    pub fn last(&self, key: SeriesKey) -> Option<(f64, f64)> {
        self.series(key).last().copied()
    }

    /// Folds one step's timings into the cumulative record.
    pub fn accumulate_timings(&mut self, step: &Timings) {
        self.timings.accumulate(step);
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_query_is_half_open() {
        let mut h = History::new();
        for i in 0..10 {
            h.record(SeriesKey::ContactCount, i as f64 * 0.1, i as f64);
        }
        let slice = h.range(SeriesKey::ContactCount, 0.2, 0.5);
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].1, 2.0);
        assert_eq!(slice[2].1, 4.0);
    }

    #[test]
    fn out_of_order_samples_are_dropped() {
        let mut h = History::new();
        h.record(SeriesKey::Merit, 1.0, 0.5);
        h.record(SeriesKey::Merit, 0.5, 0.9);
        assert_eq!(h.series(SeriesKey::Merit).len(), 1);
        assert_eq!(h.last(SeriesKey::Merit), Some((1.0, 0.5)));
    }

    #[test]
    fn missing_series_is_empty() {
        let h = History::new();
        assert!(h.series(SeriesKey::TotalKineticEnergy).is_empty());
        assert!(h.range(SeriesKey::Merit, 0.0, 1.0).is_empty());
    }

    #[test]
    fn per_body_series_are_distinct() {
        let mut h = History::new();
        h.record(SeriesKey::KineticEnergy(BodyId(0)), 0.0, 1.0);
        h.record(SeriesKey::KineticEnergy(BodyId(1)), 0.0, 2.0);
        assert_eq!(h.series(SeriesKey::KineticEnergy(BodyId(0)))[0].1, 1.0);
        assert_eq!(h.series(SeriesKey::KineticEnergy(BodyId(1)))[0].1, 2.0);
    }
}
