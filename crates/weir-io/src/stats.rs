//! Per-batch writer statistics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Named counter kept by writers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Statistic {
    /// Rows handed to the writer
    RowCount,
    /// Position of the current row within the batch
    LineNumber,
    /// Rows inserted
    InsertCount,
    /// Rows updated
    UpdateCount,
    /// Rows deleted
    DeleteCount,
    /// Rows skipped by a filter, transform or conflict rule
    IgnoreRowCount,
    /// Updates that fell back to an insert
    FallbackInsertCount,
    /// Inserts that fell back to an update
    FallbackUpdateCount,
    /// Deletes that found no row
    MissingDeleteCount,
    /// Rows produced by transforms
    TransformCount,
    /// Time spent executing statements
    LoadMillis,
    /// Time spent in transforms
    TransformMillis,
    /// Time spent in writer filters
    FilterMillis,
}

impl Statistic {
    /// All counters, in display order
    pub const ALL: [Statistic; 13] = [
        Statistic::RowCount,
        Statistic::LineNumber,
        Statistic::InsertCount,
        Statistic::UpdateCount,
        Statistic::DeleteCount,
        Statistic::IgnoreRowCount,
        Statistic::FallbackInsertCount,
        Statistic::FallbackUpdateCount,
        Statistic::MissingDeleteCount,
        Statistic::TransformCount,
        Statistic::LoadMillis,
        Statistic::TransformMillis,
        Statistic::FilterMillis,
    ];

    /// Counter name
    pub const fn name(self) -> &'static str {
        match self {
            Self::RowCount => "ROW_COUNT",
            Self::LineNumber => "LINE_NUMBER",
            Self::InsertCount => "INSERT_COUNT",
            Self::UpdateCount => "UPDATE_COUNT",
            Self::DeleteCount => "DELETE_COUNT",
            Self::IgnoreRowCount => "IGNORE_ROW_COUNT",
            Self::FallbackInsertCount => "FALLBACK_INSERT_COUNT",
            Self::FallbackUpdateCount => "FALLBACK_UPDATE_COUNT",
            Self::MissingDeleteCount => "MISSING_DELETE_COUNT",
            Self::TransformCount => "TRANSFORM_COUNT",
            Self::LoadMillis => "LOAD_MILLIS",
            Self::TransformMillis => "TRANSFORM_MILLIS",
            Self::FilterMillis => "FILTER_MILLIS",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters for one batch.
///
/// Writers update these through `&self`, so a listener can read a snapshot
/// while the batch is still being loaded.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: [AtomicU64; 13],
}

impl Statistics {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to a counter
    pub fn increment(&self, stat: Statistic, n: u64) {
        self.counters[stat.index()].fetch_add(n, Ordering::Relaxed);
    }

    /// Add one to a counter
    pub fn incr(&self, stat: Statistic) {
        self.increment(stat, 1);
    }

    /// Overwrite a counter
    pub fn set(&self, stat: Statistic, value: u64) {
        self.counters[stat.index()].store(value, Ordering::Relaxed);
    }

    /// Read a counter
    pub fn get(&self, stat: Statistic) -> u64 {
        self.counters[stat.index()].load(Ordering::Relaxed)
    }

    /// Add elapsed time to a timer counter
    pub fn add_elapsed(&self, stat: Statistic, elapsed: Duration) {
        self.increment(stat, elapsed.as_millis() as u64);
    }

    /// Add the time since `started` to a timer counter
    pub fn stop_timer(&self, stat: Statistic, started: Instant) {
        self.add_elapsed(stat, started.elapsed());
    }

    /// Reset every counter
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            values: Statistic::ALL
                .iter()
                .map(|stat| (*stat, self.get(*stat)))
                .filter(|(_, value)| *value > 0)
                .collect(),
        }
    }
}

/// Snapshot of batch statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    values: BTreeMap<Statistic, u64>,
}

impl StatisticsSnapshot {
    /// Counter value, zero when never incremented
    pub fn get(&self, stat: Statistic) -> u64 {
        self.values.get(&stat).copied().unwrap_or(0)
    }

    /// Sum another snapshot into this one
    pub fn merge(&mut self, other: &StatisticsSnapshot) {
        for (stat, value) in &other.values {
            *self.values.entry(*stat).or_insert(0) += value;
        }
    }

    /// Rows written by insert, update or delete
    pub fn applied_rows(&self) -> u64 {
        self.get(Statistic::InsertCount)
            + self.get(Statistic::UpdateCount)
            + self.get(Statistic::DeleteCount)
    }

    /// Non-zero counters by name
    pub fn iter(&self) -> impl Iterator<Item = (Statistic, u64)> + '_ {
        self.values.iter().map(|(stat, value)| (*stat, *value))
    }
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (stat, value) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", stat, value)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::new();
        stats.incr(Statistic::RowCount);
        stats.increment(Statistic::InsertCount, 3);
        stats.add_elapsed(Statistic::LoadMillis, Duration::from_millis(25));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get(Statistic::RowCount), 1);
        assert_eq!(snapshot.get(Statistic::InsertCount), 3);
        assert_eq!(snapshot.get(Statistic::LoadMillis), 25);
        assert_eq!(snapshot.get(Statistic::DeleteCount), 0);
        assert_eq!(snapshot.applied_rows(), 3);
    }

    #[test]
    fn test_merge() {
        let a = Statistics::new();
        a.increment(Statistic::UpdateCount, 2);
        let b = Statistics::new();
        b.increment(Statistic::UpdateCount, 5);
        b.incr(Statistic::TransformCount);

        let mut merged = a.snapshot();
        merged.merge(&b.snapshot());
        assert_eq!(merged.get(Statistic::UpdateCount), 7);
        assert_eq!(merged.get(Statistic::TransformCount), 1);
        assert_eq!(merged.to_string(), "UPDATE_COUNT=7, TRANSFORM_COUNT=1");
    }

    #[test]
    fn test_index_matches_all() {
        for (i, stat) in Statistic::ALL.iter().enumerate() {
            assert_eq!(stat.index(), i);
        }
    }

    #[test]
    fn test_reset() {
        let stats = Statistics::new();
        stats.set(Statistic::LineNumber, 10);
        stats.reset();
        assert_eq!(stats.get(Statistic::LineNumber), 0);
    }
}
