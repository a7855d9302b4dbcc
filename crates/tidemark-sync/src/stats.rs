//! Run statistics.
//!
//! Stats are reported on every outcome, including failures, and travel
//! inside continuation envelopes so a chain of invocations accumulates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Converts a collection length to a counter increment.
pub(crate) fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Statistics for schema reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Partition pages fully processed.
    pub pages_scanned: u64,
    /// Partitions examined.
    pub partitions_observed: u64,
    /// Partitions whose schema differed from the table's.
    pub diff_count: u64,
    /// Partitions actually updated.
    pub synced_count: u64,
    /// Earliest partition time seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_time: Option<DateTime<Utc>>,
    /// Latest partition time seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<DateTime<Utc>>,
}

impl SyncStats {
    /// Widens the observed time range to include `t`.
    pub fn observe(&mut self, t: DateTime<Utc>) {
        self.min_time = Some(self.min_time.map_or(t, |m| m.min(t)));
        self.max_time = Some(self.max_time.map_or(t, |m| m.max(t)));
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.pages_scanned += other.pages_scanned;
        self.partitions_observed += other.partitions_observed;
        self.diff_count += other.diff_count;
        self.synced_count += other.synced_count;
        if let Some(t) = other.min_time {
            self.observe(t);
        }
        if let Some(t) = other.max_time {
            self.observe(t);
        }
    }
}

/// Statistics for partition recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverStats {
    /// Partitions created.
    pub recovered: u64,
    /// Missing hours whose prefix held data.
    pub hits: u64,
    /// Missing hours whose prefix held no data.
    pub misses: u64,
    /// Partitions whose creation failed.
    pub failed: u64,
}

impl RecoverStats {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.recovered += other.recovered;
        self.hits += other.hits;
        self.misses += other.misses;
        self.failed += other.failed;
    }
}

/// Stats of either task family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStats {
    /// Reconciliation stats.
    Sync(SyncStats),
    /// Recovery stats.
    Recover(RecoverStats),
}

impl TaskStats {
    /// Returns the sync stats, if these are sync stats.
    #[must_use]
    pub const fn as_sync(&self) -> Option<&SyncStats> {
        match self {
            Self::Sync(stats) => Some(stats),
            Self::Recover(_) => None,
        }
    }

    /// Returns the recovery stats, if these are recovery stats.
    #[must_use]
    pub const fn as_recover(&self) -> Option<&RecoverStats> {
        match self {
            Self::Recover(stats) => Some(stats),
            Self::Sync(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sync_merge_adds_counts_and_widens_range() {
        let early = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();

        let mut a = SyncStats {
            pages_scanned: 1,
            partitions_observed: 10,
            ..SyncStats::default()
        };
        a.observe(late);
        let mut b = SyncStats {
            pages_scanned: 2,
            diff_count: 3,
            synced_count: 3,
            ..SyncStats::default()
        };
        b.observe(early);

        a.merge(&b);
        assert_eq!(a.pages_scanned, 3);
        assert_eq!(a.partitions_observed, 10);
        assert_eq!(a.diff_count, 3);
        assert_eq!(a.min_time, Some(early));
        assert_eq!(a.max_time, Some(late));
    }

    #[test]
    fn task_stats_serialize_with_kind_tag() {
        let stats = TaskStats::Recover(RecoverStats {
            recovered: 2,
            misses: 1,
            ..RecoverStats::default()
        });
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["kind"], "recover");
        assert_eq!(json["recovered"], 2);
        assert_eq!(stats.as_recover().map(|s| s.misses), Some(1));
    }
}
