//! Asynchronous capture error accounting.
//!
//! The driver keeps cumulative per-category error counters, such as dropped
//! frames, transfer failures and buffer exhaustion, and fires the
//! capture-status event whenever they change. The device status observer
//! reads those counters and merges the *deltas* into [`ErrorStats`], which
//! keeps for each category:
//!
//! - an accumulated event count
//! - a bounded history of `(timestamp, new events)` entries
//!
//! `ErrorStats` is written by the observer thread and read from anywhere, so
//! it sits behind a `parking_lot::RwLock`. Readers get cloned snapshots.

use crate::driver::{CaptureErrorKind, CaptureStatusInfo};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Default number of history entries kept per category.
pub const DEFAULT_HISTORY_LEN: usize = 64;

/// New errors of one category, as passed to the error callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureErrorEvent {
    /// Category that grew.
    pub kind: CaptureErrorKind,
    /// Errors added since the previous observation.
    pub new_events: u32,
    /// Accumulated count after this observation.
    pub total: u64,
    /// When the growth was observed.
    pub timestamp: DateTime<Utc>,
}

/// User callback for newly observed capture errors.
pub type ErrorCallback = Arc<dyn Fn(&CaptureErrorEvent) + Send + Sync>;

/// Accumulated errors of one category.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Total errors observed.
    pub count: u64,
    /// Most recent observations, oldest first.
    pub history: VecDeque<(DateTime<Utc>, u32)>,
}

/// Point-in-time copy of [`ErrorStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorStatsSnapshot {
    /// Records of every category seen so far.
    pub records: BTreeMap<CaptureErrorKind, ErrorRecord>,
}

impl ErrorStatsSnapshot {
    /// Errors of one category.
    pub fn count(&self, kind: CaptureErrorKind) -> u64 {
        self.records.get(&kind).map_or(0, |r| r.count)
    }

    /// Errors of all categories.
    pub fn total(&self) -> u64 {
        self.records.values().map(|r| r.count).sum()
    }

    /// Nothing recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    records: BTreeMap<CaptureErrorKind, ErrorRecord>,
    /// Last raw driver counter per category.
    last_seen: BTreeMap<CaptureErrorKind, u32>,
}

/// Per-category capture error statistics.
#[derive(Debug)]
pub struct ErrorStats {
    inner: RwLock<StatsInner>,
    history_len: usize,
}

impl Default for ErrorStats {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl ErrorStats {
    /// Empty statistics keeping `history_len` entries per category.
    pub fn new(history_len: usize) -> Self {
        Self {
            inner: RwLock::new(StatsInner::default()),
            history_len: history_len.max(1),
        }
    }

    /// Merge a driver counter reading.
    ///
    /// Returns one event per category whose counter grew since the previous
    /// reading. A counter that went backwards is treated as reset by the
    /// driver, and its whole value counts as new.
    pub fn merge(&self, status: &CaptureStatusInfo, now: DateTime<Utc>) -> Vec<CaptureErrorEvent> {
        let mut inner = self.inner.write();
        let mut events = Vec::new();

        for (&kind, &current) in &status.counts {
            let previous = inner.last_seen.insert(kind, current).unwrap_or(0);
            let delta = if current >= previous {
                current - previous
            } else {
                current
            };
            if delta == 0 {
                continue;
            }

            let record = inner.records.entry(kind).or_default();
            record.count += u64::from(delta);
            record.history.push_back((now, delta));
            while record.history.len() > self.history_len {
                record.history.pop_front();
            }

            events.push(CaptureErrorEvent {
                kind,
                new_events: delta,
                total: record.count,
                timestamp: now,
            });
        }

        events
    }

    /// Copy of the current statistics.
    pub fn snapshot(&self) -> ErrorStatsSnapshot {
        ErrorStatsSnapshot {
            records: self.inner.read().records.clone(),
        }
    }

    /// Errors of one category.
    pub fn count(&self, kind: CaptureErrorKind) -> u64 {
        self.inner.read().records.get(&kind).map_or(0, |r| r.count)
    }

    /// Errors of all categories.
    pub fn total(&self) -> u64 {
        self.inner.read().records.values().map(|r| r.count).sum()
    }

    /// Forget every record and baseline.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.last_seen.clear();
    }
}
