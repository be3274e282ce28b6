//! Stream session counters
//!
//! A single snapshot shared by every session and served as JSON on
//! `/metrics`.

use crate::buffer::BufferStats;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Aggregate counters across all stream sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub failed_sessions: u64,
    pub bytes_served: u64,
    pub underruns: u64,
    pub retries: u64,
}

impl MetricsSnapshot {
    /// A session passed setup and is streaming
    pub fn session_started(&mut self) {
        self.active_sessions += 1;
        self.total_sessions += 1;
    }

    /// A request failed before streaming began
    pub fn session_failed(&mut self) {
        self.total_sessions += 1;
        self.failed_sessions += 1;
    }

    /// A streaming session ended, cleanly or not
    pub fn session_finished(&mut self, bytes_served: u64, stats: &BufferStats) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
        self.bytes_served += bytes_served;
        self.underruns += stats.underruns;
        self.retries += stats.retries;
    }
}

/// Shared metrics state for concurrent access across sessions.
///
/// The lock is synchronous so sessions can report from `Drop`.
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Copy of the current counters stamped with the current time
pub fn snapshot(metrics: &SharedMetrics) -> MetricsSnapshot {
    let mut snapshot = metrics.read().clone();
    snapshot.timestamp_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stats(underruns: u64, retries: u64) -> BufferStats {
        BufferStats {
            bytes_buffered: 0,
            bytes_consumed: 0,
            fill_ratio: 0.0,
            underruns,
            retries,
        }
    }

    #[test]
    fn test_session_lifecycle_counters() {
        let metrics = new_shared_metrics();
        metrics.write().session_started();
        metrics.write().session_started();
        metrics.write().session_failed();
        metrics.write().session_finished(4096, &stats(2, 1));

        let snap = snapshot(&metrics);
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.total_sessions, 3);
        assert_eq!(snap.failed_sessions, 1);
        assert_eq!(snap.bytes_served, 4096);
        assert_eq!(snap.underruns, 2);
        assert_eq!(snap.retries, 1);
        assert!(snap.timestamp_unix_ms > 0);
    }

    #[test]
    fn test_finish_without_start_does_not_underflow() {
        let mut snap = MetricsSnapshot::default();
        snap.session_finished(0, &stats(0, 0));
        assert_eq!(snap.active_sessions, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_metrics_snapshot_round_trip(
            timestamp in any::<i64>(),
            active_sessions in 0u64..1000,
            total_sessions in any::<u64>(),
            failed_sessions in any::<u64>(),
            bytes_served in any::<u64>(),
            underruns in any::<u64>(),
            retries in any::<u64>(),
        ) {
            let snapshot = MetricsSnapshot {
                timestamp_unix_ms: timestamp,
                active_sessions,
                total_sessions,
                failed_sessions,
                bytes_served,
                underruns,
                retries,
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: MetricsSnapshot = serde_json::from_str(&json)
                .expect("deserialization should succeed");

            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
