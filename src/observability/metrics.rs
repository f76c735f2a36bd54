//! Recovery metrics registry
//!
//! - Counters only
//! - Monotonic increase
//! - Thread-safe, lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::replication::RecoveryStats;

/// Operational counters of one shard's recovery.
///
/// Uses Relaxed ordering; counters are independent of each other.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    objects_recovered: AtomicU64,
    recovery_failures: AtomicU64,
    pulls_committed: AtomicU64,
    pull_rounds: AtomicU64,
    bytes_pulled: AtomicU64,
    push_targets_completed: AtomicU64,
    push_rounds: AtomicU64,
    bytes_pushed: AtomicU64,
    omap_keys_transferred: AtomicU64,
    deletes_propagated: AtomicU64,
    stale_commits_discarded: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_objects_recovered(&self) {
        self.objects_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recovery_failures(&self) {
        self.recovery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the statistics of a committed pull.
    pub fn record_pull(&self, stats: &RecoveryStats) {
        self.pulls_committed.fetch_add(1, Ordering::Relaxed);
        self.pull_rounds.fetch_add(stats.rounds, Ordering::Relaxed);
        self.bytes_pulled.fetch_add(stats.bytes, Ordering::Relaxed);
        self.omap_keys_transferred
            .fetch_add(stats.omap_keys, Ordering::Relaxed);
    }

    /// Fold the statistics of one completed push target.
    pub fn record_push(&self, stats: &RecoveryStats) {
        self.push_targets_completed.fetch_add(1, Ordering::Relaxed);
        self.push_rounds.fetch_add(stats.rounds, Ordering::Relaxed);
        self.bytes_pushed.fetch_add(stats.bytes, Ordering::Relaxed);
        self.omap_keys_transferred
            .fetch_add(stats.omap_keys, Ordering::Relaxed);
    }

    pub fn increment_deletes_propagated(&self) {
        self.deletes_propagated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stale_commits(&self) {
        self.stale_commits_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_messages_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            objects_recovered: self.objects_recovered.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            pulls_committed: self.pulls_committed.load(Ordering::Relaxed),
            pull_rounds: self.pull_rounds.load(Ordering::Relaxed),
            bytes_pulled: self.bytes_pulled.load(Ordering::Relaxed),
            push_targets_completed: self.push_targets_completed.load(Ordering::Relaxed),
            push_rounds: self.push_rounds.load(Ordering::Relaxed),
            bytes_pushed: self.bytes_pushed.load(Ordering::Relaxed),
            omap_keys_transferred: self.omap_keys_transferred.load(Ordering::Relaxed),
            deletes_propagated: self.deletes_propagated.load(Ordering::Relaxed),
            stale_commits_discarded: self.stale_commits_discarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub objects_recovered: u64,
    pub recovery_failures: u64,
    pub pulls_committed: u64,
    pub pull_rounds: u64,
    pub bytes_pulled: u64,
    pub push_targets_completed: u64,
    pub push_rounds: u64,
    pub bytes_pushed: u64,
    pub omap_keys_transferred: u64,
    pub deletes_propagated: u64,
    pub stale_commits_discarded: u64,
    pub messages_dropped: u64,
}
