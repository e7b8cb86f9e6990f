//! Scout-local metrics. A small set of atomic counters rather than a
//! full metrics-registry integration — spec.md's Non-goals exclude
//! exporting these anywhere, but a production client still tracks them
//! internally so a caller can log or poll a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ScoutMetrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    fetch_retries: AtomicU64,
    commits_attempted: AtomicU64,
    commit_batches: AtomicU64,
    commit_batch_objects: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoutMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub fetch_retries: u64,
    pub commits_attempted: u64,
    pub commit_batches: u64,
    /// Average number of transactions per committed batch, or 0 if none
    /// have been committed yet.
    pub avg_commit_batch_size: f64,
}

impl ScoutMetrics {
    pub fn new() -> Self {
        ScoutMetrics::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_retry(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_batch(&self, batch_size: usize) {
        self.commit_batches.fetch_add(1, Ordering::Relaxed);
        self.commits_attempted.fetch_add(batch_size as u64, Ordering::Relaxed);
        self.commit_batch_objects.fetch_add(batch_size as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScoutMetricsSnapshot {
        let commit_batches = self.commit_batches.load(Ordering::Relaxed);
        let commits_attempted = self.commits_attempted.load(Ordering::Relaxed);
        ScoutMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            commits_attempted,
            commit_batches,
            avg_commit_batch_size: if commit_batches == 0 {
                0.0
            } else {
                commits_attempted as f64 / commit_batches as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = ScoutMetrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_commit_batch(4);
        metrics.record_commit_batch(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.commit_batches, 2);
        assert_eq!(snap.avg_commit_batch_size, 3.0);
    }
}
