//! Shared deduplication status for the /health endpoint.
//! Updated by DedupJob and the POST /deduplicate handler.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// 0 in `last_dedup_at_ms` means no pass has finished yet.
#[derive(Default)]
pub struct HealthState {
    pub dedup_runs: AtomicU64,
    pub dedup_failures: AtomicU64,
    pub last_dedup_at_ms: AtomicI64,
    pub last_dedup_new_links: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dedup(&self, at: DateTime<Utc>, new_links: usize) {
        self.dedup_runs.fetch_add(1, Ordering::Relaxed);
        self.last_dedup_at_ms.store(at.timestamp_millis(), Ordering::Relaxed);
        self.last_dedup_new_links.store(new_links as u64, Ordering::Relaxed);
    }

    pub fn record_dedup_failure(&self) {
        self.dedup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dedup_runs(&self) -> u64 {
        self.dedup_runs.load(Ordering::Relaxed)
    }

    pub fn dedup_failures(&self) -> u64 {
        self.dedup_failures.load(Ordering::Relaxed)
    }

    pub fn last_dedup_at(&self) -> Option<DateTime<Utc>> {
        match self.last_dedup_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn last_dedup_new_links(&self) -> u64 {
        self.last_dedup_new_links.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_last_pass() {
        let health = HealthState::new();
        assert_eq!(health.last_dedup_at(), None);

        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        health.record_dedup(at, 3);
        health.record_dedup_failure();

        assert_eq!(health.dedup_runs(), 1);
        assert_eq!(health.dedup_failures(), 1);
        assert_eq!(health.last_dedup_at(), Some(at));
        assert_eq!(health.last_dedup_new_links(), 3);
    }
}
