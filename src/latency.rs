//! Per-venue fetch latency, recorded by the freshness cache and read by the API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::types::Venue;

/// Values stored in milliseconds.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
    failures: AtomicU64,
}

impl LatencyStats {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 3_600_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
            failures: AtomicU64::new(0),
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().clamp(1, 3_600_000) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(ms);
        }
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Return (p50_ms, p95_ms, p99_ms). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VenueLatency {
    pub venue: Venue,
    pub samples: u64,
    pub failures: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Default)]
pub struct FetchLatency {
    per_venue: DashMap<Venue, LatencyStats>,
}

impl FetchLatency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, venue: Venue, d: Duration) {
        self.per_venue.entry(venue).or_default().record(d);
    }

    pub fn record_failure(&self, venue: Venue) {
        self.per_venue.entry(venue).or_default().record_failure();
    }

    pub fn snapshot(&self) -> Vec<VenueLatency> {
        let mut out: Vec<VenueLatency> = self
            .per_venue
            .iter()
            .map(|entry| {
                let (p50_ms, p95_ms, p99_ms) = entry.value().percentiles();
                VenueLatency {
                    venue: *entry.key(),
                    samples: entry.value().len(),
                    failures: entry.value().failures(),
                    p50_ms,
                    p95_ms,
                    p99_ms,
                }
            })
            .collect();
        out.sort_by_key(|v| v.venue);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_per_venue_samples() {
        let latency = FetchLatency::new();
        latency.record(Venue::Kalshi, Duration::from_millis(120));
        latency.record(Venue::Kalshi, Duration::from_millis(80));
        latency.record_failure(Venue::Polymarket);

        let snap = latency.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].venue, Venue::Kalshi);
        assert_eq!(snap[0].samples, 2);
        assert!(snap[0].p99_ms.unwrap() >= 119);
        assert_eq!(snap[1].failures, 1);
        assert_eq!(snap[1].p50_ms, None);
    }
}
