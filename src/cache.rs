//! Read-through, TTL-gated listing cache with one in-flight refresh per venue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::{from_millis, to_millis, ListingStore};
use crate::error::{Result, TransportError};
use crate::latency::FetchLatency;
use crate::normalizer::{collect_listings, merge_by_key};
use crate::types::{Listing, Venue};
use crate::venue::{FetchFilters, VenueRegistry};

/// Per-venue refresh coordination. `attempts` counts finished refresh
/// attempts, successful or not, and only changes while `lock` is held.
#[derive(Default)]
struct RefreshSlot {
    lock: Mutex<()>,
    attempts: AtomicU64,
}

pub struct FreshnessCache {
    store: ListingStore,
    venues: VenueRegistry,
    /// One refresh slot per venue. Same-venue writers serialize here.
    refresh_slots: DashMap<Venue, Arc<RefreshSlot>>,
    latency: Arc<FetchLatency>,
    filters: FetchFilters,
    max_records: usize,
    fetch_timeout: Duration,
}

impl FreshnessCache {
    pub fn new(
        store: ListingStore,
        venues: VenueRegistry,
        latency: Arc<FetchLatency>,
        filters: FetchFilters,
        max_records: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            venues,
            refresh_slots: DashMap::new(),
            latency,
            filters,
            max_records,
            fetch_timeout,
        }
    }

    pub fn venues(&self) -> Vec<Venue> {
        self.venues.venues()
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    /// Serve listings for `venue` younger than `ttl`, refetching only when none are.
    ///
    /// Transport failures and timeouts never escape: the last persisted
    /// snapshot (possibly stale, possibly empty) is returned instead. Store
    /// errors do escape.
    pub async fn get_or_refresh(
        &self,
        venue: Venue,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<Listing>> {
        // Rows carry millisecond timestamps; keep `now` at the same precision so
        // a fresh fetch and a later cache hit compare equal.
        let now = from_millis(to_millis(now));
        let since = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let cached = self.store.fresh_for_venue(venue, since).await?;
        if !cached.is_empty() {
            debug!(venue = %venue, count = cached.len(), "Cache hit");
            return Ok(cached);
        }

        let slot = self.refresh_slots.entry(venue).or_default().clone();
        let seen = slot.attempts.load(Ordering::Acquire);
        let _guard = slot.lock.lock().await;

        // A refresh finished while we waited: share its outcome, even a failed one.
        if slot.attempts.load(Ordering::Acquire) != seen {
            let fresh = self.store.fresh_for_venue(venue, since).await?;
            if !fresh.is_empty() {
                debug!(venue = %venue, count = fresh.len(), "Cache filled by concurrent refresh");
                return Ok(fresh);
            }
            let stale = self.store.all_for_venue(venue).await?;
            debug!(venue = %venue, stale_count = stale.len(), "Concurrent refresh failed; serving stale");
            return Ok(stale);
        }

        let result = self.refresh(venue, now).await;
        slot.attempts.fetch_add(1, Ordering::Release);
        result
    }

    /// Fetch, persist and return `venue`'s listings, falling back to the
    /// persisted snapshot on transport failure. Caller holds the venue's lock.
    async fn refresh(&self, venue: Venue, now: DateTime<Utc>) -> Result<Vec<Listing>> {
        let started = Instant::now();
        let fetched = match tokio::time::timeout(self.fetch_timeout, self.fetch_venue(venue, now)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { venue, secs: self.fetch_timeout.as_secs() }),
        };

        match fetched {
            Ok(mut listings) => {
                self.latency.record(venue, started.elapsed());
                self.store.upsert_many(&listings).await?;
                listings.sort_by(|a, b| a.external_id.cmp(&b.external_id));
                info!(
                    venue = %venue,
                    count = listings.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Cache refreshed: {} listings from {venue}",
                    listings.len(),
                );
                Ok(listings)
            }
            Err(e) => {
                self.latency.record_failure(venue);
                let stale = self.store.all_for_venue(venue).await?;
                warn!(
                    venue = %venue,
                    stale_count = stale.len(),
                    "Venue fetch failed, serving last persisted snapshot: {e}"
                );
                Ok(stale)
            }
        }
    }

    /// Collect every source of `venue`, sharing one record budget. A failed
    /// source is logged and skipped; the venue fails only if every source does.
    async fn fetch_venue(
        &self,
        venue: Venue,
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<Listing>, TransportError> {
        let mut all = Vec::new();
        let mut budget = self.max_records;
        let mut succeeded = 0;
        let mut last_err = None;

        for adapter in self.venues.adapters_for(venue) {
            if budget == 0 {
                warn!(venue = %venue, source = %adapter.source(), "Record cap reached; skipping source");
                continue;
            }
            let (listings, stats) =
                match collect_listings(adapter.as_ref(), &self.filters, budget, now).await {
                    Ok(collected) => collected,
                    Err(e) => {
                        warn!(venue = %venue, source = %adapter.source(), "Source fetch failed: {e}");
                        last_err = Some(e);
                        continue;
                    }
                };
            succeeded += 1;
            budget = budget.saturating_sub(stats.raw_records);
            if stats.hit_cap {
                warn!(
                    venue = %venue,
                    source = %adapter.source(),
                    cap = self.max_records,
                    "Stopped paginating at record cap"
                );
            }
            all.extend(listings);
        }

        match last_err {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(merge_by_key(all)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::venue::{Page, RawRecord, SourceShape, VenueAdapter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Single-page adapter with switchable failure and an optional delay.
    pub(crate) struct StubAdapter {
        pub shape: SourceShape,
        pub records: std::sync::Mutex<Vec<serde_json::Value>>,
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
        pub delay: Duration,
    }

    impl StubAdapter {
        pub(crate) fn new(shape: SourceShape, records: Vec<serde_json::Value>) -> Arc<Self> {
            Arc::new(Self {
                shape,
                records: std::sync::Mutex::new(records),
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
            })
        }

        pub(crate) fn failing(shape: SourceShape) -> Arc<Self> {
            let s = Self::new(shape, vec![]);
            s.fail.store(true, Ordering::SeqCst);
            s
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VenueAdapter for StubAdapter {
        fn source(&self) -> SourceShape {
            self.shape
        }

        async fn fetch_page(
            &self,
            _cursor: Option<&str>,
            _filters: &FetchFilters,
        ) -> std::result::Result<Page, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Status { venue: self.shape.venue(), status: 503 });
            }
            let records = self
                .records
                .lock()
                .map(|r| r.clone())
                .unwrap_or_default()
                .into_iter()
                .map(|body| RawRecord { shape: self.shape, body })
                .collect();
            Ok(Page::new(records, None))
        }
    }

    pub(crate) fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    pub(crate) fn kalshi_market(ticker: &str, title: &str, yes_cents: i64) -> serde_json::Value {
        json!({ "ticker": ticker, "title": title, "yes_bid": yes_cents, "no_bid": 100 - yes_cents })
    }

    pub(crate) async fn cache_with(adapters: Vec<Arc<StubAdapter>>) -> FreshnessCache {
        let mut registry = VenueRegistry::new();
        for a in adapters {
            registry.register(a);
        }
        FreshnessCache::new(
            ListingStore::new(connect_in_memory().await.unwrap()),
            registry,
            Arc::new(FetchLatency::new()),
            FetchFilters::default(),
            100,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn second_call_within_ttl_hits_cache() {
        let adapter = StubAdapter::new(
            SourceShape::KalshiMarkets,
            vec![kalshi_market("B", "Second", 40), kalshi_market("A", "First", 55)],
        );
        let cache = cache_with(vec![adapter.clone()]).await;
        let ttl = Duration::from_secs(60);

        let first = cache.get_or_refresh(Venue::Kalshi, at(1000), ttl).await.unwrap();
        let second = cache.get_or_refresh(Venue::Kalshi, at(1010), ttl).await.unwrap();

        assert_eq!(adapter.calls(), 1);
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ttl_window_scenario() {
        let adapter = StubAdapter::new(SourceShape::KalshiMarkets, vec![kalshi_market("A", "X", 50)]);
        let cache = cache_with(vec![adapter.clone()]).await;
        let ttl = Duration::from_secs(5);

        cache.get_or_refresh(Venue::Kalshi, at(0), ttl).await.unwrap();
        assert_eq!(adapter.calls(), 1);
        cache.get_or_refresh(Venue::Kalshi, at(3), ttl).await.unwrap();
        assert_eq!(adapter.calls(), 1, "t=3s is inside the window");
        let refreshed = cache.get_or_refresh(Venue::Kalshi, at(6), ttl).await.unwrap();
        assert_eq!(adapter.calls(), 2, "t=6s is outside the window");
        assert_eq!(refreshed[0].last_updated, at(6));
    }

    #[tokio::test]
    async fn refetch_upserts_and_advances_last_updated() {
        let adapter = StubAdapter::new(SourceShape::KalshiMarkets, vec![kalshi_market("A", "Old", 30)]);
        let cache = cache_with(vec![adapter.clone()]).await;
        let ttl = Duration::from_secs(5);

        cache.get_or_refresh(Venue::Kalshi, at(0), ttl).await.unwrap();
        *adapter.records.lock().unwrap() = vec![kalshi_market("A", "New", 70)];
        cache.get_or_refresh(Venue::Kalshi, at(100), ttl).await.unwrap();

        let rows = cache.store().all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "New");
        assert!((rows[0].yes_price.unwrap() - 0.70).abs() < 1e-9);
        assert_eq!(rows[0].last_updated, at(100));
    }

    #[tokio::test]
    async fn failure_without_cache_returns_empty() {
        let adapter = StubAdapter::failing(SourceShape::KalshiMarkets);
        let cache = cache_with(vec![adapter.clone()]).await;
        let out = cache.get_or_refresh(Venue::Kalshi, at(0), Duration::from_secs(5)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn failure_serves_stale_snapshot() {
        let adapter = StubAdapter::new(SourceShape::KalshiMarkets, vec![kalshi_market("A", "X", 50)]);
        let cache = cache_with(vec![adapter.clone()]).await;
        let ttl = Duration::from_secs(5);

        cache.get_or_refresh(Venue::Kalshi, at(0), ttl).await.unwrap();
        adapter.fail.store(true, Ordering::SeqCst);
        let stale = cache.get_or_refresh(Venue::Kalshi, at(60), ttl).await.unwrap();

        assert_eq!(adapter.calls(), 2);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].last_updated, at(0));
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let adapter = Arc::new(StubAdapter {
            shape: SourceShape::KalshiMarkets,
            records: std::sync::Mutex::new(vec![kalshi_market("A", "X", 50)]),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(200),
        });
        let mut registry = VenueRegistry::new();
        registry.register(adapter.clone());
        let cache = FreshnessCache::new(
            ListingStore::new(connect_in_memory().await.unwrap()),
            registry,
            Arc::new(FetchLatency::new()),
            FetchFilters::default(),
            100,
            Duration::from_millis(20),
        );
        let out = cache.get_or_refresh(Venue::Kalshi, at(0), Duration::from_secs(5)).await.unwrap();
        assert!(out.is_empty());
        assert!(cache.store().all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let adapter = Arc::new(StubAdapter {
            shape: SourceShape::KalshiMarkets,
            records: std::sync::Mutex::new(vec![kalshi_market("A", "X", 50)]),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(cache_with(vec![adapter.clone()]).await);
        let ttl = Duration::from_secs(30);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_refresh(Venue::Kalshi, at(10), ttl).await })
            })
            .collect();

        for t in tasks {
            let listings = t.await.unwrap().unwrap();
            assert_eq!(listings.len(), 1);
        }
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failed_refresh() {
        let adapter = Arc::new(StubAdapter {
            shape: SourceShape::KalshiMarkets,
            records: std::sync::Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(cache_with(vec![adapter.clone()]).await);
        let ttl = Duration::from_secs(30);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_refresh(Venue::Kalshi, at(10), ttl).await })
            })
            .collect();

        for t in tasks {
            assert!(t.await.unwrap().unwrap().is_empty());
        }
        assert_eq!(adapter.calls(), 1, "waiters reuse the failed attempt");

        // A later call is a new attempt.
        cache.get_or_refresh(Venue::Kalshi, at(11), ttl).await.unwrap();
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn failed_source_does_not_discard_sibling_source() {
        let clob = StubAdapter::failing(SourceShape::PolymarketClob);
        let gamma = StubAdapter::new(
            SourceShape::PolymarketGamma,
            vec![json!({ "conditionId": "0x9", "question": "Will Y happen?", "lastTradePrice": 0.3 })],
        );
        let cache = cache_with(vec![clob.clone(), gamma.clone()]).await;
        let out = cache
            .get_or_refresh(Venue::Polymarket, at(0), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(clob.calls(), 1);
        assert_eq!(gamma.calls(), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].external_id, "0x9");
        assert_eq!(cache.store().all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_source_failing_serves_stale_snapshot() {
        let clob = StubAdapter::new(
            SourceShape::PolymarketClob,
            vec![json!({ "condition_id": "0x1", "question": "Will X happen?" })],
        );
        let gamma = StubAdapter::failing(SourceShape::PolymarketGamma);
        let cache = cache_with(vec![clob.clone(), gamma]).await;
        let ttl = Duration::from_secs(5);

        cache.get_or_refresh(Venue::Polymarket, at(0), ttl).await.unwrap();
        clob.fail.store(true, Ordering::SeqCst);
        let stale = cache.get_or_refresh(Venue::Polymarket, at(60), ttl).await.unwrap();

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].last_updated, at(0));
    }

    #[tokio::test]
    async fn polymarket_sources_are_merged_by_condition_id() {
        let clob = StubAdapter::new(
            SourceShape::PolymarketClob,
            vec![json!({
                "condition_id": "0x1",
                "question": "Will X happen by 2025?",
                "tokens": [{ "outcome": "Yes", "price": 0.6 }, { "outcome": "No", "price": 0.4 }]
            })],
        );
        let gamma = StubAdapter::new(
            SourceShape::PolymarketGamma,
            vec![
                json!({ "conditionId": "0x1", "question": "Will X happen by 2025?", "volumeNum": 500 }),
                json!({ "conditionId": "0x2", "question": "Other", "lastTradePrice": 0.1 }),
            ],
        );
        let cache = cache_with(vec![clob, gamma]).await;
        let out = cache
            .get_or_refresh(Venue::Polymarket, at(0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].external_id, "0x1");
        assert_eq!(out[0].yes_price, Some(0.6));
        assert_eq!(out[0].volume, crate::types::Volume::Known(500.0));
    }
}
