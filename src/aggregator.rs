//! Pipeline entry points: fetch all venues through the cache, merge by stored
//! links, and run deduplication.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::cache::FreshnessCache;
use crate::error::Result;
use crate::ledger::DuplicateLedger;
use crate::matcher::{DisjointSet, SimilarityMatcher};
use crate::types::{DuplicateLink, Listing, ListingKey, MarketGroup, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    PerVenue,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AggregateResult {
    PerVenue(BTreeMap<Venue, Vec<Listing>>),
    Merged(Vec<MarketGroup>),
}

pub enum DedupInput {
    Listings(Vec<Listing>),
    /// Everything currently in the listing store.
    Persisted,
}

pub struct Aggregator {
    cache: Arc<FreshnessCache>,
    matcher: SimilarityMatcher,
    ledger: DuplicateLedger,
    ttl: Duration,
}

impl Aggregator {
    pub fn new(
        cache: Arc<FreshnessCache>,
        matcher: SimilarityMatcher,
        ledger: DuplicateLedger,
        ttl: Duration,
    ) -> Self {
        Self { cache, matcher, ledger, ttl }
    }

    pub fn ledger(&self) -> &DuplicateLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub async fn aggregate(&self, mode: AggregateMode, now: DateTime<Utc>) -> Result<AggregateResult> {
        let per_venue = self.fetch_all(now).await?;
        match mode {
            AggregateMode::PerVenue => Ok(AggregateResult::PerVenue(per_venue)),
            AggregateMode::Merged => {
                let listings: Vec<Listing> = per_venue.into_values().flatten().collect();
                let links = self.ledger.links().await?;
                Ok(AggregateResult::Merged(group_by_links(listings, &links)))
            }
        }
    }

    /// Every enabled venue concurrently. A venue whose fetch failed contributes
    /// its last snapshot or nothing; only store errors abort.
    async fn fetch_all(&self, now: DateTime<Utc>) -> Result<BTreeMap<Venue, Vec<Listing>>> {
        let venues = self.cache.venues();
        let results = join_all(
            venues
                .iter()
                .map(|&venue| self.cache.get_or_refresh(venue, now, self.ttl)),
        )
        .await;

        let mut out = BTreeMap::new();
        for (venue, result) in venues.into_iter().zip(results) {
            out.insert(venue, result?);
        }
        Ok(out)
    }

    /// Match `input` and record the links. Returns only links that were new.
    pub async fn deduplicate(&self, input: DedupInput, now: DateTime<Utc>) -> Result<Vec<DuplicateLink>> {
        let listings = match input {
            DedupInput::Listings(listings) => listings,
            DedupInput::Persisted => self.cache.store().all().await?,
        };
        let outcome = self.matcher.find_duplicates(&listings, now).await?;
        let created = self.ledger.record(&outcome.links).await?;
        info!(
            listings = listings.len(),
            matched = outcome.links.len(),
            clusters = outcome.clusters.len(),
            created = created.len(),
            "Deduplication pass complete"
        );
        Ok(created)
    }
}

/// Union listings over links whose both endpoints are present. Unlinked
/// listings become singleton groups; group order follows `listings`.
fn group_by_links(listings: Vec<Listing>, links: &[DuplicateLink]) -> Vec<MarketGroup> {
    let index: HashMap<ListingKey, usize> =
        listings.iter().enumerate().map(|(i, l)| (l.key(), i)).collect();
    let mut sets = DisjointSet::new(listings.len());
    let mut best: HashMap<usize, f64> = HashMap::new();
    let mut edges = Vec::new();

    for link in links {
        if let (Some(&a), Some(&b)) = (index.get(&link.a), index.get(&link.b)) {
            sets.union(a, b);
            edges.push((a, link.score));
        }
    }
    for (a, score) in edges {
        let root = sets.find(a);
        let entry = best.entry(root).or_insert(score);
        if score > *entry {
            *entry = score;
        }
    }

    let mut order: Vec<usize> = Vec::new();
    let mut members: HashMap<usize, Vec<Listing>> = HashMap::new();
    for (i, listing) in listings.into_iter().enumerate() {
        let root = sets.find(i);
        let group = members.entry(root).or_default();
        if group.is_empty() {
            order.push(root);
        }
        group.push(listing);
    }

    order
        .into_iter()
        .filter_map(|root| {
            let listings = members.remove(&root)?;
            Some(MarketGroup { listings, best_score: best.get(&root).copied() })
        })
        .collect()
}
