//! Cross-venue duplicate detection by title-embedding cosine similarity.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::embedding::Embedder;
use crate::error::{EmbedError, Result};
use crate::types::{DuplicateLink, Listing, ListingKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Index-order exclusive pairing: once a listing is linked it is not matched again.
    #[default]
    Greedy,
    /// Union-find over every candidate edge.
    Clustered,
}

impl MatchPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "greedy" => Some(MatchPolicy::Greedy),
            "clustered" | "cluster" => Some(MatchPolicy::Clustered),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Cosine similarity; 0 when either vector has zero norm.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

/// Full n×n cosine matrix. `m[i][j] == m[j][i]` bit for bit.
pub fn similarity_matrix(embeddings: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = embeddings.len();
    let mut m = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let s = cosine(&embeddings[i], &embeddings[j]);
            m[i][j] = s;
            m[j][i] = s;
        }
    }
    m
}

// ---------------------------------------------------------------------------
// Blocking pre-filter
// ---------------------------------------------------------------------------

/// Decides which pairs are worth comparing at all.
pub trait Blocking: Send + Sync {
    fn may_match(&self, a: &Listing, b: &Listing) -> bool;
}

pub struct NoBlocking;

impl Blocking for NoBlocking {
    fn may_match(&self, _a: &Listing, _b: &Listing) -> bool {
        true
    }
}

/// Buckets listings by close time in windows of `window_days`. Listings in the
/// same or adjacent buckets are compared; an unknown close time matches every bucket.
pub struct CloseTimeBlocking {
    window_secs: i64,
}

impl CloseTimeBlocking {
    pub fn new(window_days: u32) -> Self {
        Self { window_secs: i64::from(window_days.max(1)) * 86_400 }
    }

    fn bucket(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp().div_euclid(self.window_secs)
    }
}

impl Blocking for CloseTimeBlocking {
    fn may_match(&self, a: &Listing, b: &Listing) -> bool {
        match (a.close_time, b.close_time) {
            (Some(x), Some(y)) => (self.bucket(x) - self.bucket(y)).abs() <= 1,
            _ => true,
        }
    }
}

pub fn blocking_for(window_days: Option<u32>) -> Arc<dyn Blocking> {
    match window_days {
        Some(days) => Arc::new(CloseTimeBlocking::new(days)),
        None => Arc::new(NoBlocking),
    }
}

// ---------------------------------------------------------------------------
// Candidates and resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub i: usize,
    pub j: usize,
    pub score: f64,
}

/// Pairs `i < j` from different venues, inside one block, scoring strictly above `threshold`.
pub fn candidate_pairs(
    listings: &[Listing],
    matrix: &[Vec<f64>],
    threshold: f64,
    blocking: &dyn Blocking,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for i in 0..listings.len() {
        for j in (i + 1)..listings.len() {
            if listings[i].venue == listings[j].venue {
                continue;
            }
            if !blocking.may_match(&listings[i], &listings[j]) {
                continue;
            }
            let score = matrix[i][j];
            if score > threshold {
                out.push(Candidate { i, j, score });
            }
        }
    }
    out
}

/// Walk indices in order; an unconsumed listing takes every candidate whose
/// partner is still unconsumed, then it and those partners are consumed.
/// Returns the accepted edges and one group per consuming listing.
pub fn resolve_greedy(n: usize, candidates: &[Candidate]) -> (Vec<Candidate>, Vec<Vec<usize>>) {
    let mut by_index: Vec<Vec<Candidate>> = vec![Vec::new(); n];
    for c in candidates {
        by_index[c.i].push(*c);
        by_index[c.j].push(*c);
    }

    let mut consumed = vec![false; n];
    let mut accepted = Vec::new();
    let mut groups = Vec::new();
    for i in 0..n {
        if consumed[i] {
            continue;
        }
        let mut group = vec![i];
        for c in &by_index[i] {
            let other = if c.i == i { c.j } else { c.i };
            if consumed[other] || group.contains(&other) {
                continue;
            }
            accepted.push(*c);
            group.push(other);
        }
        if group.len() > 1 {
            for &k in &group {
                consumed[k] = true;
            }
            groups.push(group);
        }
    }
    (accepted, groups)
}

/// Every candidate edge is kept; groups are the connected components.
pub fn resolve_clustered(n: usize, candidates: &[Candidate]) -> (Vec<Candidate>, Vec<Vec<usize>>) {
    let mut sets = DisjointSet::new(n);
    for c in candidates {
        sets.union(c.i, c.j);
    }
    (candidates.to_vec(), sets.groups())
}

/// Union-find with path halving.
pub(crate) struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    pub(crate) fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins so groups are labelled by their first member.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }

    /// Components with at least two members, each sorted, ordered by first member.
    pub(crate) fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for x in 0..self.parent.len() {
            let r = self.find(x);
            by_root.entry(r).or_default().push(x);
        }
        by_root.into_values().filter(|g| g.len() > 1).collect()
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub links: Vec<DuplicateLink>,
    /// Listings resolved as one event, by key.
    pub clusters: Vec<Vec<ListingKey>>,
}

pub struct SimilarityMatcher {
    embedder: Arc<dyn Embedder>,
    threshold: f64,
    policy: MatchPolicy,
    blocking: Arc<dyn Blocking>,
}

impl SimilarityMatcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        threshold: f64,
        policy: MatchPolicy,
        blocking: Arc<dyn Blocking>,
    ) -> Self {
        Self { embedder, threshold, policy, blocking }
    }

    /// Embed every title, score all pairs and resolve them under the configured
    /// policy. `listings` is read only.
    pub async fn find_duplicates(
        &self,
        listings: &[Listing],
        now: DateTime<Utc>,
    ) -> Result<MatchOutcome> {
        if listings.len() < 2 {
            return Ok(MatchOutcome::default());
        }

        let titles: Vec<String> = listings.iter().map(|l| l.title.clone()).collect();
        let embeddings = self.embedder.embed(&titles).await?;
        if embeddings.len() != listings.len() {
            return Err(EmbedError::CountMismatch {
                expected: listings.len(),
                got: embeddings.len(),
            }
            .into());
        }

        // O(n²); keep it off the async workers.
        let owned = listings.to_vec();
        let blocking = Arc::clone(&self.blocking);
        let (threshold, policy) = (self.threshold, self.policy);
        let (accepted, groups) = tokio::task::spawn_blocking(move || {
            let matrix = similarity_matrix(&embeddings);
            let candidates = candidate_pairs(&owned, &matrix, threshold, blocking.as_ref());
            debug!(candidates = candidates.len(), "Candidate pairs above threshold");
            match policy {
                MatchPolicy::Greedy => resolve_greedy(owned.len(), &candidates),
                MatchPolicy::Clustered => resolve_clustered(owned.len(), &candidates),
            }
        })
        .await?;

        let links: Vec<DuplicateLink> = accepted
            .iter()
            .map(|c| DuplicateLink::canonical(listings[c.i].key(), listings[c.j].key(), c.score, now))
            .collect();
        let clusters = groups
            .into_iter()
            .map(|g| g.into_iter().map(|k| listings[k].key()).collect())
            .collect();

        info!(
            listings = listings.len(),
            links = links.len(),
            policy = ?self.policy,
            model = self.embedder.model(),
            "Matched {} duplicate pairs among {} listings",
            links.len(),
            listings.len(),
        );
        Ok(MatchOutcome { links, clusters })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{Venue, Volume};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Returns a fixed vector per title; unknown titles get a zero vector.
    pub(crate) struct StaticEmbedder {
        pub vectors: HashMap<String, Vec<f64>>,
    }

    impl StaticEmbedder {
        pub(crate) fn new(pairs: &[(&str, Vec<f64>)]) -> Arc<Self> {
            Arc::new(Self {
                vectors: pairs.iter().map(|(t, v)| (t.to_string(), v.clone())).collect(),
            })
        }
    }

    #[async_trait]
    impl Embedder for StaticEmbedder {
        fn model(&self) -> &str {
            "static"
        }

        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f64>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| vec![0.0, 0.0]))
                .collect())
        }
    }

    /// Unit vector at `cos` similarity to `[1, 0]`.
    pub(crate) fn at_similarity(cos: f64) -> Vec<f64> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    pub(crate) fn listing(venue: Venue, id: &str, title: &str) -> Listing {
        Listing {
            venue,
            external_id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            yes_price: Some(0.5),
            no_price: Some(0.5),
            volume: Volume::Unknown,
            volume_24h: Volume::Unknown,
            close_time: None,
            last_updated: DateTime::from_timestamp(0, 0).unwrap_or_default(),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn matcher(embedder: Arc<StaticEmbedder>, policy: MatchPolicy) -> SimilarityMatcher {
        SimilarityMatcher::new(embedder, 0.5, policy, Arc::new(NoBlocking))
    }

    #[test]
    fn matrix_is_symmetric_with_zero_vectors_scoring_zero() {
        let m = similarity_matrix(&[vec![1.0, 2.0], vec![0.3, -0.7], vec![0.0, 0.0]]);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(m[i][j], m[j][i]);
            }
        }
        assert!((m[0][0] - 1.0).abs() < 1e-12);
        assert_eq!(m[2][0], 0.0);
        assert_eq!(m[2][2], 0.0);
    }

    #[test]
    fn threshold_is_strict_and_same_venue_never_pairs() {
        let listings = vec![
            listing(Venue::Kalshi, "1", "a"),
            listing(Venue::Polymarket, "2", "b"),
            listing(Venue::Kalshi, "3", "c"),
        ];
        let matrix = vec![
            vec![1.0, 0.5, 0.99],
            vec![0.5, 1.0, 0.51],
            vec![0.99, 0.51, 1.0],
        ];
        let c = candidate_pairs(&listings, &matrix, 0.5, &NoBlocking);
        assert_eq!(c, vec![Candidate { i: 1, j: 2, score: 0.51 }]);
    }

    #[test]
    fn close_time_blocking_skips_distant_pairs() {
        let day = 86_400;
        let mut a = listing(Venue::Kalshi, "1", "a");
        let mut b = listing(Venue::Polymarket, "2", "b");
        let c = listing(Venue::Polymarket, "3", "c");
        a.close_time = DateTime::from_timestamp(100 * day, 0);
        b.close_time = DateTime::from_timestamp(200 * day, 0);
        let blocking = CloseTimeBlocking::new(7);
        assert!(!blocking.may_match(&a, &b));
        assert!(blocking.may_match(&a, &c), "unknown close time is compared with everything");
        b.close_time = DateTime::from_timestamp(103 * day, 0);
        assert!(blocking.may_match(&a, &b));
    }

    #[test]
    fn greedy_consumes_partners() {
        // 0 is similar to 1 and 3; 2 is similar to 1 only.
        let cands = vec![
            Candidate { i: 0, j: 1, score: 0.9 },
            Candidate { i: 0, j: 3, score: 0.8 },
            Candidate { i: 1, j: 2, score: 0.95 },
        ];
        let (accepted, groups) = resolve_greedy(4, &cands);
        assert_eq!(accepted.len(), 2);
        assert!(accepted.iter().all(|c| c.i == 0));
        assert_eq!(groups, vec![vec![0, 1, 3]]);
    }

    #[test]
    fn clustered_keeps_transitive_edges() {
        let cands = vec![
            Candidate { i: 0, j: 1, score: 0.9 },
            Candidate { i: 1, j: 2, score: 0.95 },
            Candidate { i: 3, j: 4, score: 0.7 },
        ];
        let (accepted, groups) = resolve_clustered(5, &cands);
        assert_eq!(accepted.len(), 3);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[tokio::test]
    async fn similar_titles_across_venues_form_one_link() {
        let embedder = StaticEmbedder::new(&[
            ("Will X happen by 2025?", vec![1.0, 0.0]),
            ("X occurs before 2025", at_similarity(0.62)),
        ]);
        let listings = vec![
            listing(Venue::Kalshi, "1", "Will X happen by 2025?"),
            listing(Venue::Polymarket, "9", "X occurs before 2025"),
        ];
        let before = listings.clone();
        let out = matcher(embedder, MatchPolicy::Greedy)
            .find_duplicates(&listings, now())
            .await
            .unwrap();

        assert_eq!(out.links.len(), 1);
        let link = &out.links[0];
        assert_eq!(link.a, ListingKey::new(Venue::Kalshi, "1"));
        assert_eq!(link.b, ListingKey::new(Venue::Polymarket, "9"));
        assert!((link.score - 0.62).abs() < 1e-9);
        assert_eq!(listings, before);
    }

    #[tokio::test]
    async fn identical_titles_on_one_venue_are_not_linked() {
        let embedder = StaticEmbedder::new(&[("Same", vec![1.0, 0.0])]);
        let listings = vec![listing(Venue::Kalshi, "1", "Same"), listing(Venue::Kalshi, "2", "Same")];
        let out = matcher(embedder, MatchPolicy::Clustered)
            .find_duplicates(&listings, now())
            .await
            .unwrap();
        assert!(out.links.is_empty());
        assert!(out.clusters.is_empty());
    }

    #[tokio::test]
    async fn policies_differ_on_chains() {
        // K1 ~ P1 ~ K2, but K1 and K2 are the same venue.
        let embedder = StaticEmbedder::new(&[
            ("k1", vec![1.0, 0.0]),
            ("p1", at_similarity(0.8)),
            ("k2", at_similarity(0.6)),
        ]);
        let listings = vec![
            listing(Venue::Kalshi, "K1", "k1"),
            listing(Venue::Polymarket, "P1", "p1"),
            listing(Venue::Kalshi, "K2", "k2"),
        ];

        let greedy = matcher(embedder.clone(), MatchPolicy::Greedy)
            .find_duplicates(&listings, now())
            .await
            .unwrap();
        assert_eq!(greedy.links.len(), 1);
        assert_eq!(greedy.links[0].a.external_id, "K1");

        let clustered = matcher(embedder, MatchPolicy::Clustered)
            .find_duplicates(&listings, now())
            .await
            .unwrap();
        assert_eq!(clustered.links.len(), 2);
        assert_eq!(clustered.clusters.len(), 1);
        assert_eq!(clustered.clusters[0].len(), 3);
    }

    #[test]
    fn policy_parse() {
        assert_eq!(MatchPolicy::parse("Clustered"), Some(MatchPolicy::Clustered));
        assert_eq!(MatchPolicy::parse("greedy"), Some(MatchPolicy::Greedy));
        assert_eq!(MatchPolicy::parse("nearest"), None);
    }
}
