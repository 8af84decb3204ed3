//! Venue adapters: one per physical listing endpoint.
//!
//! Adapters only move raw pages over the wire. Field mapping lives in the
//! normalizer, which branches on [`SourceShape`].

pub mod kalshi;
pub mod polymarket;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, TransportError};
use crate::types::Venue;

pub use kalshi::KalshiAdapter;
pub use polymarket::{PolymarketClobAdapter, PolymarketGammaAdapter};

/// Per-request HTTP timeout; the cache bounds the whole paginated fetch separately.
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Which endpoint (and therefore which JSON schema) a raw record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceShape {
    /// Kalshi `/markets`: prices in integer cents, both sides quoted.
    KalshiMarkets,
    /// Polymarket CLOB `/markets`: per-outcome token prices, no volume.
    PolymarketClob,
    /// Polymarket Gamma `/markets`: event markets, yes-side price only.
    PolymarketGamma,
}

impl SourceShape {
    pub fn venue(&self) -> Venue {
        match self {
            SourceShape::KalshiMarkets => Venue::Kalshi,
            SourceShape::PolymarketClob | SourceShape::PolymarketGamma => Venue::Polymarket,
        }
    }
}

impl std::fmt::Display for SourceShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceShape::KalshiMarkets => "kalshi_markets",
            SourceShape::PolymarketClob => "polymarket_clob",
            SourceShape::PolymarketGamma => "polymarket_gamma",
        };
        write!(f, "{s}")
    }
}

/// One venue record exactly as received, tagged with its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub shape: SourceShape,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// `None` when the venue signalled end-of-data.
    pub next_cursor: Option<String>,
    /// Records the venue sent, before adapter-side filtering. Counts against
    /// the record cap so filtered pages still bound the walk.
    pub scanned: usize,
}

impl Page {
    /// An unfiltered page: everything the venue sent is in `records`.
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<String>) -> Self {
        let scanned = records.len();
        Self { records, next_cursor, scanned }
    }
}

#[derive(Debug, Clone)]
pub struct FetchFilters {
    pub page_size: usize,
    pub open_only: bool,
}

impl Default for FetchFilters {
    fn default() -> Self {
        Self { page_size: crate::config::DEFAULT_PAGE_SIZE, open_only: true }
    }
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn source(&self) -> SourceShape;

    fn venue(&self) -> Venue {
        self.source().venue()
    }

    /// Fetch one page. `cursor = None` starts from the beginning.
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &FetchFilters,
    ) -> std::result::Result<Page, TransportError>;
}

/// The venue clients, constructed once at startup and shared by reference.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    adapters: BTreeMap<Venue, Vec<Arc<dyn VenueAdapter>>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn VenueAdapter>) {
        self.adapters.entry(adapter.venue()).or_default().push(adapter);
    }

    /// Builds the enabled venues' adapters from config.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        let mut registry = Self::new();
        if cfg.kalshi_enabled {
            registry.register(Arc::new(KalshiAdapter::new(client.clone(), &cfg.kalshi_api_url)));
        }
        if cfg.polymarket_enabled {
            for shape in &cfg.polymarket_sources {
                let adapter: Arc<dyn VenueAdapter> = match shape {
                    SourceShape::PolymarketGamma => Arc::new(PolymarketGammaAdapter::new(
                        client.clone(),
                        &cfg.polymarket_gamma_url,
                    )),
                    _ => Arc::new(PolymarketClobAdapter::new(
                        client.clone(),
                        &cfg.polymarket_clob_url,
                    )),
                };
                registry.register(adapter);
            }
        }

        for (venue, sources) in &registry.adapters {
            let names: Vec<String> = sources.iter().map(|a| a.source().to_string()).collect();
            info!(venue = %venue, "Venue enabled with sources: {}", names.join(", "));
        }
        Ok(registry)
    }

    pub fn venues(&self) -> Vec<Venue> {
        self.adapters.keys().copied().collect()
    }

    pub fn adapters_for(&self, venue: Venue) -> &[Arc<dyn VenueAdapter>] {
        self.adapters.get(&venue).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// GET a JSON document, mapping non-2xx and undecodable bodies to transport errors.
pub(crate) async fn get_json(
    client: &reqwest::Client,
    venue: Venue,
    url: &str,
    query: &[(&str, String)],
) -> std::result::Result<serde_json::Value, TransportError> {
    let resp = client.get(url).query(query).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Status { venue, status: status.as_u16() });
    }
    resp.json::<serde_json::Value>()
        .await
        .map_err(|e| TransportError::Decode { venue, reason: e.to_string() })
}
