mod aggregator;
mod api;
mod cache;
mod config;
mod db;
mod dedup_job;
mod embedding;
mod error;
mod latency;
mod ledger;
mod matcher;
mod normalizer;
mod types;
mod venue;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::aggregator::Aggregator;
use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::cache::FreshnessCache;
use crate::config::Config;
use crate::db::ListingStore;
use crate::dedup_job::DedupJob;
use crate::embedding::build_embedder;
use crate::error::Result;
use crate::latency::FetchLatency;
use crate::ledger::DuplicateLedger;
use crate::matcher::{blocking_for, SimilarityMatcher};
use crate::venue::{FetchFilters, VenueRegistry};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    let store = ListingStore::new(pool);
    let ledger = DuplicateLedger::new(store.pool().clone());

    // --- Venues and cache ---
    let venues = VenueRegistry::from_config(&cfg)?;
    let latency = Arc::new(FetchLatency::new());
    let filters = FetchFilters { page_size: cfg.page_size, open_only: true };
    let cache = Arc::new(FreshnessCache::new(
        store,
        venues,
        Arc::clone(&latency),
        filters,
        cfg.max_records_per_venue,
        cfg.fetch_timeout,
    ));

    // --- Matcher ---
    let embedder = build_embedder(&cfg);
    let matcher = SimilarityMatcher::new(
        Arc::clone(&embedder),
        cfg.similarity_threshold,
        cfg.match_policy,
        blocking_for(cfg.blocking_window_days),
    );
    info!(
        model = embedder.model(),
        threshold = cfg.similarity_threshold,
        policy = ?cfg.match_policy,
        blocking_window_days = ?cfg.blocking_window_days,
        "Similarity matcher ready"
    );

    let aggregator = Arc::new(Aggregator::new(cache, matcher, ledger, cfg.cache_ttl));
    let health = Arc::new(HealthState::new());

    // --- Spawn tasks ---

    // Dedup job (background, every DEDUP_INTERVAL_SECS)
    let job = DedupJob::new(Arc::clone(&aggregator), Arc::clone(&health), cfg.dedup_interval);
    tokio::spawn(async move { job.run().await });

    // HTTP API server
    let api_state = ApiState { aggregator, latency, health };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        ttl_secs = cfg.cache_ttl.as_secs(),
        dedup_interval_secs = cfg.dedup_interval.as_secs(),
        "HTTP API listening on {bind_addr}"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
