use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{error, info};

use crate::aggregator::{AggregateMode, Aggregator, DedupInput};
use crate::api::health::HealthState;
use crate::error::Result;

/// Periodically refreshes every venue through the cache and links duplicates
/// among the persisted listings.
pub struct DedupJob {
    aggregator: Arc<Aggregator>,
    health: Arc<HealthState>,
    period: Duration,
}

impl DedupJob {
    pub fn new(aggregator: Arc<Aggregator>, health: Arc<HealthState>, period: Duration) -> Self {
        Self { aggregator, health, period }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.tick().await; // skip immediate first tick

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                self.health.record_dedup_failure();
                error!("Deduplication pass failed: {e}");
            }
        }
    }

    /// Returns the number of newly recorded links.
    pub async fn run_once(&self) -> Result<usize> {
        let now = Utc::now();
        self.aggregator.aggregate(AggregateMode::PerVenue, now).await?;
        let created = self.aggregator.deduplicate(DedupInput::Persisted, now).await?;
        let total = self.aggregator.ledger().count().await?;
        self.health.record_dedup(now, created.len());
        info!(new_links = created.len(), total_links = total, "Dedup job tick complete");
        Ok(created.len())
    }
}
