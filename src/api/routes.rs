use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregator::{AggregateMode, AggregateResult, Aggregator, DedupInput};
use crate::api::health::HealthState;
use crate::error::AppError;
use crate::latency::{FetchLatency, VenueLatency};
use crate::types::{DuplicateLink, JoinedRow, Listing, ListingKey, Venue};

#[derive(Clone)]
pub struct ApiState {
    pub aggregator: Arc<Aggregator>,
    pub latency: Arc<FetchLatency>,
    pub health: Arc<HealthState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/markets", get(get_markets))
        .route("/markets/:venue/:external_id", get(get_listing).delete(delete_listing))
        .route("/deduplicate", post(post_deduplicate))
        .route("/duplicates", get(get_duplicates))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MarketsQuery {
    /// Group listings by stored duplicate links instead of by venue.
    pub dedup: Option<bool>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub listings: BTreeMap<Venue, i64>,
    pub duplicate_links: i64,
    pub dedup_runs: u64,
    pub dedup_failures: u64,
    pub last_dedup_at: Option<DateTime<Utc>>,
    pub last_dedup_new_links: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_markets(
    State(state): State<ApiState>,
    Query(params): Query<MarketsQuery>,
) -> Result<Json<AggregateResult>, AppError> {
    let mode = if params.dedup.unwrap_or(false) {
        AggregateMode::Merged
    } else {
        AggregateMode::PerVenue
    };
    let result = state.aggregator.aggregate(mode, Utc::now()).await?;
    Ok(Json(result))
}

/// An empty body means "everything persisted"; otherwise a JSON array of listings.
fn dedup_input(body: &[u8]) -> Result<DedupInput, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DedupInput::Persisted);
    }
    let listings: Vec<Listing> = serde_json::from_slice(body)?;
    Ok(DedupInput::Listings(listings))
}

async fn post_deduplicate(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Vec<DuplicateLink>>, AppError> {
    let input = dedup_input(&body)?;
    let now = Utc::now();
    match state.aggregator.deduplicate(input, now).await {
        Ok(created) => {
            state.health.record_dedup(now, created.len());
            Ok(Json(created))
        }
        Err(e) => {
            state.health.record_dedup_failure();
            Err(e)
        }
    }
}

fn listing_key(venue: &str, external_id: String) -> Result<ListingKey, AppError> {
    let venue = Venue::parse(venue).ok_or_else(|| AppError::NotFound(format!("unknown venue {venue}")))?;
    Ok(ListingKey::new(venue, external_id))
}

/// One persisted listing by key, as last cached. Never triggers a venue fetch.
async fn get_listing(
    State(state): State<ApiState>,
    Path((venue, external_id)): Path<(String, String)>,
) -> Result<Json<Listing>, AppError> {
    let key = listing_key(&venue, external_id)?;
    state
        .aggregator
        .cache()
        .store()
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no listing {key}")))
}

/// Drop one persisted listing. Links to it remain and show as incomplete.
async fn delete_listing(
    State(state): State<ApiState>,
    Path((venue, external_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let key = listing_key(&venue, external_id)?;
    if state.aggregator.cache().store().delete(&key).await? {
        info!(listing = %key, "Listing deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no listing {key}")))
    }
}

async fn get_duplicates(
    State(state): State<ApiState>,
) -> Result<Json<Vec<JoinedRow>>, AppError> {
    let rows = state.aggregator.ledger().joined_view().await?;
    Ok(Json(rows))
}

async fn get_health(
    State(state): State<ApiState>,
) -> Result<Json<HealthResponse>, AppError> {
    let listings = state.aggregator.cache().store().count_by_venue().await?;
    let duplicate_links = state.aggregator.ledger().count().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        listings,
        duplicate_links,
        dedup_runs: state.health.dedup_runs(),
        dedup_failures: state.health.dedup_failures(),
        last_dedup_at: state.health.last_dedup_at(),
        last_dedup_new_links: state.health.last_dedup_new_links(),
    }))
}

async fn get_stats_latency(
    State(state): State<ApiState>,
) -> Json<Vec<VenueLatency>> {
    Json(state.latency.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Volume;

    #[test]
    fn empty_body_dedups_persisted_listings() {
        assert!(matches!(dedup_input(b""), Ok(DedupInput::Persisted)));
        assert!(matches!(dedup_input(b"  \n"), Ok(DedupInput::Persisted)));
    }

    #[test]
    fn listing_array_body_is_deduplicated_as_given() {
        let listing = Listing {
            venue: Venue::Kalshi,
            external_id: "KX-FED".to_string(),
            title: "Fed cuts rates in March".to_string(),
            description: String::new(),
            yes_price: Some(0.35),
            no_price: Some(0.65),
            volume: Volume::Unknown,
            volume_24h: Volume::Known(10.0),
            close_time: None,
            last_updated: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let body = serde_json::to_vec(&vec![listing.clone()]).unwrap();
        match dedup_input(&body) {
            Ok(DedupInput::Listings(got)) => assert_eq!(got, vec![listing]),
            _ => panic!("expected an explicit listing set"),
        }
    }

    #[test]
    fn listing_key_parses_venue_path_segment() {
        let key = listing_key("Polymarket", "0xabc".to_string()).unwrap();
        assert_eq!(key, ListingKey::new(Venue::Polymarket, "0xabc"));
        assert!(matches!(listing_key("predictit", "1".to_string()), Err(AppError::NotFound(_))));
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert!(matches!(dedup_input(b"{\"not\": \"a list\"}"), Err(AppError::Json(_))));
    }
}
