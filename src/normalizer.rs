//! Venue record → canonical [`Listing`].
//!
//! Every source quirk lives here: Kalshi quotes in integer cents, the Polymarket
//! CLOB quotes per outcome token and carries no volume, and Gamma event markets
//! quote only the yes side. Unknown or missing optional fields degrade to
//! `None` / [`Volume::Unknown`]; only a record with no usable identity is
//! rejected.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{NormalizationError, TransportError};
use crate::types::{Listing, ListingKey, Volume};
use crate::venue::{FetchFilters, RawRecord, SourceShape, VenueAdapter};

type NResult<T> = std::result::Result<T, NormalizationError>;

pub fn normalize(raw: &RawRecord, now: DateTime<Utc>) -> NResult<Listing> {
    match raw.shape {
        SourceShape::KalshiMarkets => normalize_kalshi(&raw.body, now),
        SourceShape::PolymarketClob => normalize_clob(&raw.body, now),
        SourceShape::PolymarketGamma => normalize_gamma(&raw.body, now),
    }
}

fn normalize_kalshi(v: &Value, now: DateTime<Utc>) -> NResult<Listing> {
    let external_id = first_str(v, &["ticker"]).ok_or(NormalizationError::MissingField("ticker"))?;
    let title = first_str(v, &["title"]).ok_or(NormalizationError::MissingField("title"))?;
    let description =
        first_str(v, &["subtitle", "yes_sub_title", "rules_primary"]).unwrap_or_default();

    // Kalshi quotes each side independently; never derive one from the other.
    let yes_price = check_price("yes_bid", kalshi_price(v, "yes_bid"))?;
    let no_price = check_price("no_bid", kalshi_price(v, "no_bid"))?;

    Ok(Listing {
        venue: SourceShape::KalshiMarkets.venue(),
        external_id,
        title,
        description,
        yes_price,
        no_price,
        volume: Volume::from_option(v.get("volume").and_then(num)),
        volume_24h: Volume::from_option(v.get("volume_24h").and_then(num)),
        close_time: first_str(v, &["close_time"]).as_deref().and_then(parse_time),
        last_updated: now,
    })
}

/// Prefer the dollar-denominated field when present, else cents / 100.
/// A zero bid means "no bid", not a price of zero.
fn kalshi_price(v: &Value, field: &str) -> Option<f64> {
    if let Some(d) = v.get(format!("{field}_dollars")).and_then(num) {
        return Some(d).filter(|p| *p > 0.0);
    }
    v.get(field).and_then(num).filter(|c| *c > 0.0).map(|c| c / 100.0)
}

fn normalize_clob(v: &Value, now: DateTime<Utc>) -> NResult<Listing> {
    let external_id =
        first_str(v, &["condition_id"]).ok_or(NormalizationError::MissingField("condition_id"))?;
    let title = first_str(v, &["question"]).ok_or(NormalizationError::MissingField("question"))?;
    let description = first_str(v, &["description"]).unwrap_or_default();

    let tokens = v.get("tokens").and_then(|t| t.as_array());
    let outcome_price = |label: &str| -> Option<f64> {
        tokens?
            .iter()
            .find(|t| {
                t.get("outcome")
                    .and_then(|o| o.as_str())
                    .is_some_and(|o| o.eq_ignore_ascii_case(label))
            })
            .and_then(|t| t.get("price"))
            .and_then(num)
    };

    let yes_price = check_price("tokens.yes.price", outcome_price("Yes"))?;
    let no_price = check_price("tokens.no.price", outcome_price("No"))?;

    Ok(Listing {
        venue: SourceShape::PolymarketClob.venue(),
        external_id,
        title,
        description,
        yes_price,
        no_price,
        volume: Volume::Unknown,
        volume_24h: Volume::Unknown,
        close_time: first_str(v, &["end_date_iso"]).as_deref().and_then(parse_time),
        last_updated: now,
    })
}

fn normalize_gamma(v: &Value, now: DateTime<Utc>) -> NResult<Listing> {
    let external_id =
        first_str(v, &["conditionId", "id"]).ok_or(NormalizationError::MissingField("conditionId"))?;
    let title = first_str(v, &["question"]).ok_or(NormalizationError::MissingField("question"))?;
    let description = first_str(v, &["description"]).unwrap_or_default();

    // `outcomePrices` is a JSON array encoded as a string: "[\"0.62\", \"0.38\"]".
    let from_outcomes = v
        .get("outcomePrices")
        .and_then(|s| s.as_str())
        .and_then(|s| serde_json::from_str::<Vec<Value>>(s).ok())
        .and_then(|prices| prices.first().and_then(num));
    let yes_price = check_price(
        "outcomePrices",
        from_outcomes.or_else(|| v.get("lastTradePrice").and_then(num)),
    )?;
    // Binary event markets are complementary by construction on this venue.
    let no_price = yes_price.map(|p| 1.0 - p);

    Ok(Listing {
        venue: SourceShape::PolymarketGamma.venue(),
        external_id,
        title,
        description,
        yes_price,
        no_price,
        volume: Volume::from_option(v.get("volumeNum").or_else(|| v.get("volume")).and_then(num)),
        volume_24h: Volume::from_option(v.get("volume24hr").and_then(num)),
        close_time: first_str(v, &["endDate", "endDateIso"]).as_deref().and_then(parse_time),
        last_updated: now,
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Numbers arrive as JSON numbers or numeric strings depending on the endpoint.
fn num(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .filter(|x| x.is_finite())
}

fn first_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k))
        .filter_map(|x| match x {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
}

fn check_price(field: &'static str, price: Option<f64>) -> NResult<Option<f64>> {
    match price {
        Some(p) if !(0.0..=1.0).contains(&p) => {
            Err(NormalizationError::PriceOutOfRange { field, value: p })
        }
        other => Ok(other),
    }
}

/// RFC 3339 timestamps, or bare `YYYY-MM-DD` dates taken as midnight UTC.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Per-source fetch accounting, logged by the cache after each refresh.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectStats {
    pub pages: usize,
    /// Records the venue sent, including ones the adapter filtered out.
    pub raw_records: usize,
    pub dropped: usize,
    pub hit_cap: bool,
}

/// Follow the adapter's cursor until end-of-data or `cap` raw records,
/// normalizing each page as it arrives. Malformed records are dropped and
/// logged; transport errors abort the whole collection.
pub async fn collect_listings(
    adapter: &dyn VenueAdapter,
    filters: &FetchFilters,
    cap: usize,
    now: DateTime<Utc>,
) -> std::result::Result<(Vec<Listing>, CollectStats), TransportError> {
    let mut listings = Vec::new();
    let mut stats = CollectStats::default();
    let mut cursor: Option<String> = None;

    loop {
        let page = adapter.fetch_page(cursor.as_deref(), filters).await?;
        stats.pages += 1;
        // A page emptied by adapter-side filtering may still carry a cursor.
        if page.records.is_empty() && page.next_cursor.is_none() {
            break;
        }

        let remaining = cap.saturating_sub(stats.raw_records);
        let scanned = page.scanned.max(page.records.len());
        stats.raw_records += scanned.min(remaining);
        for raw in page.records.iter().take(remaining) {
            match normalize(raw, now) {
                Ok(listing) => listings.push(listing),
                Err(e) => {
                    stats.dropped += 1;
                    warn!(source = %raw.shape, "Dropping malformed record: {e}");
                }
            }
        }

        if stats.raw_records >= cap {
            stats.hit_cap = page.next_cursor.is_some() || scanned > remaining;
            break;
        }
        match page.next_cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                warn!(source = %adapter.source(), "Venue repeated cursor {next:?}; stopping");
                break;
            }
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(
        source = %adapter.source(),
        pages = stats.pages,
        raw = stats.raw_records,
        dropped = stats.dropped,
        "Collected listings"
    );
    Ok((listings, stats))
}

/// Collapse listings sharing a key (one venue can list the same market on two
/// endpoints). The first occurrence wins; its missing fields are filled from
/// later ones.
pub fn merge_by_key(listings: Vec<Listing>) -> Vec<Listing> {
    let mut index: HashMap<ListingKey, usize> = HashMap::new();
    let mut merged: Vec<Listing> = Vec::with_capacity(listings.len());

    for listing in listings {
        match index.get(&listing.key()) {
            Some(&i) => {
                let existing = &mut merged[i];
                if existing.description.is_empty() {
                    existing.description = listing.description;
                }
                existing.yes_price = existing.yes_price.or(listing.yes_price);
                existing.no_price = existing.no_price.or(listing.no_price);
                if existing.volume == Volume::Unknown {
                    existing.volume = listing.volume;
                }
                if existing.volume_24h == Volume::Unknown {
                    existing.volume_24h = listing.volume_24h;
                }
                existing.close_time = existing.close_time.or(listing.close_time);
            }
            None => {
                index.insert(listing.key(), merged.len());
                merged.push(listing);
            }
        }
    }
    merged
}
