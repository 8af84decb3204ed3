use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Venue
// ---------------------------------------------------------------------------

/// A prediction-market platform acting as a data source.
///
/// The derived ordering (Kalshi < Polymarket) is what the ledger uses to store
/// an unordered link pair in one canonical orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Kalshi,
    Polymarket,
}

impl Venue {
    pub const ALL: [Venue; 2] = [Venue::Kalshi, Venue::Polymarket];

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Kalshi => "kalshi",
            Venue::Polymarket => "polymarket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "kalshi" => Some(Venue::Kalshi),
            "polymarket" => Some(Venue::Polymarket),
            _ => None,
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Venues report volume inconsistently; anything not numeric degrades to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Volume {
    Known(f64),
    #[default]
    Unknown,
}

impl Volume {
    pub fn from_option(v: Option<f64>) -> Self {
        match v {
            Some(x) if x.is_finite() => Volume::Known(x),
            _ => Volume::Unknown,
        }
    }

    pub fn as_option(&self) -> Option<f64> {
        match self {
            Volume::Known(x) => Some(*x),
            Volume::Unknown => None,
        }
    }
}

impl Serialize for Volume {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Volume::Known(x) => serializer.serialize_f64(*x),
            Volume::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl<'de> Deserialize<'de> for Volume {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        Ok(Volume::from_option(v.as_f64()))
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Natural key of a listing: `external_id` is only unique within its venue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub venue: Venue,
    pub external_id: String,
}

impl ListingKey {
    pub fn new(venue: Venue, external_id: impl Into<String>) -> Self {
        Self { venue, external_id: external_id.into() }
    }
}

impl std::fmt::Display for ListingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.venue, self.external_id)
    }
}

/// One venue's market quote snapshot in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub venue: Venue,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume: Volume,
    pub volume_24h: Volume,
    pub close_time: Option<DateTime<Utc>>,
    /// Written by the cache layer, not the venue's own update time.
    pub last_updated: DateTime<Utc>,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.venue, self.external_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Duplicate links
// ---------------------------------------------------------------------------

/// Asserted cross-venue identity between two listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateLink {
    pub a: ListingKey,
    pub b: ListingKey,
    /// Cosine similarity at match time.
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl DuplicateLink {
    /// Builds a link with its endpoints in canonical (`a < b`) order.
    pub fn canonical(x: ListingKey, y: ListingKey, score: f64, created_at: DateTime<Utc>) -> Self {
        let (a, b) = match x.cmp(&y) {
            Ordering::Greater => (y, x),
            _ => (x, y),
        };
        Self { a, b, score, created_at }
    }

    pub fn is_cross_venue(&self) -> bool {
        self.a.venue != self.b.venue
    }
}

/// Quote fields of one side of a joined link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSide {
    pub title: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume: Volume,
    pub volume_24h: Volume,
    pub close_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// A stored link with both venues' quotes side by side.
/// A side is `None` when its listing row no longer exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRow {
    pub a: ListingKey,
    pub b: ListingKey,
    pub score: f64,
    pub a_quote: Option<QuoteSide>,
    pub b_quote: Option<QuoteSide>,
    pub complete: bool,
}

/// Listings that stored links identify as the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketGroup {
    pub listings: Vec<Listing>,
    /// Highest link score inside the group; `None` for singletons.
    pub best_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    #[test]
    fn canonical_link_orders_endpoints() {
        let k = ListingKey::new(Venue::Kalshi, "K1");
        let p = ListingKey::new(Venue::Polymarket, "P1");
        let l1 = DuplicateLink::canonical(p.clone(), k.clone(), 0.7, ts());
        let l2 = DuplicateLink::canonical(k.clone(), p.clone(), 0.7, ts());
        assert_eq!(l1, l2);
        assert_eq!(l1.a, k);
        assert!(l1.is_cross_venue());
    }

    #[test]
    fn volume_serializes_unknown_sentinel() {
        let json = serde_json::to_string(&[Volume::Known(12.5), Volume::Unknown]).unwrap();
        assert_eq!(json, r#"[12.5,"unknown"]"#);
        let back: Vec<Volume> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Volume::Known(12.5), Volume::Unknown]);
    }

    #[test]
    fn venue_parse_is_case_insensitive() {
        assert_eq!(Venue::parse(" Kalshi "), Some(Venue::Kalshi));
        assert_eq!(Venue::parse("POLYMARKET"), Some(Venue::Polymarket));
        assert_eq!(Venue::parse("predictit"), None);
    }
}
