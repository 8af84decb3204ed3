use async_trait::async_trait;
use tracing::debug;

use super::{get_json, FetchFilters, Page, RawRecord, SourceShape, VenueAdapter};
use crate::error::TransportError;
use crate::types::Venue;

/// Kalshi caps `limit` at 1000 per request.
const KALSHI_MAX_PAGE: usize = 1000;

/// Public (unauthenticated) Kalshi market listing endpoint.
pub struct KalshiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl KalshiAdapter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl VenueAdapter for KalshiAdapter {
    fn source(&self) -> SourceShape {
        SourceShape::KalshiMarkets
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &FetchFilters,
    ) -> Result<Page, TransportError> {
        let url = format!("{}/markets", self.base_url);
        let mut query = vec![("limit", filters.page_size.min(KALSHI_MAX_PAGE).to_string())];
        if filters.open_only {
            query.push(("status", "open".to_string()));
        }
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }

        let body = get_json(&self.client, Venue::Kalshi, &url, &query).await?;
        let page = parse_markets_page(body)?;
        debug!(
            venue = "kalshi",
            records = page.records.len(),
            has_more = page.next_cursor.is_some(),
            "Kalshi page fetched"
        );
        Ok(page)
    }
}

/// `{ "markets": [...], "cursor": "..." }`. An empty cursor means no more pages.
pub fn parse_markets_page(body: serde_json::Value) -> Result<Page, TransportError> {
    let markets = body
        .get("markets")
        .and_then(|m| m.as_array())
        .ok_or_else(|| TransportError::Decode {
            venue: Venue::Kalshi,
            reason: "`markets` is not an array".to_string(),
        })?;

    let records: Vec<RawRecord> = markets
        .iter()
        .map(|m| RawRecord { shape: SourceShape::KalshiMarkets, body: m.clone() })
        .collect();

    let next_cursor = body
        .get("cursor")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty() && !records.is_empty())
        .map(str::to_string);

    Ok(Page::new(records, next_cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_markets_and_cursor() {
        let page = parse_markets_page(json!({
            "markets": [{ "ticker": "A" }, { "ticker": "B" }],
            "cursor": "abc"
        }))
        .unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].shape, SourceShape::KalshiMarkets);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_cursor_ends_pagination() {
        let page = parse_markets_page(json!({ "markets": [{ "ticker": "A" }], "cursor": "" })).unwrap();
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn non_array_markets_is_a_transport_error() {
        let err = parse_markets_page(json!({ "error": "nope" })).unwrap_err();
        assert!(matches!(err, TransportError::Decode { venue: Venue::Kalshi, .. }));
    }
}
