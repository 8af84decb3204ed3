use async_trait::async_trait;
use tracing::debug;

use super::{get_json, FetchFilters, Page, RawRecord, SourceShape, VenueAdapter};
use crate::error::TransportError;
use crate::types::Venue;

/// CLOB's terminal cursor (base64 of "-1").
const CLOB_END_CURSOR: &str = "LTE=";

// ---------------------------------------------------------------------------
// CLOB: generic markets
// ---------------------------------------------------------------------------

pub struct PolymarketClobAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl PolymarketClobAdapter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl VenueAdapter for PolymarketClobAdapter {
    fn source(&self) -> SourceShape {
        SourceShape::PolymarketClob
    }

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &FetchFilters,
    ) -> Result<Page, TransportError> {
        let url = format!("{}/markets", self.base_url);
        let query: Vec<(&str, String)> = cursor
            .map(|c| vec![("next_cursor", c.to_string())])
            .unwrap_or_default();

        let body = get_json(&self.client, Venue::Polymarket, &url, &query).await?;
        let page = parse_clob_page(body, filters.open_only)?;
        debug!(
            venue = "polymarket",
            source = "clob",
            records = page.records.len(),
            has_more = page.next_cursor.is_some(),
            "CLOB page fetched"
        );
        Ok(page)
    }
}

/// `{ "data": [...], "next_cursor": "..." }`. Page size is fixed server-side.
pub fn parse_clob_page(body: serde_json::Value, open_only: bool) -> Result<Page, TransportError> {
    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| TransportError::Decode {
            venue: Venue::Polymarket,
            reason: "CLOB `data` is not an array".to_string(),
        })?;

    let next_cursor = body
        .get("next_cursor")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty() && *c != CLOB_END_CURSOR && !data.is_empty())
        .map(str::to_string);

    let records = data
        .iter()
        .filter(|m| !open_only || !is_closed(m))
        .map(|m| RawRecord { shape: SourceShape::PolymarketClob, body: m.clone() })
        .collect();

    Ok(Page { records, next_cursor, scanned: data.len() })
}

fn is_closed(m: &serde_json::Value) -> bool {
    m.get("closed").and_then(|c| c.as_bool()).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Gamma: event markets
// ---------------------------------------------------------------------------

pub struct PolymarketGammaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl PolymarketGammaAdapter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl VenueAdapter for PolymarketGammaAdapter {
    fn source(&self) -> SourceShape {
        SourceShape::PolymarketGamma
    }

    /// Gamma paginates by offset; the cursor is the next offset as a string.
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &FetchFilters,
    ) -> Result<Page, TransportError> {
        let offset = match cursor {
            Some(c) => c.parse::<usize>().map_err(|_| TransportError::Decode {
                venue: Venue::Polymarket,
                reason: format!("invalid Gamma offset cursor {c:?}"),
            })?,
            None => 0,
        };

        let url = format!("{}/markets", self.base_url);
        let mut query = vec![
            ("limit", filters.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        if filters.open_only {
            query.push(("active", "true".to_string()));
            query.push(("closed", "false".to_string()));
        }

        let body = get_json(&self.client, Venue::Polymarket, &url, &query).await?;
        let page = parse_gamma_page(body, offset, filters.page_size)?;
        debug!(
            venue = "polymarket",
            source = "gamma",
            offset,
            records = page.records.len(),
            has_more = page.next_cursor.is_some(),
            "Gamma page fetched"
        );
        Ok(page)
    }
}

/// Gamma returns a bare array; a short page is the last one.
pub fn parse_gamma_page(
    body: serde_json::Value,
    offset: usize,
    page_size: usize,
) -> Result<Page, TransportError> {
    let items = body.as_array().ok_or_else(|| TransportError::Decode {
        venue: Venue::Polymarket,
        reason: "Gamma /markets response was not an array".to_string(),
    })?;

    let next_cursor = if items.is_empty() || items.len() < page_size {
        None
    } else {
        Some((offset + items.len()).to_string())
    };

    let records = items
        .iter()
        .map(|m| RawRecord { shape: SourceShape::PolymarketGamma, body: m.clone() })
        .collect();

    Ok(Page::new(records, next_cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clob_end_cursor_stops() {
        let page = parse_clob_page(
            json!({ "data": [{ "condition_id": "0x1" }], "next_cursor": "LTE=" }),
            true,
        )
        .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn clob_filters_closed_markets_when_open_only() {
        let body = json!({
            "data": [
                { "condition_id": "0x1", "closed": true },
                { "condition_id": "0x2", "closed": false }
            ],
            "next_cursor": "MTAw"
        });
        let open = parse_clob_page(body.clone(), true).unwrap();
        assert_eq!(open.records.len(), 1);
        assert_eq!(open.scanned, 2, "filtered records still count as scanned");
        assert_eq!(open.next_cursor.as_deref(), Some("MTAw"));
        let all = parse_clob_page(body, false).unwrap();
        assert_eq!(all.records.len(), 2);
    }

    #[test]
    fn gamma_offset_cursor_advances_on_full_page() {
        let body = json!([{ "id": "1" }, { "id": "2" }]);
        let page = parse_gamma_page(body, 40, 2).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("42"));
        assert!(page.records.iter().all(|r| r.shape == SourceShape::PolymarketGamma));
    }

    #[test]
    fn gamma_short_page_is_last() {
        let page = parse_gamma_page(json!([{ "id": "1" }]), 0, 50).unwrap();
        assert!(page.next_cursor.is_none());
        assert!(parse_gamma_page(json!({ "oops": 1 }), 0, 50).is_err());
    }
}
