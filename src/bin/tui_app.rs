use std::collections::BTreeMap;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// API response types (mirror routes.rs shapes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KeyResponse {
    pub venue: String,
    pub external_id: String,
}

/// `volume` and `volume_24h` are a number or the string "unknown".
#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct QuoteResponse {
    pub title: String,
    pub yes_price: Option<f64>,
    pub no_price: Option<f64>,
    pub volume: serde_json::Value,
    pub volume_24h: serde_json::Value,
    pub close_time: Option<String>,
    pub last_updated: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateRow {
    pub a: KeyResponse,
    pub b: KeyResponse,
    pub score: f64,
    pub a_quote: Option<QuoteResponse>,
    pub b_quote: Option<QuoteResponse>,
    pub complete: bool,
}

impl DuplicateRow {
    /// Yes-price difference, side a minus side b. `None` unless both are quoted.
    pub fn yes_spread(&self) -> Option<f64> {
        let a = self.a_quote.as_ref()?.yes_price?;
        let b = self.b_quote.as_ref()?.yes_price?;
        Some(a - b)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct HealthResponse {
    pub status: String,
    pub listings: BTreeMap<String, i64>,
    pub duplicate_links: i64,
    pub dedup_runs: u64,
    pub dedup_failures: u64,
    pub last_dedup_at: Option<String>,
    pub last_dedup_new_links: u64,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Error(String),
    Connecting,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub status: ConnectionStatus,
    pub rows: Vec<DuplicateRow>,
    pub health: HealthResponse,
    pub last_refresh: std::time::Instant,
    pub base_url: String,
}

impl AppState {
    pub fn new(base_url: String) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            rows: Vec::new(),
            health: HealthResponse::default(),
            last_refresh: std::time::Instant::now(),
            base_url,
        }
    }

    pub fn incomplete_count(&self) -> usize {
        self.rows.iter().filter(|r| !r.complete).count()
    }

    pub async fn refresh(&mut self, client: &reqwest::Client) {
        let duplicates_url = format!("{}/duplicates", self.base_url);
        let health_url = format!("{}/health", self.base_url);

        let (duplicates_res, health_res) = tokio::join!(
            client.get(&duplicates_url).send(),
            client.get(&health_url).send(),
        );

        let response = match duplicates_res {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                self.status = ConnectionStatus::Error(format!("/duplicates returned {}", r.status()));
                return;
            }
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("{e}"));
                return;
            }
        };

        match response.json::<Vec<DuplicateRow>>().await {
            Ok(rows) => {
                self.rows = rows;
                self.status = ConnectionStatus::Connected;
                self.last_refresh = std::time::Instant::now();

                if let Ok(h) = health_res {
                    if let Ok(health) = h.json::<HealthResponse>().await {
                        self.health = health;
                    }
                }
            }
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("parse error: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

pub fn format_price(p: Option<f64>) -> String {
    match p {
        Some(v) => format!("{:.2}", v),
        None => "—".to_string(),
    }
}

pub fn format_spread(s: Option<f64>) -> String {
    match s {
        Some(v) => format!("{:+.3}", v),
        None => "—".to_string(),
    }
}

pub fn format_volume(v: &serde_json::Value) -> String {
    match v.as_f64() {
        Some(x) if x >= 1_000_000.0 => format!("{:.1}M", x / 1_000_000.0),
        Some(x) if x >= 1_000.0 => format!("{:.1}k", x / 1_000.0),
        Some(x) => format!("{:.0}", x),
        None => "?".to_string(),
    }
}

/// RFC 3339 timestamp to "YYYY-MM-DD HH:MM".
pub fn format_timestamp(ts: Option<&str>) -> String {
    match ts {
        Some(s) => s.get(..16).map_or_else(|| s.to_string(), |head| head.replace('T', " ")),
        None => "—".to_string(),
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

// Cargo's bin auto-discovery also builds this file; the TUI entry point is src/bin/tui.rs.
#[allow(dead_code)]
fn main() {}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(json: &str) -> DuplicateRow {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_joined_row_with_missing_side() {
        let r = row(r#"{
            "a": {"venue": "kalshi", "external_id": "K1"},
            "b": {"venue": "polymarket", "external_id": "0x1"},
            "score": 0.71,
            "a_quote": null,
            "b_quote": {
                "title": "Fed cut?", "yes_price": 0.4, "no_price": 0.6,
                "volume": "unknown", "volume_24h": 1200.0,
                "close_time": null, "last_updated": "2025-01-01T00:00:00Z"
            },
            "complete": false
        }"#);
        assert!(!r.complete);
        assert_eq!(r.yes_spread(), None);
        let b = r.b_quote.as_ref().unwrap();
        assert_eq!(format_volume(&b.volume), "?");
        assert_eq!(format_volume(&b.volume_24h), "1.2k");
    }

    #[test]
    fn formatting() {
        assert_eq!(format_spread(Some(0.05)), "+0.050");
        assert_eq!(format_spread(Some(-0.1)), "-0.100");
        assert_eq!(format_price(None), "—");
        assert_eq!(format_timestamp(Some("2025-03-19T18:00:00Z")), "2025-03-19 18:00");
        assert_eq!(truncate("héllo world", 5), "héll…");
    }
}
