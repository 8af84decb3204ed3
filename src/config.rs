use std::str::FromStr;
use std::time::Duration;

use crate::embedding::EmbeddingBackend;
use crate::error::{AppError, Result};
use crate::matcher::MatchPolicy;
use crate::types::Venue;
use crate::venue::SourceShape;

pub const KALSHI_API_URL: &str = "https://api.elections.kalshi.com/trade-api/v2";
pub const POLYMARKET_CLOB_URL: &str = "https://clob.polymarket.com";
pub const POLYMARKET_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

/// Default sentence-embedding model identifier.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

/// OpenAI-compatible embeddings server hosting the model.
pub const DEFAULT_EMBEDDING_API_URL: &str = "http://127.0.0.1:8080";

/// Freshness window (seconds) for cached listings.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Listings whose title similarity strictly exceeds this are duplicates.
/// Calibrated for `all-MiniLM-L6-v2`.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.5;

/// Default threshold for the offline hashing backend. Word-overlap vectors
/// score titles that differ in one entity (e.g. a candidate name) near 0.75.
pub const DEFAULT_HASHING_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Upper bound on one venue's full paginated fetch (seconds).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;

/// Hard cap on records collected per venue per refresh.
pub const DEFAULT_MAX_RECORDS_PER_VENUE: usize = 1000;

pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Background deduplication interval (seconds).
pub const DEFAULT_DEDUP_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Freshness window (CACHE_TTL_SECS)
    pub cache_ttl: Duration,
    /// θ in (-1, 1) (SIMILARITY_THRESHOLD)
    pub similarity_threshold: f64,
    /// MATCH_POLICY: greedy | clustered
    pub match_policy: MatchPolicy,
    /// Close-time blocking window in days (BLOCKING_WINDOW_DAYS). None = compare everything.
    pub blocking_window_days: Option<u32>,
    pub kalshi_enabled: bool,
    pub polymarket_enabled: bool,
    /// Which Polymarket endpoints feed the venue (POLYMARKET_SOURCES, comma-separated).
    pub polymarket_sources: Vec<SourceShape>,
    pub kalshi_api_url: String,
    pub polymarket_clob_url: String,
    pub polymarket_gamma_url: String,
    pub embedding_backend: EmbeddingBackend,
    pub embedding_model: String,
    /// Base URL of the embeddings server (EMBEDDING_API_URL).
    pub embedding_api_url: String,
    pub fetch_timeout: Duration,
    pub max_records_per_venue: usize,
    pub page_size: usize,
    pub dedup_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Every malformed value is
    /// a configuration error; nothing here is re-checked at request time.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let embedding_backend = match get("EMBEDDING_BACKEND") {
            Some(s) => EmbeddingBackend::parse(&s).ok_or_else(|| {
                AppError::Config(format!("EMBEDDING_BACKEND must be hashing or http, got {s}"))
            })?,
            None => EmbeddingBackend::Http,
        };
        let default_threshold = match embedding_backend {
            EmbeddingBackend::Http => DEFAULT_SIMILARITY_THRESHOLD,
            EmbeddingBackend::Hashing => DEFAULT_HASHING_SIMILARITY_THRESHOLD,
        };

        let similarity_threshold: f64 = parse_or(&get, "SIMILARITY_THRESHOLD", default_threshold)?;
        if !(similarity_threshold > -1.0 && similarity_threshold < 1.0) {
            return Err(AppError::Config(format!(
                "SIMILARITY_THRESHOLD must be in (-1, 1), got {similarity_threshold}"
            )));
        }

        let match_policy = match get("MATCH_POLICY") {
            Some(s) => MatchPolicy::parse(&s).ok_or_else(|| {
                AppError::Config(format!("MATCH_POLICY must be greedy or clustered, got {s}"))
            })?,
            None => MatchPolicy::Greedy,
        };

        let blocking_window_days = match get("BLOCKING_WINDOW_DAYS") {
            Some(s) => Some(s.parse::<u32>().ok().filter(|d| *d > 0).ok_or_else(|| {
                AppError::Config(format!("BLOCKING_WINDOW_DAYS must be a positive integer, got {s}"))
            })?),
            None => None,
        };

        let polymarket_sources = match get("POLYMARKET_SOURCES") {
            Some(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| match p.to_lowercase().as_str() {
                    "clob" => Ok(SourceShape::PolymarketClob),
                    "gamma" => Ok(SourceShape::PolymarketGamma),
                    other => Err(AppError::Config(format!(
                        "POLYMARKET_SOURCES entries must be clob or gamma, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            None => vec![SourceShape::PolymarketClob, SourceShape::PolymarketGamma],
        };

        let max_records_per_venue: usize =
            parse_or(&get, "MAX_RECORDS_PER_VENUE", DEFAULT_MAX_RECORDS_PER_VENUE)?;
        let page_size: usize = parse_or(&get, "PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if max_records_per_venue == 0 || page_size == 0 {
            return Err(AppError::Config(
                "MAX_RECORDS_PER_VENUE and PAGE_SIZE must be positive".to_string(),
            ));
        }

        let cfg = Self {
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            db_path: get("DB_PATH").unwrap_or_else(|| "aggregator.db".to_string()),
            api_port: get("API_PORT")
                .unwrap_or_else(|| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            cache_ttl: Duration::from_secs(parse_or(&get, "CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?),
            similarity_threshold,
            match_policy,
            blocking_window_days,
            kalshi_enabled: parse_bool_or(&get, "KALSHI_ENABLED", true)?,
            polymarket_enabled: parse_bool_or(&get, "POLYMARKET_ENABLED", true)?,
            polymarket_sources,
            kalshi_api_url: get("KALSHI_API_URL").unwrap_or_else(|| KALSHI_API_URL.to_string()),
            polymarket_clob_url: get("POLYMARKET_CLOB_URL")
                .unwrap_or_else(|| POLYMARKET_CLOB_URL.to_string()),
            polymarket_gamma_url: get("POLYMARKET_GAMMA_URL")
                .unwrap_or_else(|| POLYMARKET_GAMMA_URL.to_string()),
            embedding_backend,
            embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            embedding_api_url: get("EMBEDDING_API_URL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_API_URL.to_string()),
            fetch_timeout: Duration::from_secs(parse_or(
                &get,
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            max_records_per_venue,
            page_size,
            dedup_interval: Duration::from_secs(parse_or(
                &get,
                "DEDUP_INTERVAL_SECS",
                DEFAULT_DEDUP_INTERVAL_SECS,
            )?),
        };

        if cfg.dedup_interval.is_zero() {
            return Err(AppError::Config("DEDUP_INTERVAL_SECS must be positive".to_string()));
        }
        if cfg.enabled_venues().is_empty() {
            return Err(AppError::Config("at least one venue must be enabled".to_string()));
        }

        Ok(cfg)
    }

    pub fn enabled_venues(&self) -> Vec<Venue> {
        Venue::ALL
            .into_iter()
            .filter(|v| match v {
                Venue::Kalshi => self.kalshi_enabled,
                Venue::Polymarket => self.polymarket_enabled && !self.polymarket_sources.is_empty(),
            })
            .collect()
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|s| s.to_lowercase()) {
        Some(s) => match s.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::Config(format!("{key} must be a boolean, got {s}"))),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.cache_ttl, Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
        assert_eq!(cfg.similarity_threshold, 0.5);
        assert_eq!(cfg.match_policy, MatchPolicy::Greedy);
        assert_eq!(cfg.embedding_backend, EmbeddingBackend::Http);
        assert_eq!(cfg.embedding_model, "all-MiniLM-L6-v2");
        assert_eq!(cfg.embedding_api_url, DEFAULT_EMBEDDING_API_URL);
        assert_eq!(cfg.enabled_venues(), vec![Venue::Kalshi, Venue::Polymarket]);
        assert_eq!(cfg.polymarket_sources.len(), 2);
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        assert!(matches!(config_from(&[("SIMILARITY_THRESHOLD", "1.5")]), Err(AppError::Config(_))));
        assert!(matches!(config_from(&[("SIMILARITY_THRESHOLD", "abc")]), Err(AppError::Config(_))));
        assert!(config_from(&[("SIMILARITY_THRESHOLD", "0.8")]).is_ok());
    }

    #[test]
    fn hashing_backend_uses_its_own_default_threshold() {
        let cfg = config_from(&[("EMBEDDING_BACKEND", "hashing")]).unwrap();
        assert_eq!(cfg.embedding_backend, EmbeddingBackend::Hashing);
        assert_eq!(cfg.similarity_threshold, DEFAULT_HASHING_SIMILARITY_THRESHOLD);

        let cfg = config_from(&[("EMBEDDING_BACKEND", "hashing"), ("SIMILARITY_THRESHOLD", "0.6")])
            .unwrap();
        assert_eq!(cfg.similarity_threshold, 0.6);
        assert!(config_from(&[("EMBEDDING_BACKEND", "onnx")]).is_err());
    }

    #[test]
    fn venue_toggles() {
        let cfg = config_from(&[("KALSHI_ENABLED", "false")]).unwrap();
        assert_eq!(cfg.enabled_venues(), vec![Venue::Polymarket]);
        assert!(config_from(&[("KALSHI_ENABLED", "false"), ("POLYMARKET_ENABLED", "0")]).is_err());
        assert!(config_from(&[("KALSHI_ENABLED", "maybe")]).is_err());
    }

    #[test]
    fn polymarket_sources_parse() {
        let cfg = config_from(&[("POLYMARKET_SOURCES", "gamma")]).unwrap();
        assert_eq!(cfg.polymarket_sources, vec![SourceShape::PolymarketGamma]);
        assert!(config_from(&[("POLYMARKET_SOURCES", "clob,rest")]).is_err());
    }
}
