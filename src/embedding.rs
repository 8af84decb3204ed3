//! Title embedding backends.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::EmbedError;

/// Output width of `all-MiniLM-L6-v2`; the hashing backend matches it.
pub const EMBEDDING_DIMS: usize = 384;

/// Function words that carry no signal about which event a title describes.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "by", "for", "in", "is", "it", "of", "on", "or", "the",
    "to", "will",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    Hashing,
    Http,
}

impl EmbeddingBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "hashing" | "local" => Some(EmbeddingBackend::Hashing),
            "http" => Some(EmbeddingBackend::Http),
            _ => None,
        }
    }
}

/// Maps texts to fixed-width vectors. One output vector per input, in order.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedError>;
}

pub fn build_embedder(cfg: &Config) -> Arc<dyn Embedder> {
    match cfg.embedding_backend {
        EmbeddingBackend::Http => Arc::new(HttpEmbedder::new(
            reqwest::Client::new(),
            &cfg.embedding_api_url,
            &cfg.embedding_model,
        )),
        EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(EMBEDDING_DIMS)),
    }
}

// ---------------------------------------------------------------------------
// Local feature hashing
// ---------------------------------------------------------------------------

/// Deterministic offline embedder: a signed hashed bag of lower-cased words,
/// L2-normalized. Scores word overlap, not meaning, so it pairs with
/// `DEFAULT_HASHING_SIMILARITY_THRESHOLD` rather than the model's threshold.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f64> {
        let mut v = vec![0.0; self.dims];
        for token in tokens(text) {
            let h = fnv1a(token.as_bytes());
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        "feature-hashing"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Remote model over an OpenAI-compatible embeddings endpoint
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
    #[serde(default)]
    index: Option<usize>,
}

pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            client,
            url: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(&self.url)
            .json(&EmbeddingRequest { model: &self.model, input: texts })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EmbedError::Status(response.status().as_u16()));
        }
        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Decode(e.to_string()))?;
        debug!(model = %self.model, count = body.data.len(), "Embeddings received");
        order_embeddings(body.data, texts.len())
    }
}

/// Restore input order (servers may return `data` shuffled) and check shape.
fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f64>>, EmbedError> {
    if data.len() != expected {
        return Err(EmbedError::CountMismatch { expected, got: data.len() });
    }
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    let vectors: Vec<Vec<f64>> = data.into_iter().map(|d| d.embedding).collect();
    if let Some(first) = vectors.first() {
        let width = first.len();
        if let Some(bad) = vectors.iter().find(|v| v.len() != width) {
            return Err(EmbedError::DimensionMismatch(width, bad.len()));
        }
    }
    Ok(vectors)
}
