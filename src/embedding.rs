//! Concrete embedding providers.
//!
//! Implementations of [`EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: every call fails fatally; builds carry no
//!   vectors and queries run lexical-only.
//! - **[`HashedProvider`]**: deterministic offline feature hashing. No
//!   network, no model files; used for offline builds and tests.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings`.
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//!
//! # Error mapping
//!
//! Each `embed` call makes exactly one attempt. Retrying is the scheduler's
//! job, so the HTTP providers only classify failures:
//! - HTTP 429 (rate limited) and 5xx (server error) → [`ProviderError::Retryable`]
//! - Network and timeout errors → [`ProviderError::Retryable`]
//! - Other 4xx and malformed responses → [`ProviderError::Fatal`]
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use pkgsearch::config::EmbeddingConfig;
//! # use pkgsearch::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bm25::{DefaultTokenizer, Tokenizer};
use sha2::{Digest, Sha256};

use pkgsearch_core::embedding::{check_response, l2_normalize, EmbeddingProvider};
use pkgsearch_core::error::ProviderError;
use pkgsearch_core::lexical::Analyzer;

use crate::config::EmbeddingConfig;

/// Rough token estimate used for rate budgeting.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Fatal("embedding provider is disabled".into()))
    }
}

// ============ Hashed Provider ============

/// Feature-hashing embedder.
///
/// Each token from the lexical analyzer is hashed with SHA-256; the first
/// eight bytes pick a bucket and the next byte a sign. The bucket counts
/// are L2-normalized, so texts sharing vocabulary land close together under
/// cosine similarity.
pub struct HashedProvider {
    dims: usize,
    tokenizer: DefaultTokenizer,
}

impl HashedProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            tokenizer: Analyzer::default().tokenizer(),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return vector;
        }
        for token in self.tokenizer.tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_name(&self) -> &str {
        "hashed"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ HTTP helpers ============

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Classify a non-success HTTP status.
fn status_error(service: &str, status: reqwest::StatusCode, body: String) -> ProviderError {
    let message = format!("{} API error {}: {}", service, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Retryable(message)
    } else {
        ProviderError::Fatal(message)
    }
}

fn transport_error(service: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Retryable(format!("{} request failed: {}", service, err))
}

async fn post_json(
    service: &str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(service, e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(service, status, body));
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::Fatal(format!("{} returned invalid JSON: {}", service, e)))
}

fn parse_vector(value: &serde_json::Value, service: &str) -> Result<Vec<f32>, ProviderError> {
    let values = value.as_array().ok_or_else(|| {
        ProviderError::Fatal(format!("Invalid {} response: embedding is not an array", service))
    })?;
    values
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                ProviderError::Fatal(format!("Invalid {} response: non-numeric value", service))
            })
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            dims,
            url,
            api_key,
            client: http_client(Duration::from_secs(config.batch_timeout_secs))?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body);
        let json = post_json("OpenAI", request).await?;
        let vectors = parse_openai_response(&json)?;
        check_response(texts, &vectors, self.dims)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        ProviderError::Fatal("Invalid OpenAI response: missing data array".into())
    })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item.get("embedding").ok_or_else(|| {
            ProviderError::Fatal("Invalid OpenAI response: missing embedding".into())
        })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            client: http_client(Duration::from_secs(config.batch_timeout_secs))?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body);
        let json = post_json("Ollama", request).await?;
        let vectors = parse_ollama_response(&json)?;
        check_response(texts, &vectors, self.dims)?;
        Ok(vectors)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ProviderError::Fatal("Invalid Ollama response: missing embeddings array".into())
        })?;
    embeddings
        .iter()
        .map(|e| parse_vector(e, "Ollama"))
        .collect()
}

/// Instantiate the configured provider.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hashed" => {
            let dims = config
                .dims
                .ok_or_else(|| anyhow!("embedding.dims required for hashed provider"))?;
            Ok(Arc::new(HashedProvider::new(dims)))
        }
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
