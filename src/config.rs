//! TOML configuration.
//!
//! Every section is optional; missing fields fall back to the defaults
//! below. [`load_config`] parses and validates the whole file before any
//! command touches the data directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pkgsearch_core::compress::CompressionSettings;
use pkgsearch_core::lexical::{Analyzer, Bm25Params, Stemmer, Stopwords};
use pkgsearch_core::retry::RetryPolicy;
use pkgsearch_core::search::SearchParams;
use pkgsearch_core::snapshot::IndexSettings;
use pkgsearch_core::vector::{DistanceMetric, HnswParams};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lexical: LexicalConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
    /// Retired artifact files kept on disk after a cutover.
    #[serde(default = "default_keep_retired")]
    pub keep_retired: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
            keep_retired: default_keep_retired(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_keep_retired() -> usize {
    2
}

impl DataConfig {
    pub fn catalog_path(&self) -> PathBuf {
        self.dir.join("catalog.sqlite")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("build.lock")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for HTTP providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_timeout_secs: default_batch_timeout_secs(),
            query_timeout_ms: default_query_timeout_ms(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_timeout_secs() -> u64 {
    30
}
fn default_query_timeout_ms() -> u64 {
    250
}
fn default_max_text_chars() -> usize {
    2000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    #[serde(default = "default_tokens_per_window")]
    pub tokens_per_window: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            requests_per_window: default_requests_per_window(),
            tokens_per_window: default_tokens_per_window(),
            window_secs: default_window_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_max_concurrency() -> usize {
    4
}
fn default_requests_per_window() -> u32 {
    60
}
fn default_tokens_per_window() -> u64 {
    150_000
}
fn default_window_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LexicalConfig {
    #[serde(default = "default_language")]
    pub stemmer: String,
    #[serde(default = "default_language")]
    pub stopwords: String,
    #[serde(default = "default_k1")]
    pub k1: f32,
    #[serde(default = "default_b")]
    pub b: f32,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            stemmer: default_language(),
            stopwords: default_language(),
            k1: default_k1(),
            b: default_b(),
        }
    }
}

fn default_language() -> String {
    "english".to_string()
}
fn default_k1() -> f32 {
    1.2
}
fn default_b() -> f32 {
    0.75
}

impl LexicalConfig {
    pub fn analyzer(&self) -> Result<Analyzer> {
        let stemmer = match self.stemmer.as_str() {
            "english" => Stemmer::English,
            "none" => Stemmer::None,
            other => bail!("lexical.stemmer must be english or none, got '{}'", other),
        };
        let stopwords = match self.stopwords.as_str() {
            "english" => Stopwords::English,
            "none" => Stopwords::None,
            other => bail!("lexical.stopwords must be english or none, got '{}'", other),
        };
        Ok(Analyzer { stemmer, stopwords })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

fn default_metric() -> String {
    "cosine".to_string()
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}

impl VectorConfig {
    pub fn metric(&self) -> Result<DistanceMetric> {
        match self.metric.as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" => Ok(DistanceMetric::Dot),
            other => bail!("vector.metric must be cosine or dot, got '{}'", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompressionConfig {
    #[serde(default = "default_dict_size")]
    pub dict_size: usize,
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
    #[serde(default = "default_level")]
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            dict_size: default_dict_size(),
            sample_count: default_sample_count(),
            level: default_level(),
        }
    }
}

fn default_dict_size() -> usize {
    65_536
}
fn default_sample_count() -> usize {
    10_000
}
fn default_level() -> i32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k0")]
    pub rrf_k0: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Deepest page start a query may ask for.
    #[serde(default = "default_max_offset")]
    pub max_offset: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k0: default_rrf_k0(),
            candidate_k: default_candidate_k(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_offset: default_max_offset(),
        }
    }
}

fn default_rrf_k0() -> f64 {
    60.0
}
fn default_candidate_k() -> usize {
    80
}
fn default_limit() -> usize {
    12
}
fn default_max_limit() -> usize {
    100
}
fn default_max_offset() -> usize {
    1_000
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            k0: self.rrf_k0,
            candidate_k: self.candidate_k,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Index and compression settings for the next build.
    pub fn index_settings(&self) -> Result<IndexSettings> {
        Ok(IndexSettings {
            analyzer: self.lexical.analyzer()?,
            bm25: Bm25Params {
                k1: self.lexical.k1,
                b: self.lexical.b,
            },
            metric: self.vector.metric()?,
            hnsw: HnswParams {
                ef_construction: self.vector.ef_construction,
                ef_search: self.vector.ef_search,
            },
            compression: CompressionSettings {
                dict_size: self.compression.dict_size,
                sample_count: self.compression.sample_count,
                level: self.compression.level,
            },
        })
    }
}

/// Starter configuration written by `pkgsearch init`.
pub const DEFAULT_CONFIG: &str = r#"# pkgsearch configuration. Every key is optional.

[data]
dir = "./data"
keep_retired = 2

[embedding]
# disabled | hashed | openai | ollama
provider = "disabled"
# model = "text-embedding-3-small"
# dims = 1536
query_timeout_ms = 250

[scheduler]
batch_size = 64
max_concurrency = 4
requests_per_window = 60
tokens_per_window = 150000
window_secs = 60
max_attempts = 5

[lexical]
stemmer = "english"
stopwords = "english"

[vector]
metric = "cosine"
ef_construction = 200
ef_search = 64

[retrieval]
rrf_k0 = 60.0
candidate_k = 80
default_limit = 12

[logging]
level = "info"
"#;

/// Write [`DEFAULT_CONFIG`] to `path` unless a file is already there.
/// Returns whether a file was written.
pub fn write_default_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let scheduler = &config.scheduler;
    if scheduler.batch_size == 0 {
        bail!("scheduler.batch_size must be > 0");
    }
    if scheduler.max_concurrency == 0 {
        bail!("scheduler.max_concurrency must be > 0");
    }
    if scheduler.requests_per_window == 0 || scheduler.tokens_per_window == 0 {
        bail!("scheduler.requests_per_window and scheduler.tokens_per_window must be > 0");
    }
    if scheduler.window_secs == 0 {
        bail!("scheduler.window_secs must be > 0");
    }
    if scheduler.max_attempts == 0 {
        bail!("scheduler.max_attempts must be >= 1");
    }
    if !(0.0..=1.0).contains(&scheduler.jitter) {
        bail!("scheduler.jitter must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hashed" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashed, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.provider != "hashed" && config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.max_text_chars == 0 {
        bail!("embedding.max_text_chars must be > 0");
    }

    config.lexical.analyzer()?;
    config.vector.metric()?;
    if config.vector.ef_search == 0 || config.vector.ef_construction == 0 {
        bail!("vector.ef_search and vector.ef_construction must be >= 1");
    }
    if !(1..=22).contains(&config.compression.level) {
        bail!("compression.level must be in 1..=22");
    }
    if config.compression.dict_size == 0 {
        bail!("compression.dict_size must be > 0");
    }

    let retrieval = &config.retrieval;
    if retrieval.rrf_k0 <= 0.0 {
        bail!("retrieval.rrf_k0 must be > 0");
    }
    if retrieval.default_limit == 0 || retrieval.default_limit > retrieval.max_limit {
        bail!("retrieval.default_limit must be in 1..=retrieval.max_limit");
    }
    Ok(())
}
