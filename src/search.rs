//! Hybrid query engine over the live snapshot.
//!
//! Each query pins the snapshot generation current at its start, embeds
//! the query text under a deadline, and hands both to
//! [`pkgsearch_core::search::search`]. A provider that errors or misses the
//! deadline degrades the query to lexical-only; it never fails it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, warn};

use pkgsearch_core::embedding::{check_response, EmbeddingProvider};
use pkgsearch_core::search::{
    self as core_search, Degradation, QueryEmbedding, SearchFilters, SearchParams,
    SearchRequest, SearchResponse,
};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::publisher::{load_published, SnapshotCell};

/// Caller-controlled knobs for one query.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub generation: u64,
    pub query: String,
    #[serde(flatten)]
    pub response: SearchResponse,
    pub elapsed_ms: u64,
}

pub struct QueryEngine {
    cell: Arc<SnapshotCell>,
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    params: SearchParams,
    default_limit: usize,
    max_limit: usize,
    max_offset: usize,
}

impl QueryEngine {
    pub fn new(config: &Config, cell: Arc<SnapshotCell>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            cell,
            provider,
            timeout: config.embedding.query_timeout(),
            params: config.retrieval.search_params(),
            default_limit: config.retrieval.default_limit,
            max_limit: config.retrieval.max_limit,
            max_offset: config.retrieval.max_offset,
        }
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<QueryResult> {
        let started = Instant::now();
        let Some(snapshot) = self.cell.load() else {
            bail!("no published snapshot; run `pkgsearch build` first");
        };

        let embedded = self.embed_query(query).await;
        let embedding = match &embedded {
            Ok(vector) => QueryEmbedding::Vector(vector),
            Err(reason) => QueryEmbedding::Failed(reason.clone()),
        };
        let request = SearchRequest {
            query,
            embedding,
            k: options.limit.unwrap_or(self.default_limit).min(self.max_limit),
            offset: options.offset.min(self.max_offset),
            params: self.params,
            filters: options.filters.clone(),
        };
        let response = core_search::search(snapshot.as_ref(), &request).await?;
        if let Some(degraded) = &response.degraded {
            debug!(?degraded, "query served by a single retriever");
        }

        Ok(QueryResult {
            generation: snapshot.generation,
            query: query.to_string(),
            response,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Embed the query text, or say why no vector is available.
    async fn embed_query(&self, query: &str) -> std::result::Result<Vec<f32>, String> {
        if self.provider.dims() == 0 {
            return Err("embeddings are disabled".to_string());
        }
        let texts = vec![query.to_string()];
        match tokio::time::timeout(self.timeout, self.provider.embed(&texts)).await {
            Ok(Ok(mut vectors)) => {
                check_response(&texts, &vectors, self.provider.dims()).map_err(|e| e.to_string())?;
                Ok(vectors.swap_remove(0))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed");
                Err(e.to_string())
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "query embedding timed out");
                Err(format!(
                    "query embedding timed out after {}ms",
                    self.timeout.as_millis()
                ))
            }
        }
    }
}

/// CLI entry point for `pkgsearch search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    options: SearchOptions,
    json: bool,
    explain: bool,
) -> Result<()> {
    let cell = Arc::new(SnapshotCell::new());
    cell.swap(load_published(&config.data).await?);

    let engine = QueryEngine::new(config, cell, create_provider(&config.embedding)?);
    let result = engine.search(query, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if let Some(degraded) = &result.response.degraded {
        match degraded {
            Degradation::LexicalOnly { reason } => {
                eprintln!("note: vector retrieval unavailable ({}); lexical results only", reason)
            }
            Degradation::VectorOnly { reason } => {
                eprintln!("note: lexical retrieval unavailable ({}); vector results only", reason)
            }
        }
    }
    if result.response.hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in result.response.hits.iter().enumerate() {
        let record = &hit.record;
        println!(
            "{}. [{:.4}] {} {}",
            options.offset.saturating_add(i + 1),
            hit.fused_score,
            record.name,
            record.version
        );
        println!("    attribute: {}", record.attribute_path);
        if let Some(description) = &record.description {
            println!("    {}", description.replace('\n', " ").trim());
        }
        println!(
            "    category: {}  license: {}",
            record.category,
            record.license.as_deref().unwrap_or("unknown")
        );
        if explain {
            println!(
                "    ranks: lexical {}  vector {}",
                rank_label(hit.lexical_rank),
                rank_label(hit.vector_rank)
            );
        }
        println!("    id: {}", hit.id);
        println!();
    }
    if explain {
        println!(
            "generation {}  candidates: {} lexical, {} vector  {}ms",
            result.generation,
            result.response.lexical_candidates,
            result.response.vector_candidates,
            result.elapsed_ms
        );
    }
    Ok(())
}

fn rank_label(rank: Option<usize>) -> String {
    rank.map_or_else(|| "-".to_string(), |r| format!("#{}", r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use pkgsearch_core::error::ProviderError;
    use pkgsearch_core::normalize::NormalizedStore;
    use pkgsearch_core::raw::RawPackage;
    use pkgsearch_core::snapshot::{IndexSettings, Snapshot};

    use crate::embedding::HashedProvider;

    struct Slow(HashedProvider);

    #[async_trait]
    impl EmbeddingProvider for Slow {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.0.embed(texts).await
        }
    }

    fn cell_with(provider: &HashedProvider) -> Arc<SnapshotCell> {
        let raws = [
            ("ripgrep", "Recursively search directories for a regex pattern"),
            ("fd", "Simple fast alternative to find"),
            ("bat", "Cat clone with syntax highlighting"),
        ];
        let records = raws
            .iter()
            .enumerate()
            .map(|(i, (name, description))| {
                let raw = RawPackage {
                    attribute_path: Some(name.to_string()),
                    version: Some("1.0".into()),
                    description: Some(description.to_string()),
                    ..RawPackage::default()
                };
                let mut record = raw.into_package(i).unwrap().record;
                record.embedding = Some(provider.embed_one(description));
                record
            })
            .collect();
        let snapshot = Snapshot::assemble(
            7,
            NormalizedStore::build(records, vec![]),
            &IndexSettings::default(),
            Some("hashed".into()),
            BTreeSet::new(),
        )
        .unwrap();
        let cell = Arc::new(SnapshotCell::new());
        cell.swap(Arc::new(snapshot));
        cell
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.embedding.query_timeout_ms = 50;
        config
    }

    #[tokio::test]
    async fn hybrid_query_uses_both_retrievers() {
        let provider = HashedProvider::new(64);
        let cell = cell_with(&provider);
        let engine = QueryEngine::new(&config(), cell, Arc::new(provider));
        let result = engine
            .search("regex search directories", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(result.generation, 7);
        assert!(result.response.degraded.is_none());
        assert_eq!(result.response.hits[0].id, "ripgrep");
        assert!(result.response.hits[0].lexical_rank.is_some());
        assert!(result.response.hits[0].vector_rank.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_degrades_to_lexical() {
        let provider = HashedProvider::new(64);
        let cell = cell_with(&provider);
        let slow = QueryEngine::new(&config(), Arc::clone(&cell), Arc::new(Slow(provider)));
        let degraded = slow
            .search("syntax highlighting", &SearchOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            degraded.response.degraded,
            Some(Degradation::LexicalOnly { ref reason }) if reason.contains("timed out")
        ));
        assert_eq!(degraded.response.hits[0].id, "bat");
        assert!(degraded.response.hits.iter().all(|h| h.vector_rank.is_none()));
    }

    #[tokio::test]
    async fn limit_and_offset_are_clamped_and_empty_cell_errors() {
        let provider = HashedProvider::new(16);
        let cell = cell_with(&provider);
        let mut config = config();
        config.retrieval.max_limit = 1;
        let engine = QueryEngine::new(&config, cell, Arc::new(provider));
        let options = SearchOptions {
            limit: Some(50),
            ..SearchOptions::default()
        };
        let result = engine.search("find", &options).await.unwrap();
        assert_eq!(result.response.hits.len(), 1);

        let deep = SearchOptions {
            limit: Some(5),
            offset: usize::MAX,
            ..SearchOptions::default()
        };
        let result = engine.search("find", &deep).await.unwrap();
        assert!(result.response.hits.is_empty());

        let empty = QueryEngine::new(
            &config,
            Arc::new(SnapshotCell::new()),
            Arc::new(HashedProvider::new(16)),
        );
        assert!(empty.search("find", &options).await.is_err());
    }
}
