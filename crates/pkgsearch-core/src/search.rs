//! Hybrid search over any [`Store`].
//!
//! The algorithm has no configuration or I/O dependencies. The caller
//! embeds the query (or reports why it could not) and passes the result in
//! as a [`QueryEmbedding`].
//!
//! # Algorithm
//!
//! 1. Fetch `M = max(candidate_k, offset + k)` lexical candidates.
//! 2. Fetch `M` vector candidates, unless the query embedding failed.
//! 3. Fuse both rankings with Reciprocal Rank Fusion.
//! 4. Walk the fused list, hydrating and filtering, skipping `offset`
//!    matches and stopping after `k`.
//!
//! A failed retriever degrades the response to the other one and is
//! reported in [`SearchResponse::degraded`]. Only when both fail does the
//! query return an error.

use serde::Serialize;
use tracing::warn;

use crate::error::SearchError;
use crate::fusion::{reciprocal_rank_fusion, RRF_K0};
use crate::models::PackageDocument;
use crate::store::Store;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// RRF damping constant.
    pub k0: f64,
    /// Minimum candidates fetched from each retriever.
    pub candidate_k: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k0: RRF_K0,
            candidate_k: 80,
        }
    }
}

/// Post-hydration filters.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    /// Case-insensitive substring of the license label.
    pub license: Option<String>,
    /// Exact category, case-insensitive.
    pub category: Option<String>,
    pub include_broken: bool,
    pub include_unfree: bool,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            license: None,
            category: None,
            include_broken: false,
            include_unfree: true,
        }
    }
}

impl SearchFilters {
    pub fn accepts(&self, record: &PackageDocument) -> bool {
        if record.broken && !self.include_broken {
            return false;
        }
        if record.unfree && !self.include_unfree {
            return false;
        }
        if let Some(category) = &self.category {
            if !record.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if let Some(license) = &self.license {
            let needle = license.to_lowercase();
            match &record.license {
                Some(label) if label.to_lowercase().contains(&needle) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Outcome of embedding the query text.
#[derive(Debug, Clone)]
pub enum QueryEmbedding<'a> {
    Vector(&'a [f32]),
    /// The provider failed or timed out; the reason is reported back.
    Failed(String),
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub embedding: QueryEmbedding<'a>,
    pub k: usize,
    pub offset: usize,
    pub params: SearchParams,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub fused_score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
    pub record: PackageDocument,
}

/// Which retriever was missing from a degraded response, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Degradation {
    LexicalOnly { reason: String },
    VectorOnly { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<Degradation>,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
}

impl SearchResponse {
    fn empty() -> Self {
        Self {
            hits: Vec::new(),
            degraded: None,
            lexical_candidates: 0,
            vector_candidates: 0,
        }
    }
}

/// Run a hybrid search against a [`Store`] backend.
pub async fn search<S: Store + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<SearchResponse, SearchError> {
    if req.query.trim().is_empty() || req.k == 0 {
        return Ok(SearchResponse::empty());
    }
    let m = req.params.candidate_k.max(req.offset.saturating_add(req.k));

    let lexical = store
        .keyword_search(req.query, m)
        .await
        .map_err(|e| e.to_string());
    let vector = match &req.embedding {
        QueryEmbedding::Vector(v) => store.vector_search(v, m).await.map_err(|e| e.to_string()),
        QueryEmbedding::Failed(reason) => Err(reason.clone()),
    };

    let (lexical, vector, degraded) = match (lexical, vector) {
        (Ok(l), Ok(v)) => (l, v, None),
        (Ok(l), Err(reason)) => {
            warn!(%reason, "vector retrieval unavailable, ranking lexically");
            (l, Vec::new(), Some(Degradation::LexicalOnly { reason }))
        }
        (Err(reason), Ok(v)) => {
            warn!(%reason, "lexical retrieval unavailable, ranking by vector");
            (Vec::new(), v, Some(Degradation::VectorOnly { reason }))
        }
        (Err(lexical), Err(vector)) => return Err(SearchError::Unavailable { lexical, vector }),
    };

    let lexical_ids: Vec<String> = lexical.iter().map(|c| c.id.clone()).collect();
    let vector_ids: Vec<String> = vector.iter().map(|c| c.id.clone()).collect();
    let fused = reciprocal_rank_fusion(&lexical_ids, &vector_ids, req.params.k0);

    let mut hits = Vec::with_capacity(req.k.min(fused.len()));
    let mut skipped = 0;
    for candidate in fused {
        if hits.len() == req.k {
            break;
        }
        let record = match store.get_record(&candidate.id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(id = %candidate.id, "candidate has no record, skipping");
                continue;
            }
            Err(e) => {
                warn!(id = %candidate.id, error = %e, "failed to hydrate candidate, skipping");
                continue;
            }
        };
        if !req.filters.accepts(&record) {
            continue;
        }
        if skipped < req.offset {
            skipped += 1;
            continue;
        }
        hits.push(SearchHit {
            id: candidate.id,
            fused_score: candidate.score,
            lexical_rank: candidate.lexical_rank,
            vector_rank: candidate.vector_rank,
            record,
        });
    }

    Ok(SearchResponse {
        hits,
        degraded,
        lexical_candidates: lexical_ids.len(),
        vector_candidates: vector_ids.len(),
    })
}
