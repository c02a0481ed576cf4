//! Immutable snapshot bundle.
//!
//! A [`Snapshot`] holds one generation's normalized store, both indexes and
//! the compressed record store. It is assembled once, validated, and then
//! only ever read. Swapping between generations is the app crate's job.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compress::{CompressedStore, CompressionSettings};
use crate::error::{CompressionError, IndexError, SnapshotError, ValidationError};
use crate::graph::DependencyGraph;
use crate::lexical::{Analyzer, Bm25Params, LexicalDocument, LexicalIndex};
use crate::models::PackageDocument;
use crate::normalize::NormalizedStore;
use crate::store::{Candidate, Store};
use crate::vector::{DistanceMetric, HnswParams, VectorIndex};

/// Index and compression settings a snapshot is built with.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexSettings {
    pub analyzer: Analyzer,
    pub bm25: Bm25Params,
    pub metric: DistanceMetric,
    pub hnsw: HnswParams,
    pub compression: CompressionSettings,
}

/// `embedded` as a percentage of `packages`; 0 when there are no packages.
pub fn coverage_percent(embedded: u64, packages: u64) -> f64 {
    if packages == 0 {
        return 0.0;
    }
    embedded as f64 * 100.0 / packages as f64
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    /// Model that produced the vectors, if any.
    pub embedding_model: Option<String>,
    pub store: NormalizedStore,
    pub lexical: LexicalIndex,
    pub vectors: VectorIndex,
    pub records: CompressedStore,
    /// Packages whose embedding could not be refreshed in this build.
    pub deferred: BTreeSet<String>,
}

impl Snapshot {
    /// Build both indexes and the compressed store over `store`.
    pub fn assemble(
        generation: u64,
        store: NormalizedStore,
        settings: &IndexSettings,
        embedding_model: Option<String>,
        deferred: BTreeSet<String>,
    ) -> Result<Self, SnapshotError> {
        let lexical = LexicalIndex::build(
            store.packages.values().map(LexicalDocument::from),
            settings.analyzer,
            settings.bm25,
        );

        let embedded: Vec<(String, Vec<f32>)> = store
            .packages
            .values()
            .filter_map(|p| p.embedding.clone().map(|v| (p.id.clone(), v)))
            .collect();
        let vectors = VectorIndex::build(embedded, settings.metric, settings.hnsw)?;

        let documents: Vec<PackageDocument> =
            store.packages.values().map(PackageDocument::from).collect();
        let records = CompressedStore::build(&documents, &settings.compression)?;

        info!(
            generation,
            packages = store.len(),
            vectors = vectors.len(),
            "assembled snapshot"
        );

        Ok(Self {
            generation,
            created_at: Utc::now(),
            embedding_model,
            store,
            lexical,
            vectors,
            records,
            deferred,
        })
    }

    /// Integrity check run before a snapshot may be published.
    ///
    /// Junction rows and edges must resolve, every index entry must name a
    /// package with a compressed record, and every package must have one.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.store.check_integrity()?;

        for id in self.lexical.ids() {
            if !self.store.packages.contains_key(id) || !self.records.contains(id) {
                return Err(ValidationError::DanglingIndexReference {
                    index: "lexical",
                    id: id.clone(),
                });
            }
        }
        for id in self.vectors.ids() {
            if !self.store.packages.contains_key(id) || !self.records.contains(id) {
                return Err(ValidationError::DanglingIndexReference {
                    index: "vector",
                    id: id.clone(),
                });
            }
        }
        for (id, _) in self.records.blobs() {
            if !self.store.packages.contains_key(id) {
                return Err(ValidationError::DanglingIndexReference {
                    index: "record",
                    id: id.to_string(),
                });
            }
        }
        for (id, package) in &self.store.packages {
            if !self.records.contains(id) {
                return Err(ValidationError::MissingRecord(id.clone()));
            }
            if let Some(vector) = &package.embedding {
                if vector.len() != self.vectors.dims() {
                    return Err(ValidationError::DimensionMismatch {
                        id: id.clone(),
                        expected: self.vectors.dims(),
                        actual: vector.len(),
                    });
                }
            }
        }
        if self.lexical.len() != self.store.len() {
            return Err(ValidationError::ArtifactMismatch(format!(
                "lexical index has {} documents for {} packages",
                self.lexical.len(),
                self.store.len()
            )));
        }
        if self.vectors.len() != self.store.embedded_count() {
            return Err(ValidationError::ArtifactMismatch(format!(
                "vector index has {} nodes for {} embedded packages",
                self.vectors.len(),
                self.store.embedded_count()
            )));
        }
        if let Some(id) = self.deferred.iter().find(|id| !self.store.packages.contains_key(*id)) {
            return Err(ValidationError::DanglingIndexReference {
                index: "deferred",
                id: id.clone(),
            });
        }
        Ok(())
    }

    /// Percentage of packages with an embedding. An empty snapshot reports 0.
    pub fn embedding_coverage(&self) -> f64 {
        coverage_percent(self.store.embedded_count() as u64, self.store.len() as u64)
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::new(
            self.store.packages.keys().map(String::as_str),
            &self.store.dependencies,
        )
    }
}

#[async_trait]
impl Store for Snapshot {
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, IndexError> {
        Ok(self
            .lexical
            .search(query, limit)
            .into_iter()
            .map(Candidate::from)
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>, IndexError> {
        if self.vectors.is_empty() {
            return Err(IndexError::Unavailable("snapshot has no vectors".into()));
        }
        Ok(self
            .vectors
            .search(query_vec, limit)?
            .into_iter()
            .map(Candidate::from)
            .collect())
    }

    async fn get_record(&self, id: &str) -> Result<Option<PackageDocument>, CompressionError> {
        self.records.get(id)
    }
}
