//! Read-side storage abstraction for the hybrid query path.
//!
//! The [`Store`] trait is everything [`crate::search::search`] needs: two
//! ranked candidate lists and record hydration. A published
//! [`Snapshot`](crate::snapshot::Snapshot) implements it; tests substitute
//! stores whose retrievers fail on demand.
//!
//! Implementations must be `Send + Sync`; a single store is shared by
//! every concurrent query.

use async_trait::async_trait;

use crate::error::{CompressionError, IndexError};
use crate::models::PackageDocument;

/// A candidate returned from lexical or vector retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Package id.
    pub id: String,
    /// Native score from the retriever (BM25 or similarity).
    pub raw_score: f64,
}

impl From<(String, f64)> for Candidate {
    fn from((id, raw_score): (String, f64)) -> Self {
        Self { id, raw_score }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Lexical retrieval, best first.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, IndexError>;

    /// Vector retrieval, best first.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<Candidate>, IndexError>;

    /// Decompress one record. `Ok(None)` if the id is unknown.
    async fn get_record(&self, id: &str) -> Result<Option<PackageDocument>, CompressionError>;
}
