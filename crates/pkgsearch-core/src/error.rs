//! Error taxonomy shared by the build pipeline and the query path.
//!
//! Each stage reports its own error type so callers can decide whether a
//! failure is isolated (a single package, a single edge), aborts one build,
//! or only degrades a query.

use thiserror::Error;

use crate::models::DependencyKind;

/// Failure reported by an embedding backend.
///
/// The scheduler retries [`ProviderError::Retryable`] under its retry
/// policy. A [`ProviderError::Fatal`] batch is split until the packages the
/// backend rejects are isolated, and those are deferred.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("retryable provider error: {0}")]
    Retryable(String),
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

/// A built snapshot failed an integrity check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{index} index references unknown package '{id}'")]
    DanglingIndexReference { index: &'static str, id: String },
    #[error("junction {table} row ({package_id}, {lookup_id}) does not resolve")]
    OrphanedJunction {
        table: &'static str,
        package_id: String,
        lookup_id: u32,
    },
    #[error("dependency edge {source_id} -> {target_id} references a missing package")]
    DanglingDependency { source_id: String, target_id: String },
    #[error("package '{0}' has no compressed record")]
    MissingRecord(String),
    #[error("embedding for '{id}' has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("snapshot artifact mismatch: {0}")]
    ArtifactMismatch(String),
}

/// Dictionary training or record encode/decode failed.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("dictionary training failed: {0}")]
    Training(String),
    #[error("compression failed for '{id}': {message}")]
    Encode { id: String, message: String },
    #[error("decompression failed: {0}")]
    Decode(String),
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("round-trip mismatch for '{0}'")]
    RoundTripMismatch(String),
}

/// An edge names a package that is not part of the build.
///
/// Logged and counted by the normalizer; never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("{kind} dependency {source_id} -> {target_id} references a missing package")]
pub struct DependencyReferenceError {
    pub source_id: String,
    pub target_id: String,
    pub kind: DependencyKind,
}

/// Lexical or vector index lookup failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("query vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index unavailable: {0}")]
    Unavailable(String),
}

/// A hybrid query could not produce any ranking.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("both retrievers unavailable (lexical: {lexical}; vector: {vector})")]
    Unavailable { lexical: String, vector: String },
}

/// Assembling a snapshot from a normalized store failed.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// A raw input record could not be turned into a package.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RawPackageError {
    #[error("record at position {0} has neither an attribute path nor a name")]
    MissingIdentity(usize),
}
