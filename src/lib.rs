//! # pkgsearch
//!
//! Incremental indexing and hybrid retrieval for a package metadata corpus.
//!
//! A build reads a metadata dump, normalizes it, re-embeds only packages
//! whose content hash changed, builds a BM25 index and an HNSW vector
//! index, compresses every record against a shared zstd dictionary, and
//! writes the result as one immutable snapshot artifact. The snapshot is
//! validated before it is published; readers switch generations atomically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────┐
//! │  ingest  │──▶│ normalize  │──▶│ scheduler │──▶│   snapshot   │
//! │ JSON/L   │   │ (core)     │   │ embed+RL  │   │ BM25 / HNSW  │
//! └──────────┘   └────────────┘   └───────────┘   └──────┬───────┘
//!                                                        │ artifact
//!                                 ┌──────────────────────┤
//!                                 ▼                      ▼
//!                           ┌───────────┐          ┌───────────┐
//!                           │ publisher │─────────▶│  search   │
//!                           │ catalog   │  cutover │ RRF fuse  │
//!                           └───────────┘          └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`ingest`] | Input loading (JSON array or JSON Lines) |
//! | [`embedding`] | Embedding providers (hashed, OpenAI, Ollama) |
//! | [`ratelimit`] | Request and token budget per window |
//! | [`scheduler`] | Incremental, rate-limited embedding |
//! | [`artifact`] | Snapshot artifact persistence |
//! | [`publisher`] | Catalog state machine and atomic cutover |
//! | [`pipeline`] | One build, end to end |
//! | [`search`] | Hybrid query engine |
//! | [`get`] | Package lookup and dependency queries |
//! | [`health`] | Health report and snapshot history |
//!
//! Pure algorithms (hashing, normalization, indexes, fusion, compression)
//! live in the `pkgsearch-core` crate.

pub mod artifact;
pub mod config;
pub mod db;
pub mod embedding;
pub mod get;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod publisher;
pub mod ratelimit;
pub mod scheduler;
pub mod search;
