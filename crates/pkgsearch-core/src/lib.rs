//! # pkgsearch core
//!
//! Pure logic for the package search engine: data model, content hashing,
//! normalization, dependency graph, lexical and vector indexes, rank
//! fusion, dictionary compression, and the hybrid search algorithm.
//!
//! This crate performs no file, database, or network I/O and does not
//! depend on an async runtime. Embedding providers, persistence, the
//! scheduler, and publishing live in the `pkgsearch` app crate.

pub mod compress;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod hash;
pub mod lexical;
pub mod models;
pub mod normalize;
pub mod raw;
pub mod retry;
pub mod search;
pub mod snapshot;
pub mod store;
pub mod vector;
