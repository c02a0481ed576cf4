//! Lexical full-text index with BM25 ranking.
//!
//! Wraps the [`bm25`](https://crates.io/crates/bm25) crate. A package has
//! four searchable fields (name, attribute path, description, long
//! description); they are concatenated into one document with the name
//! repeated [`NAME_REPEAT`] times and the attribute path and description
//! [`ATTRIBUTE_REPEAT`] times, so a name hit outweighs a long-description
//! hit under BM25's term-frequency saturation.
//!
//! Tokenization (English stemming and stopword removal, each switchable)
//! comes from the crate's [`DefaultTokenizer`]. The index is built once and
//! is read-only afterwards; `search` takes `&self` and is safe for any
//! number of concurrent readers.

use std::fmt;
use std::sync::Arc;

use bm25::{DefaultTokenizer, Document, Language, SearchEngine, SearchEngineBuilder, Tokenizer};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::models::PackageRecord;

const NAME_REPEAT: usize = 3;
const ATTRIBUTE_REPEAT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stemmer {
    None,
    #[default]
    English,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stopwords {
    None,
    #[default]
    English,
}

/// Tokenizer settings shared by indexing and querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Analyzer {
    pub stemmer: Stemmer,
    pub stopwords: Stopwords,
}

impl Analyzer {
    pub fn tokenizer(&self) -> DefaultTokenizer {
        DefaultTokenizer::builder()
            .language_mode(Language::English)
            .normalization(true)
            .stemming(self.stemmer == Stemmer::English)
            .stopwords(self.stopwords == Stopwords::English)
            .build()
    }

    /// One-off tokenization. Hot paths should hold on to [`Self::tokenizer`].
    pub fn tokens(&self, text: &str) -> Vec<String> {
        self.tokenizer().tokenize(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Searchable text of one package. Kept uncompressed in the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexicalDocument {
    pub id: String,
    pub name: String,
    pub attribute_path: String,
    pub description: String,
    pub long_description: String,
}

impl LexicalDocument {
    /// The weighted single-field text handed to BM25.
    fn contents(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        parts.extend(std::iter::repeat(self.name.as_str()).take(NAME_REPEAT));
        parts.extend(std::iter::repeat(self.attribute_path.as_str()).take(ATTRIBUTE_REPEAT));
        parts.extend(std::iter::repeat(self.description.as_str()).take(ATTRIBUTE_REPEAT));
        parts.push(&self.long_description);
        parts.retain(|p| !p.is_empty());
        parts.join(" \n ")
    }
}

impl From<&PackageRecord> for LexicalDocument {
    fn from(record: &PackageRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            attribute_path: record.attribute_path.clone(),
            description: record.description.clone().unwrap_or_default(),
            long_description: record.long_description.clone().unwrap_or_default(),
        }
    }
}

/// BM25 index over package documents. Document keys are positions in
/// `ids`, which is kept in insertion order.
#[derive(Clone)]
pub struct LexicalIndex {
    analyzer: Analyzer,
    params: Bm25Params,
    ids: Arc<Vec<String>>,
    engine: Arc<SearchEngine<u32>>,
}

impl fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LexicalIndex")
            .field("analyzer", &self.analyzer)
            .field("params", &self.params)
            .field("documents", &self.ids.len())
            .finish()
    }
}

impl LexicalIndex {
    #[instrument(skip_all)]
    pub fn build(
        documents: impl IntoIterator<Item = LexicalDocument>,
        analyzer: Analyzer,
        params: Bm25Params,
    ) -> Self {
        let mut ids = Vec::new();
        let mut corpus = Vec::new();
        for doc in documents {
            corpus.push(Document {
                id: ids.len() as u32,
                contents: doc.contents(),
            });
            ids.push(doc.id);
        }

        let engine = SearchEngineBuilder::<u32>::with_tokenizer_and_documents(
            analyzer.tokenizer(),
            corpus,
        )
        .k1(params.k1)
        .b(params.b)
        .build();

        Self {
            analyzer,
            params,
            ids: Arc::new(ids),
            engine: Arc::new(engine),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn analyzer(&self) -> Analyzer {
        self.analyzer
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Top `limit` documents by BM25 score, highest first; ties broken by
    /// package id. Documents matching no query term are not returned.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        if limit == 0 || self.ids.is_empty() {
            return Vec::new();
        }
        // Every match is scored so ties at the cut-off break by id, not by
        // the engine's internal order.
        let mut ranked: Vec<(String, f64)> = self
            .engine
            .search(query, None)
            .into_iter()
            .filter(|hit| hit.score > 0.0)
            .filter_map(|hit| {
                self.ids
                    .get(hit.document.id as usize)
                    .map(|id| (id.clone(), hit.score as f64))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }
}
