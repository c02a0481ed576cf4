//! Minified record store with shared-dictionary zstd compression.
//!
//! Every [`PackageDocument`] is serialized to compact JSON and compressed
//! on its own, against one dictionary shared by the whole snapshot. Small
//! records compress poorly alone; the dictionary supplies the field names
//! and common values they all repeat.
//!
//! The dictionary is trained from an evenly spaced sample of records. When
//! the sample is too small for the trainer, the concatenated samples are
//! used directly as a raw-content dictionary, which zstd accepts as well.
//! Either way the dictionary bytes are persisted with the snapshot since
//! every later read depends on them.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CompressionError;
use crate::models::PackageDocument;

/// Sample bytes per dictionary byte below which training is skipped.
const MIN_TRAINING_RATIO: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub dict_size: usize,
    pub sample_count: usize,
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            dict_size: 65_536,
            sample_count: 10_000,
            level: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictionaryKind {
    Trained,
    RawContent,
}

impl fmt::Display for DictionaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DictionaryKind::Trained => "trained",
            DictionaryKind::RawContent => "raw_content",
        })
    }
}

impl FromStr for DictionaryKind {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trained" => Ok(DictionaryKind::Trained),
            "raw_content" => Ok(DictionaryKind::RawContent),
            other => Err(CompressionError::Decode(format!(
                "unknown dictionary kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    pub kind: DictionaryKind,
    pub bytes: Vec<u8>,
}

/// Pick up to `count` evenly spaced samples.
fn select_samples(serialized: &[Vec<u8>], count: usize) -> Vec<&[u8]> {
    if serialized.is_empty() || count == 0 {
        return Vec::new();
    }
    let take = count.min(serialized.len());
    (0..take)
        .map(|i| serialized[i * serialized.len() / take].as_slice())
        .collect()
}

/// Train the shared dictionary from serialized records.
pub fn train_dictionary(
    serialized: &[Vec<u8>],
    settings: &CompressionSettings,
) -> Result<Dictionary, CompressionError> {
    let samples = select_samples(serialized, settings.sample_count);
    let total: usize = samples.iter().map(|s| s.len()).sum();

    if total < settings.dict_size.saturating_mul(MIN_TRAINING_RATIO) {
        // Most useful content goes last in a raw dictionary.
        let mut bytes: Vec<u8> = samples.concat();
        if bytes.len() > settings.dict_size {
            bytes.drain(..bytes.len() - settings.dict_size);
        }
        debug!(
            samples = samples.len(),
            bytes = bytes.len(),
            "sample too small to train, using raw-content dictionary"
        );
        return Ok(Dictionary {
            kind: DictionaryKind::RawContent,
            bytes,
        });
    }

    let bytes = zstd::dict::from_samples(&samples, settings.dict_size)
        .map_err(|e| CompressionError::Training(e.to_string()))?;
    info!(
        samples = samples.len(),
        sample_bytes = total,
        dict_bytes = bytes.len(),
        "trained compression dictionary"
    );
    Ok(Dictionary {
        kind: DictionaryKind::Trained,
        bytes,
    })
}

/// Decompress one blob with the snapshot dictionary.
pub fn decompress(blob: &[u8], dictionary: &Dictionary) -> Result<PackageDocument, CompressionError> {
    let mut decoder = zstd::stream::read::Decoder::with_dictionary(Cursor::new(blob), &dictionary.bytes)
        .map_err(|e| CompressionError::Decode(e.to_string()))?;
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| CompressionError::Decode(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Compressed record blobs keyed by package id, plus their dictionary.
#[derive(Debug, Clone)]
pub struct CompressedStore {
    dictionary: Dictionary,
    blobs: BTreeMap<String, Vec<u8>>,
}

impl CompressedStore {
    /// Serialize, train, compress, and verify every record round-trips.
    pub fn build(
        documents: &[PackageDocument],
        settings: &CompressionSettings,
    ) -> Result<Self, CompressionError> {
        let serialized: Vec<Vec<u8>> = documents
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<_, _>>()?;
        let dictionary = train_dictionary(&serialized, settings)?;

        let mut compressor = zstd::bulk::Compressor::with_dictionary(settings.level, &dictionary.bytes)
            .map_err(|e| CompressionError::Training(e.to_string()))?;
        let mut blobs = BTreeMap::new();
        let mut raw_bytes = 0usize;
        let mut packed_bytes = 0usize;

        for (doc, json) in documents.iter().zip(&serialized) {
            let blob = compressor
                .compress(json)
                .map_err(|e| CompressionError::Encode {
                    id: doc.id.clone(),
                    message: e.to_string(),
                })?;
            if decompress(&blob, &dictionary)? != *doc {
                return Err(CompressionError::RoundTripMismatch(doc.id.clone()));
            }
            raw_bytes += json.len();
            packed_bytes += blob.len();
            blobs.insert(doc.id.clone(), blob);
        }

        info!(
            records = blobs.len(),
            raw_bytes,
            packed_bytes,
            dictionary = %dictionary.kind,
            "compressed record store"
        );
        Ok(Self { dictionary, blobs })
    }

    pub fn from_parts(dictionary: Dictionary, blobs: BTreeMap<String, Vec<u8>>) -> Self {
        Self { dictionary, blobs }
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn blobs(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.blobs.iter().map(|(id, b)| (id.as_str(), b.as_slice()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.blobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn compressed_bytes(&self) -> usize {
        self.blobs.values().map(Vec::len).sum()
    }

    /// Hydrate one record. `Ok(None)` when the id is unknown.
    pub fn get(&self, id: &str) -> Result<Option<PackageDocument>, CompressionError> {
        match self.blobs.get(id) {
            Some(blob) => decompress(blob, &self.dictionary).map(Some),
            None => Ok(None),
        }
    }
}
