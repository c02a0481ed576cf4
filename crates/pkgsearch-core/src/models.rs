//! Package data model.
//!
//! [`PackageRecord`] and [`DependencyEdge`] are produced once per build from
//! raw input (see [`crate::raw`]) and are immutable within that build.
//! Licenses, maintainers and platforms are kept as full entities on the
//! record; the normalizer deduplicates them into lookup tables keyed by
//! [`NaturalKey`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::hash::{compare, ChangeStatus};

/// Entities that are unique by a natural key rather than by input position.
pub trait NaturalKey {
    type Key: Ord + Clone + fmt::Debug;
    fn natural_key(&self) -> Self::Key;
}

/// A field that upstream metadata supplies as nothing, one item, or a list.
///
/// Upstream shapes are normalized into this once at ingestion so the rest
/// of the pipeline never inspects dynamic JSON.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OneOrMany<T> {
    #[default]
    None,
    Single(T),
    List(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::None => Vec::new(),
            OneOrMany::Single(item) => vec![item],
            OneOrMany::List(items) => items,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> Option<U>) -> OneOrMany<U> {
        match self {
            OneOrMany::None => OneOrMany::None,
            OneOrMany::Single(item) => match f(item) {
                Some(mapped) => OneOrMany::Single(mapped),
                None => OneOrMany::None,
            },
            OneOrMany::List(items) => OneOrMany::List(items.into_iter().filter_map(f).collect()),
        }
    }
}

impl<'a> From<&'a serde_json::Value> for OneOrMany<&'a serde_json::Value> {
    fn from(value: &'a serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => OneOrMany::None,
            serde_json::Value::Array(items) => OneOrMany::List(items.iter().collect()),
            other => OneOrMany::Single(other),
        }
    }
}

/// A software license, unique by `(short_name, spdx_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct License {
    pub short_name: String,
    pub spdx_id: Option<String>,
    pub full_name: Option<String>,
    pub url: Option<String>,
    pub free: Option<bool>,
}

impl License {
    /// Preferred human-readable identifier: SPDX id, then short name.
    pub fn display_name(&self) -> &str {
        self.spdx_id.as_deref().unwrap_or(&self.short_name)
    }
}

impl NaturalKey for License {
    type Key = (String, Option<String>);
    fn natural_key(&self) -> Self::Key {
        (self.short_name.clone(), self.spdx_id.clone())
    }
}

/// A package maintainer, unique by `(name, email, github)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Maintainer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub github: Option<String>,
    pub github_id: Option<u64>,
}

impl Maintainer {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.github.as_deref())
            .or(self.email.as_deref())
            .unwrap_or("unknown")
    }
}

impl NaturalKey for Maintainer {
    type Key = (Option<String>, Option<String>, Option<String>);
    fn natural_key(&self) -> Self::Key {
        (self.name.clone(), self.email.clone(), self.github.clone())
    }
}

/// A platform a package builds for (e.g. `x86_64-linux`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Architecture {
    pub name: String,
}

impl NaturalKey for Architecture {
    type Key = String;
    fn natural_key(&self) -> Self::Key {
        self.name.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub broken: bool,
    pub unfree: bool,
    pub insecure: bool,
    pub unsupported: bool,
    pub available: bool,
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self {
            broken: false,
            unfree: false,
            insecure: false,
            unsupported: false,
            available: true,
        }
    }
}

/// One package of the corpus as seen by a single build.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub attribute_path: String,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub homepage: Option<String>,
    pub category: String,
    pub flags: StatusFlags,
    pub main_program: Option<String>,
    /// Digest of every field that feeds the embedding text.
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
    /// Sorted and deduplicated by natural key.
    pub licenses: Vec<License>,
    pub maintainers: Vec<Maintainer>,
    pub platforms: Vec<Architecture>,
}

impl PackageRecord {
    /// Licenses joined for display, `None` when the package declares none.
    pub fn license_label(&self) -> Option<String> {
        if self.licenses.is_empty() {
            return None;
        }
        Some(
            self.licenses
                .iter()
                .map(License::display_name)
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Build,
    Propagated,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Build => "build",
            DependencyKind::Propagated => "propagated",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(DependencyKind::Build),
            "propagated" => Ok(DependencyKind::Propagated),
            other => Err(format!("unknown dependency kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source_id: String,
    pub target_id: String,
    pub kind: DependencyKind,
}

/// A vector together with the content hash it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub package_id: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    /// Fresh iff it was computed from the record's current content.
    pub fn is_fresh_for(&self, record: &PackageRecord) -> bool {
        self.package_id == record.id
            && compare(&self.content_hash, &record.content_hash) == ChangeStatus::Unchanged
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_true() -> bool {
    true
}

/// The query-time view of a package, stored compressed in the serving
/// artifact. Build-only fields (hash, vector, dependency lists) are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDocument {
    pub id: String,
    pub name: String,
    pub version: String,
    pub attribute_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_program: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub broken: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unfree: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsupported: bool,
    #[serde(default = "default_true")]
    pub available: bool,
}

impl From<&PackageRecord> for PackageDocument {
    fn from(record: &PackageRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            version: record.version.clone(),
            attribute_path: record.attribute_path.clone(),
            description: record.description.clone(),
            long_description: record.long_description.clone(),
            homepage: record.homepage.clone(),
            license: record.license_label(),
            maintainers: record
                .maintainers
                .iter()
                .map(|m| m.display_name().to_string())
                .collect(),
            platforms: record.platforms.iter().map(|p| p.name.clone()).collect(),
            category: record.category.clone(),
            main_program: record.main_program.clone(),
            broken: record.flags.broken,
            unfree: record.flags.unfree,
            insecure: record.flags.insecure,
            unsupported: record.flags.unsupported,
            available: record.flags.available,
        }
    }
}
