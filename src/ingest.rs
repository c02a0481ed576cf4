//! Raw input loading.
//!
//! Reads the metadata dump handed over by the extraction step: either one
//! JSON array of package objects or JSON Lines. Each object is converted
//! with [`RawPackage::into_package`]; records that cannot be identified are
//! reported and skipped rather than failing the build.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use pkgsearch_core::models::{DependencyEdge, PackageRecord};
use pkgsearch_core::raw::RawPackage;

/// Packages and edges read from one input file.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub records: Vec<PackageRecord>,
    pub edges: Vec<DependencyEdge>,
    pub stats: IngestStats,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestStats {
    pub read: usize,
    pub accepted: usize,
    pub rejected: usize,
}

pub fn load_input(path: &Path) -> Result<IngestBatch> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    let raws = parse_input(&content)
        .with_context(|| format!("Failed to parse input file: {}", path.display()))?;
    Ok(convert(raws))
}

/// Parse a JSON array, or JSON Lines when the text does not start with `[`.
pub fn parse_input(content: &str) -> Result<Vec<RawPackage>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}", n + 1))
        })
        .collect()
}

pub fn convert(raws: Vec<RawPackage>) -> IngestBatch {
    let mut batch = IngestBatch::default();
    batch.stats.read = raws.len();
    for (position, raw) in raws.into_iter().enumerate() {
        match raw.into_package(position) {
            Ok(package) => {
                batch.records.push(package.record);
                batch.edges.extend(package.edges);
                batch.stats.accepted += 1;
            }
            Err(e) => {
                warn!(error = %e, "skipping input record");
                batch.stats.rejected += 1;
            }
        }
    }
    info!(
        read = batch.stats.read,
        accepted = batch.stats.accepted,
        rejected = batch.stats.rejected,
        edges = batch.edges.len(),
        "ingested input"
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_and_lines() {
        let array = r#"[{"attribute_path": "hello", "version": "2.12"}, {"name": "jq"}]"#;
        assert_eq!(parse_input(array).unwrap().len(), 2);

        let lines = "{\"attributePath\": \"hello\"}\n\n{\"pname\": \"jq\", \"version\": \"1.7\"}\n";
        let raws = parse_input(lines).unwrap();
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[1].pname.as_deref(), Some("jq"));
    }

    #[test]
    fn bad_line_names_its_number() {
        let err = parse_input("{\"name\": \"a\"}\nnot json\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn unidentifiable_records_are_rejected() {
        let raws = parse_input(r#"[{"description": "mystery"}, {"attribute_path": "curl", "build_inputs": ["openssl"]}]"#).unwrap();
        let batch = convert(raws);
        assert_eq!(batch.stats.rejected, 1);
        assert_eq!(batch.stats.accepted, 1);
        assert_eq!(batch.records[0].id, "curl");
        assert_eq!(batch.edges[0].target_id, "openssl");
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("packages.json");
        std::fs::write(&path, r#"[{"attribute_path": "ripgrep", "version": "14.1.0"}]"#).unwrap();
        let batch = load_input(&path).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(load_input(&dir.path().join("missing.json")).is_err());
    }
}
