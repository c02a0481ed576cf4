//! Content hashing and change detection.
//!
//! The content hash is a SHA-256 digest over exactly the fields that feed
//! [`embedding_text`]. Set-valued fields are sorted and deduplicated before
//! hashing, so the digest is independent of input order and stable across
//! processes. Everything here is pure.

use sha2::{Digest, Sha256};

use crate::models::PackageRecord;

/// Number of platforms included in the embedding text.
pub const EMBEDDING_PLATFORM_LIMIT: usize = 5;

/// Outcome of comparing a stored hash against the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Unchanged,
    Changed,
}

/// Compare two content hashes.
pub fn compare(old: &str, new: &str) -> ChangeStatus {
    if old == new {
        ChangeStatus::Unchanged
    } else {
        ChangeStatus::Changed
    }
}

/// Canonical field list in hashing order. Field separators are ASCII unit
/// (0x1f) and record (0x1e) separators, which never appear in metadata.
fn canonical_fields(record: &PackageRecord) -> Vec<(&'static str, String)> {
    let mut licenses: Vec<&str> = record.licenses.iter().map(|l| l.display_name()).collect();
    licenses.sort_unstable();
    licenses.dedup();

    let mut maintainers: Vec<&str> = record
        .maintainers
        .iter()
        .map(|m| m.display_name())
        .collect();
    maintainers.sort_unstable();
    maintainers.dedup();

    let mut platforms: Vec<&str> = record.platforms.iter().map(|p| p.name.as_str()).collect();
    platforms.sort_unstable();
    platforms.dedup();

    vec![
        ("name", record.name.clone()),
        ("version", record.version.clone()),
        ("main_program", record.main_program.clone().unwrap_or_default()),
        ("description", record.description.clone().unwrap_or_default()),
        (
            "long_description",
            record.long_description.clone().unwrap_or_default(),
        ),
        ("homepage", record.homepage.clone().unwrap_or_default()),
        ("license", licenses.join("\x1f")),
        ("maintainers", maintainers.join("\x1f")),
        ("platforms", platforms.join("\x1f")),
        ("attribute_path", record.attribute_path.clone()),
    ]
}

/// Compute the content hash of a record. The stored `content_hash` and
/// `embedding` fields do not participate.
pub fn content_hash(record: &PackageRecord) -> String {
    let mut hasher = Sha256::new();
    for (field, value) in canonical_fields(record) {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Build the text submitted to the embedding provider.
///
/// Absent parts are omitted. The result is cut to at most `max_chars`
/// characters on a char boundary.
pub fn embedding_text(record: &PackageRecord, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(format!("Package: {}.", record.name));
    if !record.version.is_empty() {
        parts.push(format!("Version: {}.", record.version));
    }
    if let Some(program) = &record.main_program {
        parts.push(format!("Main Program: {}.", program));
    }
    match (&record.description, &record.long_description) {
        (Some(desc), Some(long)) => parts.push(format!("Description: {}. {}", desc, long)),
        (Some(desc), None) => parts.push(format!("Description: {}.", desc)),
        (None, Some(long)) => parts.push(format!("Description: {}", long)),
        (None, None) => {}
    }
    if let Some(homepage) = &record.homepage {
        parts.push(format!("Homepage: {}.", homepage));
    }
    if let Some(label) = record.license_label() {
        parts.push(format!("License: {}.", label));
    }
    if !record.maintainers.is_empty() {
        let names: Vec<&str> = record.maintainers.iter().map(|m| m.display_name()).collect();
        parts.push(format!("Maintainers: {}.", names.join(", ")));
    }
    if !record.platforms.is_empty() {
        let names: Vec<&str> = record
            .platforms
            .iter()
            .take(EMBEDDING_PLATFORM_LIMIT)
            .map(|p| p.name.as_str())
            .collect();
        parts.push(format!("Platforms: {}.", names.join(", ")));
    }
    parts.push(format!("Attribute: {}", record.attribute_path));

    let text = parts.join(" ");
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}
