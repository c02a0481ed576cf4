//! Health and snapshot history.
//!
//! Answers "is search serving, from which build, and how complete is it"
//! from the catalog alone: the published generation, when it was built,
//! embedding coverage, and how much the last build had to defer or drop.
//! Used by `pkgsearch health` and `pkgsearch snapshots`.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use pkgsearch_core::snapshot::coverage_percent;

use crate::config::Config;
use crate::publisher::{Publisher, SnapshotCell, SnapshotEntry, SnapshotState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// A snapshot is published and fully embedded.
    Ok,
    /// A snapshot is published but some embeddings were deferred.
    Degraded,
    /// Nothing has been published yet.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub generation: u64,
    pub at: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub generation: Option<u64>,
    /// When the published generation went live (RFC 3339).
    pub last_successful_build: Option<String>,
    pub packages: u64,
    pub embedded: u64,
    /// Percentage of packages with a vector.
    pub embedding_coverage: f64,
    pub deferred_embeddings: u64,
    pub dropped_edges: u64,
    pub artifact_bytes: Option<u64>,
    /// Most recent FAILED generation newer than the published one.
    pub last_failure: Option<FailureSummary>,
}

pub fn health_report(entries: &[SnapshotEntry], artifact_bytes: Option<u64>) -> HealthReport {
    let published = entries.iter().find(|e| e.state == SnapshotState::Published);
    let published_generation = published.map_or(0, |p| p.generation);
    let last_failure = entries
        .iter()
        .filter(|e| e.state == SnapshotState::Failed && e.generation > published_generation)
        .max_by_key(|e| e.generation)
        .map(|e| FailureSummary {
            generation: e.generation,
            at: format_ts_rfc3339(e.updated_at),
            error: e.error.clone(),
        });

    let Some(entry) = published else {
        return HealthReport {
            status: HealthStatus::Empty,
            generation: None,
            last_successful_build: None,
            packages: 0,
            embedded: 0,
            embedding_coverage: 0.0,
            deferred_embeddings: 0,
            dropped_edges: 0,
            artifact_bytes: None,
            last_failure,
        };
    };

    let coverage = coverage_percent(entry.embedded_count, entry.package_count);
    HealthReport {
        status: if entry.deferred_count > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        },
        generation: Some(entry.generation),
        last_successful_build: entry.published_at.map(format_ts_rfc3339),
        packages: entry.package_count,
        embedded: entry.embedded_count,
        embedding_coverage: coverage,
        deferred_embeddings: entry.deferred_count,
        dropped_edges: entry.dropped_edge_count,
        artifact_bytes,
        last_failure,
    }
}

async fn open(config: &Config) -> Result<Publisher> {
    Publisher::open(&config.data, Arc::new(SnapshotCell::new())).await
}

/// Catalog-only health check.
pub async fn health(config: &Config) -> Result<HealthReport> {
    let publisher = open(config).await?;
    let entries = publisher.catalog().list().await?;
    publisher.catalog().close().await;
    let artifact_bytes = entries
        .iter()
        .find(|e| e.state == SnapshotState::Published)
        .and_then(|e| std::fs::metadata(config.data.dir.join(&e.path)).ok())
        .map(|m| m.len());
    Ok(health_report(&entries, artifact_bytes))
}

pub async fn run_health(config: &Config, json: bool) -> Result<()> {
    let report = health(config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("pkgsearch health");
    println!("================");
    println!();
    let status = match report.status {
        HealthStatus::Ok => "ok",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Empty => "empty (no published snapshot)",
    };
    println!("  Status:       {}", status);
    if let Some(generation) = report.generation {
        println!("  Generation:   {}", generation);
        if let Some(at) = &report.last_successful_build {
            println!("  Published:    {}", at);
        }
        if let Some(bytes) = report.artifact_bytes {
            println!("  Artifact:     {}", format_bytes(bytes));
        }
        println!();
        println!("  Packages:     {}", report.packages);
        println!(
            "  Embedded:     {} / {} ({:.1}%)",
            report.embedded, report.packages, report.embedding_coverage
        );
        println!("  Deferred:     {}", report.deferred_embeddings);
        println!("  Dropped deps: {}", report.dropped_edges);
    }
    if let Some(failure) = &report.last_failure {
        println!();
        println!(
            "  Last failure: generation {} at {}",
            failure.generation, failure.at
        );
        if let Some(error) = &failure.error {
            println!("                {}", error);
        }
    }
    println!();
    Ok(())
}

pub async fn run_snapshots(config: &Config, json: bool) -> Result<()> {
    let publisher = open(config).await?;
    let entries = publisher.catalog().list().await?;
    publisher.catalog().close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No snapshots.");
        return Ok(());
    }

    println!(
        "  {:>5}  {:<10} {:>9} {:>9} {:>8}   {}",
        "GEN", "STATE", "PACKAGES", "EMBEDDED", "DEFERRED", "UPDATED"
    );
    println!("  {}", "-".repeat(66));
    for e in &entries {
        println!(
            "  {:>5}  {:<10} {:>9} {:>9} {:>8}   {}",
            e.generation,
            e.state.as_str(),
            e.package_count,
            e.embedded_count,
            e.deferred_count,
            format_ts_relative(e.updated_at)
        );
        if let Some(error) = &e.error {
            println!("         {}", error);
        }
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_rfc3339(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_rfc3339(ts)
    }
}

fn format_ts_rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(generation: u64, state: SnapshotState) -> SnapshotEntry {
        SnapshotEntry {
            generation,
            state,
            path: format!("snapshots/gen-{:06}.sqlite", generation),
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000 + generation as i64,
            published_at: (state != SnapshotState::Failed).then_some(1_700_000_100),
            error: (state == SnapshotState::Failed).then(|| "lexical index references unknown package 'x'".into()),
            package_count: 200,
            embedded_count: 150,
            deferred_count: 50,
            dropped_edge_count: 3,
        }
    }

    #[test]
    fn empty_catalog_reports_empty() {
        let report = health_report(&[], None);
        assert_eq!(report.status, HealthStatus::Empty);
        assert!(report.generation.is_none());
        assert!(report.last_failure.is_none());
    }

    #[test]
    fn reports_published_generation_and_newer_failure() {
        let entries = vec![
            entry(4, SnapshotState::Failed),
            entry(3, SnapshotState::Published),
            entry(2, SnapshotState::Failed),
            entry(1, SnapshotState::Retired),
        ];
        let report = health_report(&entries, Some(4096));
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.generation, Some(3));
        assert_eq!(report.embedding_coverage, 75.0);
        assert_eq!(report.deferred_embeddings, 50);
        assert_eq!(report.dropped_edges, 3);
        assert_eq!(report.last_failure.unwrap().generation, 4);
        assert!(report.last_successful_build.unwrap().starts_with("2023-11-14T22:"));
    }

    #[test]
    fn empty_published_snapshot_has_zero_coverage() {
        let mut published = entry(1, SnapshotState::Published);
        published.package_count = 0;
        published.embedded_count = 0;
        published.deferred_count = 0;
        let report = health_report(&[published], None);
        assert_eq!(report.status, HealthStatus::Ok);
        assert_eq!(report.embedding_coverage, 0.0);
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
