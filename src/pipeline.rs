//! The build pipeline: input → normalized store → embeddings → indexes →
//! artifact → validation → publish.
//!
//! One build produces one generation. Errors before validation abandon the
//! generation; a validation failure marks it FAILED. In both cases the
//! previously published snapshot keeps serving.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use pkgsearch_core::embedding::EmbeddingProvider;
use pkgsearch_core::error::DependencyReferenceError;
use pkgsearch_core::models::EmbeddingRecord;
use pkgsearch_core::normalize::NormalizedStore;
use pkgsearch_core::raw::RawPackage;
use pkgsearch_core::snapshot::Snapshot;

use crate::artifact;
use crate::config::Config;
use crate::ingest::{self, IngestBatch, IngestStats};
use crate::progress::{BuildPhase, BuildProgressEvent, BuildProgressReporter};
use crate::publisher::{BuildGuard, PendingSnapshot, Publisher, SnapshotCounts};
use crate::ratelimit::RateLimiter;
use crate::scheduler::{EmbeddingReport, Scheduler, SchedulerSettings};

/// Where a build reads its packages from.
pub enum BuildInput<'a> {
    File(&'a Path),
    Raw(Vec<RawPackage>),
}

/// Summary of a published build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub generation: u64,
    pub ingest: IngestStats,
    pub embedding: EmbeddingReport,
    pub counts: SnapshotCounts,
    pub duplicate_packages: usize,
    pub dropped_edges: Vec<DependencyReferenceError>,
    pub retired: Option<u64>,
    pub removed_artifacts: usize,
    pub elapsed_ms: u128,
}

struct Written {
    ingest: IngestStats,
    embedding: EmbeddingReport,
    counts: SnapshotCounts,
    duplicate_packages: usize,
    dropped_edges: Vec<DependencyReferenceError>,
}

/// Run one build and publish its generation.
///
/// Holds the build marker for the whole run, so a concurrent build fails
/// immediately instead of racing this one.
pub async fn run_build(
    config: &Config,
    publisher: &Publisher,
    input: BuildInput<'_>,
    provider: Arc<dyn EmbeddingProvider>,
    progress: &dyn BuildProgressReporter,
) -> Result<BuildReport> {
    let started = Instant::now();
    let guard = BuildGuard::acquire(&config.data.lock_path())?;
    let pending = publisher.begin(&guard).await?;
    let generation = pending.generation;

    let written = match write_generation(config, publisher, &pending, input, provider, progress).await
    {
        Ok(written) => written,
        Err(e) => {
            if let Err(cleanup) = publisher.abandon(pending).await {
                warn!(generation, error = %cleanup, "failed to clean up abandoned build");
            }
            return Err(e);
        }
    };

    progress.report(BuildProgressEvent::Phase {
        generation,
        phase: BuildPhase::Validating,
    });
    let validated = publisher.validate(pending, written.counts).await?;

    progress.report(BuildProgressEvent::Phase {
        generation,
        phase: BuildPhase::Publishing,
    });
    let outcome = publisher.publish(validated).await?;
    drop(guard);

    let report = BuildReport {
        generation,
        ingest: written.ingest,
        embedding: written.embedding,
        counts: written.counts,
        duplicate_packages: written.duplicate_packages,
        dropped_edges: written.dropped_edges,
        retired: outcome.retired,
        removed_artifacts: outcome.removed_artifacts,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        generation,
        packages = report.counts.package_count,
        embedded = report.counts.embedded_count,
        deferred = report.counts.deferred_count,
        dropped_edges = report.counts.dropped_edge_count,
        elapsed_ms = report.elapsed_ms as u64,
        "build complete"
    );
    Ok(report)
}

/// Everything that happens while the generation is BUILDING.
async fn write_generation(
    config: &Config,
    publisher: &Publisher,
    pending: &PendingSnapshot,
    input: BuildInput<'_>,
    provider: Arc<dyn EmbeddingProvider>,
    progress: &dyn BuildProgressReporter,
) -> Result<Written> {
    let generation = pending.generation;
    progress.report(BuildProgressEvent::Phase {
        generation,
        phase: BuildPhase::Ingesting,
    });
    let batch: IngestBatch = match input {
        BuildInput::File(path) => ingest::load_input(path)?,
        BuildInput::Raw(raws) => ingest::convert(raws),
    };
    let settings = config.index_settings()?;
    let mut store = NormalizedStore::build(batch.records, batch.edges);

    let (embedding_model, embedding) = if provider.dims() == 0 {
        info!("embeddings disabled, building lexical-only snapshot");
        (None, EmbeddingReport::default())
    } else {
        let prior = prior_embeddings(publisher, provider.model_name()).await;
        progress.report(BuildProgressEvent::Phase {
            generation,
            phase: BuildPhase::Embedding,
        });
        let limiter = Arc::new(RateLimiter::new(
            config.scheduler.requests_per_window,
            config.scheduler.tokens_per_window,
            config.scheduler.window(),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&provider),
            limiter,
            SchedulerSettings::from_config(&config.scheduler, config.embedding.max_text_chars),
        );
        let report = scheduler.run(&mut store.packages, &prior, progress).await;
        (Some(provider.model_name().to_string()), report)
    };

    progress.report(BuildProgressEvent::Phase {
        generation,
        phase: BuildPhase::Indexing,
    });
    let duplicate_packages = store.duplicate_packages;
    let dropped_edges = store.dropped_edges.clone();
    let snapshot = Snapshot::assemble(
        generation,
        store,
        &settings,
        embedding_model,
        embedding.deferred.clone(),
    )?;
    artifact::write_snapshot(&pending.path, &snapshot, &embedding.stale_hashes).await?;
    debug!(
        generation,
        coverage = snapshot.embedding_coverage(),
        path = %pending.path.display(),
        "artifact written"
    );

    Ok(Written {
        ingest: batch.stats,
        counts: SnapshotCounts::of(&snapshot),
        embedding,
        duplicate_packages,
        dropped_edges,
    })
}

/// Embeddings of the published generation, when they came from `model`.
///
/// Carry-over is an optimization: an unreadable prior artifact means
/// everything is embedded again, not a failed build.
async fn prior_embeddings(publisher: &Publisher, model: &str) -> HashMap<String, EmbeddingRecord> {
    let path = match publisher.published_artifact().await {
        Ok(Some(path)) => path,
        Ok(None) => return HashMap::new(),
        Err(e) => {
            warn!(error = %e, "could not read catalog, re-embedding everything");
            return HashMap::new();
        }
    };
    match artifact::load_embedding_records(&path).await {
        Ok((Some(previous), records)) if previous == model => {
            info!(carried = records.len(), "loaded prior embeddings");
            records
        }
        Ok((previous, _)) => {
            info!(
                previous = previous.as_deref().unwrap_or("none"),
                current = model,
                "embedding model changed, re-embedding everything"
            );
            HashMap::new()
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "could not load prior embeddings");
            HashMap::new()
        }
    }
}
