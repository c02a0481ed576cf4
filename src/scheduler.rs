//! Incremental embedding scheduler.
//!
//! Packages whose carried-over embedding was computed from their current
//! content hash reuse it. Everything else is batched, submitted to the
//! provider under the rate budget with bounded parallelism, and retried
//! per the [`RetryPolicy`]. A batch the provider rejects outright is split
//! until the offending packages are isolated. Packages still unembedded
//! after that are deferred: they keep their previous vector when one exists.
//!
//! A failed batch never aborts the others or the build.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pkgsearch_core::embedding::{check_response, EmbeddingProvider};
use pkgsearch_core::error::ProviderError;
use pkgsearch_core::hash::embedding_text;
use pkgsearch_core::models::{EmbeddingRecord, PackageRecord};
use pkgsearch_core::retry::RetryPolicy;

use crate::config::SchedulerConfig;
use crate::embedding::estimate_tokens;
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_text_chars: usize,
    pub retry: RetryPolicy,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig, max_text_chars: usize) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency,
            max_text_chars,
            retry: config.retry_policy(),
        }
    }
}

/// One package that needs a new vector.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub package_id: String,
    pub content_hash: String,
    pub text: String,
}

/// Packages split into reuse and needs-embedding.
#[derive(Debug, Default)]
pub struct EmbeddingPlan {
    pub reuse: Vec<EmbeddingRecord>,
    pub pending: Vec<PendingEmbedding>,
}

/// Classify every package against the carried-over embeddings.
///
/// A carried-over vector is reused iff its content hash matches and its
/// length matches the provider's dimensionality.
pub fn plan(
    packages: &BTreeMap<String, PackageRecord>,
    prior: &HashMap<String, EmbeddingRecord>,
    dims: usize,
    max_text_chars: usize,
) -> EmbeddingPlan {
    let mut plan = EmbeddingPlan::default();
    for record in packages.values() {
        match prior.get(&record.id) {
            Some(existing) if existing.is_fresh_for(record) && existing.vector.len() == dims => {
                plan.reuse.push(existing.clone());
            }
            _ => plan.pending.push(PendingEmbedding {
                package_id: record.id.clone(),
                content_hash: record.content_hash.clone(),
                text: embedding_text(record, max_text_chars),
            }),
        }
    }
    plan
}

/// Counters for one scheduling run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EmbeddingReport {
    pub reused: usize,
    pub embedded: usize,
    /// Deferred packages that kept a stale vector from the prior snapshot.
    pub kept_previous: usize,
    pub provider_calls: usize,
    pub retries: usize,
    pub failed_batches: usize,
    pub deferred: BTreeSet<String>,
    /// Content hash each kept-previous vector was computed from.
    #[serde(skip)]
    pub stale_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    calls: usize,
    retries: usize,
    failed: bool,
}

pub struct Scheduler {
    provider: Arc<dyn EmbeddingProvider>,
    limiter: Arc<RateLimiter>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        limiter: Arc<RateLimiter>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            provider,
            limiter,
            settings,
        }
    }

    /// Fill in `embedding` on every package and report what happened.
    pub async fn run(
        &self,
        packages: &mut BTreeMap<String, PackageRecord>,
        prior: &HashMap<String, EmbeddingRecord>,
        progress: &dyn BuildProgressReporter,
    ) -> EmbeddingReport {
        let dims = self.provider.dims();
        let plan = plan(packages, prior, dims, self.settings.max_text_chars);
        let mut report = EmbeddingReport {
            reused: plan.reuse.len(),
            ..EmbeddingReport::default()
        };
        for record in plan.reuse {
            if let Some(package) = packages.get_mut(&record.package_id) {
                package.embedding = Some(record.vector);
            }
        }

        let total = plan.pending.len();
        let pending_ids: Vec<String> = plan.pending.iter().map(|p| p.package_id.clone()).collect();
        let done: Arc<Mutex<HashMap<String, EmbeddingRecord>>> = Arc::new(Mutex::new(HashMap::new()));

        if total > 0 {
            info!(
                reuse = report.reused,
                pending = total,
                batch_size = self.settings.batch_size,
                "embedding packages"
            );
            progress.report(BuildProgressEvent::Embedded { n: 0, total: total as u64 });
            self.submit_all(plan.pending, &done, &mut report, progress, total)
                .await;
        }

        let mut done = done.lock().await;
        for id in pending_ids {
            let package = match packages.get_mut(&id) {
                Some(package) => package,
                None => continue,
            };
            match done.remove(&id) {
                Some(record) if record.is_fresh_for(package) => {
                    package.embedding = Some(record.vector);
                    report.embedded += 1;
                }
                _ => {
                    let previous = prior.get(&id).filter(|old| old.vector.len() == dims);
                    package.embedding = previous.map(|old| old.vector.clone());
                    if let Some(old) = previous {
                        report.kept_previous += 1;
                        report
                            .stale_hashes
                            .insert(id.clone(), old.content_hash.clone());
                    }
                    report.deferred.insert(id);
                }
            }
        }

        if !report.deferred.is_empty() {
            warn!(
                deferred = report.deferred.len(),
                kept_previous = report.kept_previous,
                "some embeddings were deferred"
            );
        }
        info!(
            reused = report.reused,
            embedded = report.embedded,
            deferred = report.deferred.len(),
            calls = report.provider_calls,
            "embedding complete"
        );
        report
    }

    async fn submit_all(
        &self,
        pending: Vec<PendingEmbedding>,
        done: &Arc<Mutex<HashMap<String, EmbeddingRecord>>>,
        report: &mut EmbeddingReport,
        progress: &dyn BuildProgressReporter,
        total: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for batch in pending.chunks(self.settings.batch_size.max(1)) {
            let batch = batch.to_vec();
            let provider = Arc::clone(&self.provider);
            let limiter = Arc::clone(&self.limiter);
            let semaphore = Arc::clone(&semaphore);
            let done = Arc::clone(done);
            let policy = self.settings.retry;
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            batch.len(),
                            BatchOutcome {
                                failed: true,
                                ..BatchOutcome::default()
                            },
                        )
                    }
                };
                let size = batch.len();
                (size, embed_batch(provider, limiter, policy, batch, done).await)
            });
        }

        let mut settled = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((size, outcome)) => {
                    report.provider_calls += outcome.calls;
                    report.retries += outcome.retries;
                    if outcome.failed {
                        report.failed_batches += 1;
                    }
                    settled += size;
                }
                Err(e) => {
                    warn!(error = %e, "embedding task aborted");
                    report.failed_batches += 1;
                }
            }
            progress.report(BuildProgressEvent::Embedded {
                n: settled.min(total) as u64,
                total: total as u64,
            });
        }
    }
}

/// Embed one batch, isolating the packages the provider rejects.
///
/// A batch that fails with a non-retryable error is split in half and each
/// half is submitted on its own, down to single packages, so one bad input
/// only defers itself. Transient failures that outlast the retry policy are
/// not split: they say nothing about any one package.
async fn embed_batch(
    provider: Arc<dyn EmbeddingProvider>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    batch: Vec<PendingEmbedding>,
    done: Arc<Mutex<HashMap<String, EmbeddingRecord>>>,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let mut rng = StdRng::from_entropy();
    let mut queue = vec![batch];

    while let Some(mut part) = queue.pop() {
        let submitted = submit(
            &provider,
            &limiter,
            policy,
            &mut part,
            &done,
            &mut rng,
            &mut outcome,
        )
        .await;
        let err = match submitted {
            Ok(()) => continue,
            Err(err) => err,
        };
        if part.len() > 1 && !err.is_retryable() {
            debug!(error = %err, packages = part.len(), "splitting rejected embedding batch");
            let tail = part.split_off(part.len() / 2);
            queue.push(tail);
            queue.push(part);
        } else {
            log_failure(&err, &part);
            outcome.failed = true;
        }
    }
    outcome
}

/// Submit `batch` until it succeeds, fails fatally, or runs out of attempts.
///
/// Before every attempt, items whose current hash was already settled are
/// dropped, so a resubmitted batch never embeds the same content twice.
async fn submit(
    provider: &Arc<dyn EmbeddingProvider>,
    limiter: &RateLimiter,
    policy: RetryPolicy,
    batch: &mut Vec<PendingEmbedding>,
    done: &Mutex<HashMap<String, EmbeddingRecord>>,
    rng: &mut StdRng,
    outcome: &mut BatchOutcome,
) -> Result<(), ProviderError> {
    let mut attempt = 0u32;
    loop {
        {
            let settled = done.lock().await;
            batch.retain(|item| {
                settled
                    .get(&item.package_id)
                    .map_or(true, |r| r.content_hash != item.content_hash)
            });
        }
        if batch.is_empty() {
            return Ok(());
        }

        attempt += 1;
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let tokens: u64 = texts.iter().map(|t| estimate_tokens(t)).sum();
        limiter.acquire(tokens).await;
        outcome.calls += 1;

        let result = provider
            .embed(&texts)
            .await
            .and_then(|vectors| check_response(&texts, &vectors, provider.dims()).map(|_| vectors));

        match result {
            Ok(vectors) => {
                let mut settled = done.lock().await;
                for (item, vector) in batch.drain(..).zip(vectors) {
                    settled.insert(
                        item.package_id.clone(),
                        EmbeddingRecord {
                            package_id: item.package_id,
                            content_hash: item.content_hash,
                            vector,
                        },
                    );
                }
                return Ok(());
            }
            Err(err) if err.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.backoff(attempt, rng);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying embedding batch"
                );
                outcome.retries += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                debug!(attempts = attempt, error = %err, "embedding batch gave up");
                return Err(err);
            }
        }
    }
}

fn log_failure(err: &ProviderError, batch: &[PendingEmbedding]) {
    match batch {
        [single] => warn!(error = %err, package = %single.package_id, "embedding deferred"),
        _ => warn!(error = %err, packages = batch.len(), "embedding batch deferred"),
    }
}
