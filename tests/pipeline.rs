//! Build pipeline behaviour against scripted embedding providers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use pkgsearch::config::Config;
use pkgsearch::embedding::HashedProvider;
use pkgsearch::pipeline::{run_build, BuildInput, BuildReport};
use pkgsearch::progress::NoProgress;
use pkgsearch::publisher::{BuildGuard, Publisher, SnapshotCell, SnapshotState};
use pkgsearch::search::{QueryEngine, SearchOptions};
use pkgsearch_core::embedding::EmbeddingProvider;
use pkgsearch_core::error::ProviderError;
use pkgsearch_core::models::DependencyKind;
use pkgsearch_core::raw::RawPackage;
use pkgsearch_core::search::Degradation;

/// Hashed embeddings with call counting and a failure switch.
struct Scripted {
    inner: HashedProvider,
    calls: AtomicUsize,
    texts: AtomicUsize,
    failing: AtomicBool,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashedProvider::new(32),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.texts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for Scripted {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dims(&self) -> usize {
        32
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Fatal("provider offline".into()));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data.dir = dir.path().join("data");
    config.data.keep_retired = 1;
    config.scheduler.batch_size = 2;
    config.scheduler.max_attempts = 2;
    config.scheduler.base_delay_ms = 1;
    config.scheduler.max_delay_ms = 2;
    config
}

fn raws(value: serde_json::Value) -> Vec<RawPackage> {
    serde_json::from_value(value).unwrap()
}

fn abc(with_c: bool) -> Vec<RawPackage> {
    let mut packages = vec![
        json!({"attribute_path": "a", "version": "1", "description": "first package", "build_inputs": ["b"]}),
        json!({"attribute_path": "b", "version": "1", "description": "second package", "build_inputs": ["c"]}),
    ];
    if with_c {
        packages.push(json!({"attribute_path": "c", "version": "1", "description": "third package"}));
    }
    raws(serde_json::Value::Array(packages))
}

fn tools(description_of_fd: &str) -> Vec<RawPackage> {
    raws(json!([
        {"attribute_path": "ripgrep", "version": "14.1.0", "description": "Line-oriented search tool that recursively searches directories for a regex pattern"},
        {"attribute_path": "fd", "version": "9.0.0", "description": description_of_fd},
        {"attribute_path": "bat", "version": "0.24.0", "description": "Cat clone with syntax highlighting and git integration"},
        {"attribute_path": "jq", "version": "1.7.1", "description": "Lightweight and flexible command-line JSON processor"},
        {"attribute_path": "fzf", "version": "0.46.0", "description": "Command-line fuzzy finder"}
    ]))
}

async fn build(
    config: &Config,
    publisher: &Publisher,
    input: Vec<RawPackage>,
    provider: &Arc<Scripted>,
) -> BuildReport {
    let provider: Arc<dyn EmbeddingProvider> = provider.clone();
    run_build(config, publisher, BuildInput::Raw(input), provider, &NoProgress)
        .await
        .unwrap()
}

async fn publisher(config: &Config) -> Publisher {
    Publisher::open(&config.data, Arc::new(SnapshotCell::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn dangling_edge_is_dropped_and_reported_once() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    let provider = Scripted::new();

    let first = build(&config, &publisher, abc(true), &provider).await;
    assert_eq!(first.counts.package_count, 3);
    assert!(first.dropped_edges.is_empty());

    let provider_dyn: Arc<dyn EmbeddingProvider> = provider.clone();
    let engine = QueryEngine::new(&config, Arc::clone(publisher.cell()), provider_dyn);
    let options = SearchOptions {
        limit: Some(5),
        ..SearchOptions::default()
    };
    let result = engine.search("second", &options).await.unwrap();
    assert_eq!(result.response.hits[0].id, "b");

    let second = build(&config, &publisher, abc(false), &provider).await;
    assert_eq!(second.generation, 2);
    assert_eq!(second.counts.dropped_edge_count, 1);
    assert_eq!(second.dropped_edges.len(), 1);
    let dropped = &second.dropped_edges[0];
    assert_eq!(dropped.source_id, "b");
    assert_eq!(dropped.target_id, "c");
    assert_eq!(dropped.kind, DependencyKind::Build);

    let live = publisher.cell().load().unwrap();
    assert_eq!(live.generation, 2);
    assert_eq!(live.store.dependencies.len(), 1);
    assert_eq!(live.store.dependencies[0].source_id, "a");
}

#[tokio::test]
async fn unchanged_rebuild_makes_no_provider_calls() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    let provider = Scripted::new();

    let first = build(&config, &publisher, tools("Simple, fast alternative to find"), &provider).await;
    assert_eq!(first.embedding.embedded, 5);
    assert_eq!(provider.texts.load(Ordering::SeqCst), 5);
    // batch_size 2 over 5 packages
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    provider.reset();
    let second = build(&config, &publisher, tools("Simple, fast alternative to find"), &provider).await;
    assert_eq!(second.embedding.reused, 5);
    assert_eq!(second.embedding.embedded, 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    let before = publisher.catalog().get(1).await.unwrap().unwrap();
    assert_eq!(before.state, SnapshotState::Retired);
}

#[tokio::test]
async fn only_changed_content_is_re_embedded() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    let provider = Scripted::new();

    build(&config, &publisher, tools("Simple, fast alternative to find"), &provider).await;
    let old = publisher.cell().load().unwrap();
    let old_fd = old.store.get("fd").unwrap().clone();

    provider.reset();
    let report = build(
        &config,
        &publisher,
        tools("Simple, fast and user-friendly alternative to find"),
        &provider,
    )
    .await;
    assert_eq!(report.embedding.embedded, 1);
    assert_eq!(report.embedding.reused, 4);
    assert_eq!(provider.texts.load(Ordering::SeqCst), 1);

    let new = publisher.cell().load().unwrap();
    let new_fd = new.store.get("fd").unwrap();
    assert_ne!(new_fd.content_hash, old_fd.content_hash);
    assert_ne!(new_fd.embedding, old_fd.embedding);
    assert_eq!(
        new.store.get("jq").unwrap().embedding,
        old.store.get("jq").unwrap().embedding
    );
}

#[tokio::test]
async fn provider_outage_defers_and_next_build_catches_up() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    let provider = Scripted::new();

    build(&config, &publisher, tools("Simple, fast alternative to find"), &provider).await;
    let old_vector = publisher.cell().load().unwrap().store.get("fd").unwrap().embedding.clone();

    provider.failing.store(true, Ordering::SeqCst);
    let changed = tools("Simple, fast and user-friendly alternative to find");
    let degraded = build(&config, &publisher, changed.clone(), &provider).await;
    assert_eq!(degraded.generation, 2);
    assert_eq!(degraded.embedding.deferred.len(), 1);
    assert!(degraded.embedding.deferred.contains("fd"));
    assert_eq!(degraded.embedding.kept_previous, 1);
    assert_eq!(degraded.counts.deferred_count, 1);
    let live = publisher.cell().load().unwrap();
    assert_eq!(live.store.get("fd").unwrap().embedding, old_vector);
    assert!(live.deferred.contains("fd"));

    provider.failing.store(false, Ordering::SeqCst);
    provider.reset();
    let recovered = build(&config, &publisher, changed, &provider).await;
    assert_eq!(recovered.embedding.embedded, 1);
    assert_eq!(recovered.embedding.reused, 4);
    assert!(recovered.embedding.deferred.is_empty());
    assert_eq!(provider.texts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_query_embedding_ranks_like_lexical() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    let provider = Scripted::new();
    build(&config, &publisher, tools("Simple, fast alternative to find"), &provider).await;

    provider.failing.store(true, Ordering::SeqCst);
    let provider_dyn: Arc<dyn EmbeddingProvider> = provider.clone();
    let engine = QueryEngine::new(&config, Arc::clone(publisher.cell()), provider_dyn);
    let options = SearchOptions {
        limit: Some(5),
        ..SearchOptions::default()
    };
    let result = engine.search("command-line finder", &options).await.unwrap();
    assert!(matches!(
        result.response.degraded,
        Some(Degradation::LexicalOnly { ref reason }) if reason.contains("provider offline")
    ));

    let snapshot = publisher.cell().load().unwrap();
    let lexical: Vec<String> = snapshot
        .lexical
        .search("command-line finder", 5)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let fused: Vec<String> = result.response.hits.iter().map(|h| h.id.clone()).collect();
    assert!(!fused.is_empty());
    assert_eq!(fused, lexical);
}

#[tokio::test]
async fn second_build_fails_fast_while_one_is_running() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    build(&config, &publisher, abc(true), &Scripted::new()).await;

    let running = BuildGuard::acquire(&config.data.lock_path()).unwrap();
    let provider: Arc<dyn EmbeddingProvider> = Scripted::new();
    let err = run_build(&config, &publisher, BuildInput::Raw(abc(false)), provider, &NoProgress)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("another build is in progress"));
    assert_eq!(publisher.catalog().list().await.unwrap().len(), 1);
    assert_eq!(publisher.cell().generation(), 1);

    drop(running);
    let report = build(&config, &publisher, abc(false), &Scripted::new()).await;
    assert_eq!(report.generation, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_whole_generations_across_cutovers() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let publisher = publisher(&config).await;
    let provider = Scripted::new();

    let versioned = |round: u64| {
        raws(json!([
            {"attribute_path": "alpha", "version": format!("{}.0", round), "description": "alpha tool"},
            {"attribute_path": "beta", "version": format!("{}.0", round), "description": "beta tool"},
            {"attribute_path": "gamma", "version": format!("{}.0", round), "description": "gamma tool"}
        ]))
    };
    build(&config, &publisher, versioned(1), &provider).await;

    let provider_dyn: Arc<dyn EmbeddingProvider> = provider.clone();
    let engine = Arc::new(QueryEngine::new(&config, Arc::clone(publisher.cell()), provider_dyn));
    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        readers.push(tokio::spawn(async move {
            let mut seen = 0usize;
            loop {
                let result = engine.search("tool", &SearchOptions::default()).await.unwrap();
                let version = format!("{}.0", result.generation);
                assert_eq!(result.response.hits.len(), 3);
                for hit in &result.response.hits {
                    assert_eq!(hit.record.version, version);
                }
                seen += 1;
                if stop.load(Ordering::SeqCst) {
                    break seen;
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for round in 2..=4 {
        let report = build(&config, &publisher, versioned(round), &provider).await;
        assert_eq!(report.generation, round);
    }
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert_eq!(publisher.cell().generation(), 4);
}
