//! Package lookup by id, and dependency queries.
//!
//! Used by `pkgsearch get`, `pkgsearch deps`, and `pkgsearch graph`. All
//! three read the published snapshot; nothing here touches the catalog
//! beyond loading it.

use anyhow::{bail, Result};
use serde::Serialize;

use pkgsearch_core::graph::{DependencyGraph, Direction, GraphStats, Reached};
use pkgsearch_core::models::PackageDocument;
use pkgsearch_core::snapshot::Snapshot;

use crate::config::Config;
use crate::publisher::load_published;

/// `get` response: the hydrated record plus build-side facts.
#[derive(Debug, Clone, Serialize)]
pub struct PackageDetails {
    pub generation: u64,
    #[serde(flatten)]
    pub record: PackageDocument,
    pub content_hash: String,
    pub embedded: bool,
    pub embedding_deferred: bool,
    pub dependencies: Vec<Reached>,
    pub dependents: Vec<Reached>,
}

/// Resolve `key` as a package id, falling back to an attribute path or a
/// package name. Names can be ambiguous; the smallest matching id wins.
pub fn resolve_id<'a>(snapshot: &'a Snapshot, key: &str) -> Option<&'a str> {
    if let Some((id, _)) = snapshot.store.packages.get_key_value(key) {
        return Some(id.as_str());
    }
    snapshot
        .store
        .packages
        .values()
        .find(|p| p.attribute_path == key)
        .or_else(|| snapshot.store.packages.values().find(|p| p.name == key))
        .map(|p| p.id.as_str())
}

pub fn get_package(snapshot: &Snapshot, key: &str) -> Result<PackageDetails> {
    let Some(id) = resolve_id(snapshot, key) else {
        bail!("package not found: {}", key);
    };
    let Some(record) = snapshot.records.get(id)? else {
        bail!("package {} has no stored record", id);
    };
    let Some(package) = snapshot.store.get(id) else {
        bail!("package not found: {}", key);
    };
    let graph = snapshot.dependency_graph();
    Ok(PackageDetails {
        generation: snapshot.generation,
        content_hash: package.content_hash.clone(),
        embedded: package.embedding.is_some(),
        embedding_deferred: snapshot.deferred.contains(id),
        dependencies: graph.neighbours(id, Direction::Dependencies),
        dependents: graph.neighbours(id, Direction::Dependents),
        record,
    })
}

pub async fn run_get(config: &Config, key: &str, json: bool) -> Result<()> {
    let snapshot = load_published(&config.data).await?;
    let details = get_package(&snapshot, key)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }

    let record = &details.record;
    println!("--- Package ---");
    println!("id:           {}", record.id);
    println!("name:         {}", record.name);
    println!("version:      {}", record.version);
    println!("attribute:    {}", record.attribute_path);
    println!("category:     {}", record.category);
    if let Some(license) = &record.license {
        println!("license:      {}", license);
    }
    if let Some(homepage) = &record.homepage {
        println!("homepage:     {}", homepage);
    }
    if let Some(program) = &record.main_program {
        println!("program:      {}", program);
    }
    if !record.maintainers.is_empty() {
        println!("maintainers:  {}", record.maintainers.join(", "));
    }
    if !record.platforms.is_empty() {
        println!("platforms:    {}", record.platforms.len());
    }
    let mut flags = Vec::new();
    for (set, name) in [
        (record.broken, "broken"),
        (record.unfree, "unfree"),
        (record.insecure, "insecure"),
        (record.unsupported, "unsupported"),
        (!record.available, "unavailable"),
    ] {
        if set {
            flags.push(name);
        }
    }
    if !flags.is_empty() {
        println!("flags:        {}", flags.join(", "));
    }
    println!(
        "embedding:    {}{}",
        if details.embedded { "yes" } else { "no" },
        if details.embedding_deferred { " (deferred)" } else { "" }
    );
    println!("hash:         {}", details.content_hash);
    println!("generation:   {}", details.generation);

    if let Some(description) = &record.description {
        println!();
        println!("{}", description);
    }
    if let Some(long) = &record.long_description {
        println!();
        println!("{}", long.trim());
    }
    print_reached("Dependencies", &details.dependencies);
    print_reached("Dependents", &details.dependents);
    Ok(())
}

fn print_reached(title: &str, reached: &[Reached]) {
    if reached.is_empty() {
        return;
    }
    println!();
    println!("--- {} ({}) ---", title, reached.len());
    for r in reached {
        if r.depth > 1 {
            println!("  {} ({}, depth {})", r.id, r.kind, r.depth);
        } else {
            println!("  {} ({})", r.id, r.kind);
        }
    }
}

/// Options for `pkgsearch deps`.
#[derive(Debug, Clone, Default)]
pub struct DepsOptions {
    pub reverse: bool,
    pub transitive: bool,
    pub max_depth: Option<usize>,
    pub path_to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum DepsResult {
    Neighbours {
        id: String,
        reverse: bool,
        reached: Vec<Reached>,
    },
    Path {
        from: String,
        to: String,
        path: Option<Vec<String>>,
    },
}

pub fn dependency_query(snapshot: &Snapshot, key: &str, options: &DepsOptions) -> Result<DepsResult> {
    let Some(id) = resolve_id(snapshot, key) else {
        bail!("package not found: {}", key);
    };
    let graph = snapshot.dependency_graph();

    if let Some(target) = &options.path_to {
        let Some(to) = resolve_id(snapshot, target) else {
            bail!("package not found: {}", target);
        };
        return Ok(DepsResult::Path {
            from: id.to_string(),
            to: to.to_string(),
            path: graph.shortest_path(id, to),
        });
    }

    let direction = if options.reverse {
        Direction::Dependents
    } else {
        Direction::Dependencies
    };
    let reached = if options.transitive || options.max_depth.is_some() {
        graph.transitive(id, direction, options.max_depth)
    } else {
        graph.neighbours(id, direction)
    };
    Ok(DepsResult::Neighbours {
        id: id.to_string(),
        reverse: options.reverse,
        reached,
    })
}

pub async fn run_deps(config: &Config, key: &str, options: &DepsOptions, json: bool) -> Result<()> {
    let snapshot = load_published(&config.data).await?;
    let result = dependency_query(&snapshot, key, options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    match result {
        DepsResult::Path { from, to, path } => match path {
            Some(path) => println!("{}", path.join(" -> ")),
            None => println!("No dependency path from {} to {}.", from, to),
        },
        DepsResult::Neighbours { id, reverse, reached } => {
            if reached.is_empty() {
                println!(
                    "{} has no {}.",
                    id,
                    if reverse { "dependents" } else { "dependencies" }
                );
                return Ok(());
            }
            for r in &reached {
                println!("{}{} ({})", "  ".repeat(r.depth.saturating_sub(1)), r.id, r.kind);
            }
        }
    }
    Ok(())
}

/// `graph` response: shape of the dependency graph plus its cycles.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub generation: u64,
    #[serde(flatten)]
    pub stats: GraphStats,
    pub dropped_edges: usize,
    pub cycles: Vec<Vec<String>>,
}

pub fn graph_summary(snapshot: &Snapshot) -> GraphSummary {
    let graph: DependencyGraph = snapshot.dependency_graph();
    GraphSummary {
        generation: snapshot.generation,
        stats: graph.stats(),
        dropped_edges: snapshot.store.dropped_edges.len(),
        cycles: graph.find_cycles(),
    }
}

pub async fn run_graph(config: &Config, json: bool) -> Result<()> {
    let snapshot = load_published(&config.data).await?;
    let summary = graph_summary(&snapshot);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let stats = &summary.stats;
    println!("Dependency graph (generation {})", summary.generation);
    println!("  packages:          {}", stats.nodes);
    println!("  build edges:       {}", stats.build_edges);
    println!("  propagated edges:  {}", stats.propagated_edges);
    println!("  dropped edges:     {}", summary.dropped_edges);
    println!("  leaf packages:     {}", stats.leaf_packages);
    if let Some((id, n)) = &stats.max_fan_out {
        println!("  most dependencies: {} ({})", id, n);
    }
    if let Some((id, n)) = &stats.max_fan_in {
        println!("  most dependents:   {} ({})", id, n);
    }
    println!("  cycles:            {}", summary.cycles.len());
    for cycle in summary.cycles.iter().take(10) {
        println!("    {}", cycle.join(" -> "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use pkgsearch_core::models::{DependencyEdge, DependencyKind};
    use pkgsearch_core::normalize::NormalizedStore;
    use pkgsearch_core::raw::RawPackage;
    use pkgsearch_core::snapshot::IndexSettings;

    fn snapshot() -> Snapshot {
        let records = ["python3Packages.requests", "openssl", "curl", "python3"]
            .iter()
            .enumerate()
            .map(|(i, attr)| {
                RawPackage {
                    attribute_path: Some(attr.to_string()),
                    version: Some("1".into()),
                    ..RawPackage::default()
                }
                .into_package(i)
                .unwrap()
                .record
            })
            .collect();
        let edge = |s: &str, t: &str, kind| DependencyEdge {
            source_id: s.into(),
            target_id: t.into(),
            kind,
        };
        let edges = vec![
            edge("python3Packages.requests", "python3", DependencyKind::Propagated),
            edge("curl", "openssl", DependencyKind::Build),
            edge("python3", "openssl", DependencyKind::Build),
            edge("python3", "zlib", DependencyKind::Build),
        ];
        Snapshot::assemble(
            3,
            NormalizedStore::build(records, edges),
            &IndexSettings::default(),
            None,
            BTreeSet::from(["curl".to_string()]),
        )
        .unwrap()
    }

    #[test]
    fn get_resolves_by_name_and_lists_neighbours() {
        let snap = snapshot();
        let details = get_package(&snap, "requests").unwrap();
        assert_eq!(details.record.id, "python3Packages.requests");
        assert_eq!(details.dependencies.len(), 1);
        assert_eq!(details.dependencies[0].id, "python3");
        assert!(!details.embedded);

        let openssl = get_package(&snap, "openssl").unwrap();
        let dependents: Vec<&str> = openssl.dependents.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(dependents, vec!["curl", "python3"]);
        assert!(get_package(&snap, "curl").unwrap().embedding_deferred);
        assert!(get_package(&snap, "nope").is_err());
    }

    #[test]
    fn deps_transitive_and_path() {
        let snap = snapshot();
        let options = DepsOptions {
            transitive: true,
            ..DepsOptions::default()
        };
        match dependency_query(&snap, "python3Packages.requests", &options).unwrap() {
            DepsResult::Neighbours { reached, .. } => {
                assert_eq!(reached.len(), 2);
                assert_eq!(reached[1].id, "openssl");
                assert_eq!(reached[1].depth, 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        let path = DepsOptions {
            path_to: Some("openssl".into()),
            ..DepsOptions::default()
        };
        match dependency_query(&snap, "python3Packages.requests", &path).unwrap() {
            DepsResult::Path { path, .. } => assert_eq!(
                path.unwrap(),
                vec!["python3Packages.requests", "python3", "openssl"]
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn graph_summary_counts_dropped_edges() {
        let summary = graph_summary(&snapshot());
        assert_eq!(summary.stats.nodes, 4);
        assert_eq!(summary.stats.build_edges, 2);
        assert_eq!(summary.stats.propagated_edges, 1);
        assert_eq!(summary.dropped_edges, 1);
        assert!(summary.cycles.is_empty());
    }
}
