//! Snapshot artifact files.
//!
//! One SQLite file per generation holds everything a [`Snapshot`] needs:
//! the normalized tables, embeddings with the hash they were computed
//! from, the compressed record blobs and their dictionary, and the lexical
//! text. [`load_snapshot`] reassembles an equivalent in-memory snapshot,
//! rebuilding both indexes, and cross-checks the lookup ids.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use pkgsearch_core::compress::{CompressedStore, Dictionary};
use pkgsearch_core::embedding::{blob_to_vec, vec_to_blob};
use pkgsearch_core::error::DependencyReferenceError;
use pkgsearch_core::lexical::{LexicalDocument, LexicalIndex};
use pkgsearch_core::models::{
    Architecture, DependencyEdge, EmbeddingRecord, License, Maintainer, NaturalKey,
    PackageRecord, StatusFlags,
};
use pkgsearch_core::normalize::{LookupTable, NormalizedStore};
use pkgsearch_core::snapshot::{IndexSettings, Snapshot};
use pkgsearch_core::vector::VectorIndex;

use crate::db;
use crate::migrate;

const FORMAT_VERSION: &str = "1";

/// Write `snapshot` to a new artifact file at `path`.
///
/// `embedding_hashes` overrides the hash recorded for packages whose
/// vector was carried over without being recomputed.
pub async fn write_snapshot(
    path: &Path,
    snapshot: &Snapshot,
    embedding_hashes: &BTreeMap<String, String>,
) -> Result<()> {
    if path.exists() {
        bail!("artifact already exists: {}", path.display());
    }
    let pool = db::connect(path).await?;
    migrate::create_artifact_schema(&pool).await?;

    let mut tx = pool.begin().await?;
    let store = &snapshot.store;

    let mut meta: Vec<(&str, String)> = vec![
        ("format_version", FORMAT_VERSION.to_string()),
        ("generation", snapshot.generation.to_string()),
        ("created_at", snapshot.created_at.to_rfc3339()),
        ("index_settings", serde_json::to_string(&settings_of(snapshot))?),
        ("vector_dims", snapshot.vectors.dims().to_string()),
        ("duplicate_packages", store.duplicate_packages.to_string()),
    ];
    if let Some(model) = &snapshot.embedding_model {
        meta.push(("embedding_model", model.clone()));
    }
    for (key, value) in meta {
        sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    for (id, license) in store.licenses.rows() {
        sqlx::query(
            "INSERT INTO licenses (id, short_name, spdx_id, full_name, url, free) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id as i64)
        .bind(&license.short_name)
        .bind(&license.spdx_id)
        .bind(&license.full_name)
        .bind(&license.url)
        .bind(license.free)
        .execute(&mut *tx)
        .await?;
    }
    for (id, maintainer) in store.maintainers.rows() {
        sqlx::query(
            "INSERT INTO maintainers (id, name, email, github, github_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id as i64)
        .bind(&maintainer.name)
        .bind(&maintainer.email)
        .bind(&maintainer.github)
        .bind(maintainer.github_id.map(|g| g as i64))
        .execute(&mut *tx)
        .await?;
    }
    for (id, arch) in store.architectures.rows() {
        sqlx::query("INSERT INTO architectures (id, name) VALUES (?, ?)")
            .bind(id as i64)
            .bind(&arch.name)
            .execute(&mut *tx)
            .await?;
    }

    for package in store.packages.values() {
        sqlx::query(
            r#"
            INSERT INTO packages (id, name, version, attribute_path, description, long_description,
                                  homepage, category, broken, unfree, insecure, unsupported,
                                  available, main_program, content_hash, embedding_deferred)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&package.id)
        .bind(&package.name)
        .bind(&package.version)
        .bind(&package.attribute_path)
        .bind(&package.description)
        .bind(&package.long_description)
        .bind(&package.homepage)
        .bind(&package.category)
        .bind(package.flags.broken)
        .bind(package.flags.unfree)
        .bind(package.flags.insecure)
        .bind(package.flags.unsupported)
        .bind(package.flags.available)
        .bind(&package.main_program)
        .bind(&package.content_hash)
        .bind(snapshot.deferred.contains(&package.id))
        .execute(&mut *tx)
        .await?;

        if let Some(vector) = &package.embedding {
            let hash = embedding_hashes
                .get(&package.id)
                .unwrap_or(&package.content_hash);
            sqlx::query(
                "INSERT INTO embeddings (package_id, content_hash, dims, vector) VALUES (?, ?, ?, ?)",
            )
            .bind(&package.id)
            .bind(hash)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        let doc = LexicalDocument::from(package);
        sqlx::query(
            "INSERT INTO lexical_text (id, name, attribute_path, description, long_description) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.name)
        .bind(&doc.attribute_path)
        .bind(&doc.description)
        .bind(&doc.long_description)
        .execute(&mut *tx)
        .await?;
    }

    for (table, column, rows) in [
        ("package_licenses", "license_id", &store.package_licenses),
        ("package_maintainers", "maintainer_id", &store.package_maintainers),
        ("package_architectures", "architecture_id", &store.package_architectures),
    ] {
        let sql = format!(
            "INSERT INTO {} (package_id, {}) VALUES (?, ?)",
            table, column
        );
        for row in rows {
            sqlx::query(&sql)
                .bind(&row.package_id)
                .bind(row.lookup_id as i64)
                .execute(&mut *tx)
                .await?;
        }
    }

    for edge in &store.dependencies {
        sqlx::query("INSERT INTO dependency_edges (source_id, target_id, kind) VALUES (?, ?, ?)")
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(edge.kind.as_str())
            .execute(&mut *tx)
            .await?;
    }
    for dropped in &store.dropped_edges {
        sqlx::query("INSERT INTO dropped_edges (source_id, target_id, kind) VALUES (?, ?, ?)")
            .bind(&dropped.source_id)
            .bind(&dropped.target_id)
            .bind(dropped.kind.as_str())
            .execute(&mut *tx)
            .await?;
    }

    for (id, blob) in snapshot.records.blobs() {
        sqlx::query("INSERT INTO packages_kv (id, blob) VALUES (?, ?)")
            .bind(id)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
    }
    let dictionary = snapshot.records.dictionary();
    sqlx::query("INSERT INTO dictionary (id, kind, bytes) VALUES (1, ?, ?)")
        .bind(dictionary.kind.to_string())
        .bind(&dictionary.bytes)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    pool.close().await;

    info!(
        generation = snapshot.generation,
        path = %path.display(),
        packages = store.len(),
        "wrote snapshot artifact"
    );
    Ok(())
}

fn settings_of(snapshot: &Snapshot) -> IndexSettings {
    IndexSettings {
        analyzer: snapshot.lexical.analyzer(),
        bm25: snapshot.lexical.params(),
        metric: snapshot.vectors.metric(),
        hnsw: snapshot.vectors.params(),
        compression: Default::default(),
    }
}

async fn open_existing(path: &Path) -> Result<SqlitePool> {
    if !path.exists() {
        bail!("artifact not found: {}", path.display());
    }
    db::connect(path).await
}

async fn read_meta(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM meta")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("key"), row.get("value")))
        .collect())
}

fn meta_value<'a>(meta: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    meta.get(key)
        .map(String::as_str)
        .with_context(|| format!("artifact meta is missing '{}'", key))
}

/// Embeddings carried over from an artifact, with the model that made them.
pub async fn load_embedding_records(
    path: &Path,
) -> Result<(Option<String>, HashMap<String, EmbeddingRecord>)> {
    let pool = open_existing(path).await?;
    let meta = read_meta(&pool).await?;
    let rows = sqlx::query("SELECT package_id, content_hash, vector FROM embeddings")
        .fetch_all(&pool)
        .await?;
    let records = rows
        .iter()
        .map(|row| {
            let package_id: String = row.get("package_id");
            let blob: Vec<u8> = row.get("vector");
            (
                package_id.clone(),
                EmbeddingRecord {
                    package_id,
                    content_hash: row.get("content_hash"),
                    vector: blob_to_vec(&blob),
                },
            )
        })
        .collect();
    pool.close().await;
    Ok((meta.get("embedding_model").cloned(), records))
}

/// Persisted lookup ids must equal the ids the store assigns on rebuild.
fn check_lookup<T: NaturalKey + Clone>(
    table: &str,
    rebuilt: &LookupTable<T>,
    persisted: &HashMap<u32, T>,
) -> Result<()> {
    if rebuilt.len() != persisted.len() {
        bail!(
            "{} table has {} rows, rebuild produced {}",
            table,
            persisted.len(),
            rebuilt.len()
        );
    }
    for (id, value) in persisted {
        if rebuilt.id_of(value) != Some(*id) {
            bail!("{} row {} does not match its rebuilt id", table, id);
        }
    }
    Ok(())
}

async fn junction_map(
    pool: &SqlitePool,
    table: &str,
    column: &str,
) -> Result<HashMap<String, Vec<u32>>> {
    let sql = format!("SELECT package_id, {} AS lookup_id FROM {}", column, table);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut map: HashMap<String, Vec<u32>> = HashMap::new();
    for row in rows {
        let lookup: i64 = row.get("lookup_id");
        map.entry(row.get("package_id"))
            .or_default()
            .push(lookup as u32);
    }
    Ok(map)
}

fn resolve<T: Clone + Ord>(
    ids: Option<&Vec<u32>>,
    table: &HashMap<u32, T>,
    name: &str,
    package: &str,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for id in ids.into_iter().flatten() {
        let value = table
            .get(id)
            .with_context(|| format!("{} row {} referenced by '{}' is missing", name, id, package))?;
        values.push(value.clone());
    }
    values.sort();
    Ok(values)
}

/// Reassemble the snapshot stored at `path`.
pub async fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let pool = open_existing(path).await?;
    let snapshot = read_snapshot(&pool)
        .await
        .with_context(|| format!("Failed to load artifact {}", path.display()));
    pool.close().await;
    snapshot
}

async fn read_snapshot(pool: &SqlitePool) -> Result<Snapshot> {
    let meta = read_meta(pool).await?;
    if meta_value(&meta, "format_version")? != FORMAT_VERSION {
        bail!("unsupported artifact format {}", meta_value(&meta, "format_version")?);
    }
    let generation: u64 = meta_value(&meta, "generation")?.parse()?;
    let created_at: DateTime<Utc> =
        DateTime::parse_from_rfc3339(meta_value(&meta, "created_at")?)?.with_timezone(&Utc);
    let settings: IndexSettings = serde_json::from_str(meta_value(&meta, "index_settings")?)?;
    let dims: usize = meta_value(&meta, "vector_dims")?.parse()?;
    let duplicate_packages: usize = meta_value(&meta, "duplicate_packages")?.parse()?;

    let licenses: HashMap<u32, License> = sqlx::query("SELECT * FROM licenses")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            let id: i64 = row.get("id");
            (
                id as u32,
                License {
                    short_name: row.get("short_name"),
                    spdx_id: row.get("spdx_id"),
                    full_name: row.get("full_name"),
                    url: row.get("url"),
                    free: row.get("free"),
                },
            )
        })
        .collect();
    let maintainers: HashMap<u32, Maintainer> = sqlx::query("SELECT * FROM maintainers")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let github_id: Option<i64> = row.get("github_id");
            (
                id as u32,
                Maintainer {
                    name: row.get("name"),
                    email: row.get("email"),
                    github: row.get("github"),
                    github_id: github_id.map(|g| g as u64),
                },
            )
        })
        .collect();
    let architectures: HashMap<u32, Architecture> = sqlx::query("SELECT * FROM architectures")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            let id: i64 = row.get("id");
            (id as u32, Architecture { name: row.get("name") })
        })
        .collect();

    let package_licenses = junction_map(pool, "package_licenses", "license_id").await?;
    let package_maintainers = junction_map(pool, "package_maintainers", "maintainer_id").await?;
    let package_architectures =
        junction_map(pool, "package_architectures", "architecture_id").await?;

    let mut vectors: HashMap<String, Vec<f32>> = sqlx::query("SELECT package_id, vector FROM embeddings")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("vector");
            (row.get("package_id"), blob_to_vec(&blob))
        })
        .collect();

    let mut records = Vec::new();
    let mut deferred = BTreeSet::new();
    for row in sqlx::query("SELECT * FROM packages ORDER BY id")
        .fetch_all(pool)
        .await?
    {
        let id: String = row.get("id");
        if row.get::<bool, _>("embedding_deferred") {
            deferred.insert(id.clone());
        }
        records.push(PackageRecord {
            name: row.get("name"),
            version: row.get("version"),
            attribute_path: row.get("attribute_path"),
            description: row.get("description"),
            long_description: row.get("long_description"),
            homepage: row.get("homepage"),
            category: row.get("category"),
            flags: StatusFlags {
                broken: row.get("broken"),
                unfree: row.get("unfree"),
                insecure: row.get("insecure"),
                unsupported: row.get("unsupported"),
                available: row.get("available"),
            },
            main_program: row.get("main_program"),
            content_hash: row.get("content_hash"),
            embedding: vectors.remove(&id),
            licenses: resolve(package_licenses.get(&id), &licenses, "license", &id)?,
            maintainers: resolve(package_maintainers.get(&id), &maintainers, "maintainer", &id)?,
            platforms: resolve(package_architectures.get(&id), &architectures, "architecture", &id)?,
            id,
        });
    }
    if let Some(orphan) = vectors.keys().next() {
        bail!("embedding for unknown package '{}'", orphan);
    }

    let edges = sqlx::query("SELECT source_id, target_id, kind FROM dependency_edges")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            let kind: String = row.get("kind");
            Ok(DependencyEdge {
                source_id: row.get("source_id"),
                target_id: row.get("target_id"),
                kind: kind.parse().map_err(anyhow::Error::msg)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let dropped_edges = sqlx::query("SELECT source_id, target_id, kind FROM dropped_edges")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            let kind: String = row.get("kind");
            Ok(DependencyReferenceError {
                source_id: row.get("source_id"),
                target_id: row.get("target_id"),
                kind: kind.parse().map_err(anyhow::Error::msg)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut store = NormalizedStore::build(records, edges);
    if !store.dropped_edges.is_empty() {
        bail!("artifact contains dependency edges to missing packages");
    }
    check_lookup("licenses", &store.licenses, &licenses)?;
    check_lookup("maintainers", &store.maintainers, &maintainers)?;
    check_lookup("architectures", &store.architectures, &architectures)?;
    store.dropped_edges = dropped_edges;
    store.duplicate_packages = duplicate_packages;

    let lexical_docs: Vec<LexicalDocument> = sqlx::query("SELECT * FROM lexical_text ORDER BY id")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| LexicalDocument {
            id: row.get("id"),
            name: row.get("name"),
            attribute_path: row.get("attribute_path"),
            description: row.get("description"),
            long_description: row.get("long_description"),
        })
        .collect();
    let lexical = LexicalIndex::build(lexical_docs, settings.analyzer, settings.bm25);

    let embedded: Vec<(String, Vec<f32>)> = store
        .packages
        .values()
        .filter_map(|p| p.embedding.clone().map(|v| (p.id.clone(), v)))
        .collect();
    let vectors = VectorIndex::build(embedded, settings.metric, settings.hnsw)?;
    if !vectors.is_empty() && vectors.dims() != dims {
        bail!(
            "artifact records {}-dimensional vectors but stores {}",
            dims,
            vectors.dims()
        );
    }

    let dict_row = sqlx::query("SELECT kind, bytes FROM dictionary WHERE id = 1")
        .fetch_one(pool)
        .await?;
    let dictionary = Dictionary {
        kind: dict_row.get::<String, _>("kind").parse()?,
        bytes: dict_row.get("bytes"),
    };
    let blobs: BTreeMap<String, Vec<u8>> = sqlx::query("SELECT id, blob FROM packages_kv")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| (row.get("id"), row.get("blob")))
        .collect();
    let records = CompressedStore::from_parts(dictionary, blobs);

    debug!(generation, packages = store.len(), "loaded snapshot artifact");
    Ok(Snapshot {
        generation,
        created_at,
        embedding_model: meta.get("embedding_model").cloned(),
        store,
        lexical,
        vectors,
        records,
        deferred,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkgsearch_core::models::DependencyKind;
    use pkgsearch_core::raw::RawPackage;

    fn sample_snapshot(generation: u64) -> Snapshot {
        let raws: Vec<RawPackage> = serde_json::from_value(serde_json::json!([
            {"attribute_path": "curl", "version": "8.5.0", "description": "Command line tool for transferring data",
             "license": {"shortName": "curl", "spdxId": "curl"}, "maintainers": [{"name": "Alice", "github": "alice"}],
             "platforms": ["x86_64-linux", "aarch64-linux"], "build_inputs": ["openssl", "zlib"]},
            {"attribute_path": "openssl", "version": "3.0.12", "description": "Cryptographic library",
             "license": "asl20", "platforms": ["x86_64-linux"]},
            {"attribute_path": "jq", "version": "1.7", "description": "JSON processor", "license": ["mit"],
             "maintainers": {"name": "Alice", "github": "alice"}}
        ]))
        .unwrap();
        let mut records = Vec::new();
        let mut edges = Vec::new();
        for (i, raw) in raws.into_iter().enumerate() {
            let package = raw.into_package(i).unwrap();
            records.push(package.record);
            edges.extend(package.edges);
        }
        records[0].embedding = Some(vec![1.0, 0.0, 0.0]);
        records[1].embedding = Some(vec![0.0, 1.0, 0.0]);
        let store = NormalizedStore::build(records, edges);
        Snapshot::assemble(
            generation,
            store,
            &IndexSettings::default(),
            Some("hashed".into()),
            BTreeSet::from(["jq".to_string()]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn artifact_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gen-000001.sqlite");
        let snapshot = sample_snapshot(1);
        write_snapshot(&path, &snapshot, &BTreeMap::new()).await.unwrap();

        let loaded = load_snapshot(&path).await.unwrap();
        assert!(loaded.validate().is_ok());
        assert_eq!(loaded.generation, 1);
        assert_eq!(loaded.embedding_model.as_deref(), Some("hashed"));
        assert_eq!(loaded.store.packages.keys().collect::<Vec<_>>(), snapshot.store.packages.keys().collect::<Vec<_>>());
        assert_eq!(loaded.store.dependencies, snapshot.store.dependencies);
        assert_eq!(loaded.store.dropped_edges.len(), 1);
        assert_eq!(loaded.store.dropped_edges[0].target_id, "zlib");
        assert_eq!(loaded.store.dropped_edges[0].kind, DependencyKind::Build);
        assert_eq!(loaded.deferred, snapshot.deferred);
        assert_eq!(loaded.vectors.ids(), snapshot.vectors.ids());
        assert_eq!(loaded.lexical.search("cryptographic", 3), snapshot.lexical.search("cryptographic", 3));
        assert_eq!(loaded.records.get("curl").unwrap(), snapshot.records.get("curl").unwrap());
        assert_eq!(
            loaded.vectors.search(&[0.9, 0.1, 0.0], 1).unwrap(),
            snapshot.vectors.search(&[0.9, 0.1, 0.0], 1).unwrap()
        );
        for (id, package) in &snapshot.store.packages {
            assert_eq!(loaded.store.packages[id].content_hash, package.content_hash);
            assert_eq!(loaded.store.packages[id].embedding, package.embedding);
        }
    }

    #[tokio::test]
    async fn embedding_records_carry_overridden_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gen-000002.sqlite");
        let snapshot = sample_snapshot(2);
        let overrides = BTreeMap::from([("openssl".to_string(), "older-hash".to_string())]);
        write_snapshot(&path, &snapshot, &overrides).await.unwrap();

        let (model, records) = load_embedding_records(&path).await.unwrap();
        assert_eq!(model.as_deref(), Some("hashed"));
        assert_eq!(records.len(), 2);
        assert_eq!(records["openssl"].content_hash, "older-hash");
        assert_eq!(records["curl"].content_hash, snapshot.store.packages["curl"].content_hash);
    }

    #[tokio::test]
    async fn refuses_to_overwrite_or_load_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gen-000003.sqlite");
        let snapshot = sample_snapshot(3);
        write_snapshot(&path, &snapshot, &BTreeMap::new()).await.unwrap();
        assert!(write_snapshot(&path, &snapshot, &BTreeMap::new()).await.is_err());
        assert!(load_snapshot(&dir.path().join("nope.sqlite")).await.is_err());
    }
}
