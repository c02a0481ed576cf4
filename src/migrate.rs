//! SQLite schemas for the snapshot catalog and per-generation artifacts.

use anyhow::Result;
use sqlx::SqlitePool;

/// Create the catalog table if it does not exist.
pub async fn run_catalog_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            generation INTEGER PRIMARY KEY,
            state TEXT NOT NULL,
            path TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            published_at INTEGER,
            error TEXT,
            package_count INTEGER NOT NULL DEFAULT 0,
            embedded_count INTEGER NOT NULL DEFAULT 0,
            deferred_count INTEGER NOT NULL DEFAULT 0,
            dropped_edge_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_state ON snapshots(state)")
        .execute(pool)
        .await?;

    Ok(())
}

const ARTIFACT_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE packages (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        attribute_path TEXT NOT NULL,
        description TEXT,
        long_description TEXT,
        homepage TEXT,
        category TEXT NOT NULL,
        broken INTEGER NOT NULL,
        unfree INTEGER NOT NULL,
        insecure INTEGER NOT NULL,
        unsupported INTEGER NOT NULL,
        available INTEGER NOT NULL,
        main_program TEXT,
        content_hash TEXT NOT NULL,
        embedding_deferred INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE licenses (
        id INTEGER PRIMARY KEY,
        short_name TEXT NOT NULL,
        spdx_id TEXT,
        full_name TEXT,
        url TEXT,
        free INTEGER
    )
    "#,
    r#"
    CREATE TABLE maintainers (
        id INTEGER PRIMARY KEY,
        name TEXT,
        email TEXT,
        github TEXT,
        github_id INTEGER
    )
    "#,
    r#"
    CREATE TABLE architectures (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE package_licenses (
        package_id TEXT NOT NULL REFERENCES packages(id),
        license_id INTEGER NOT NULL REFERENCES licenses(id),
        PRIMARY KEY (package_id, license_id)
    )
    "#,
    r#"
    CREATE TABLE package_maintainers (
        package_id TEXT NOT NULL REFERENCES packages(id),
        maintainer_id INTEGER NOT NULL REFERENCES maintainers(id),
        PRIMARY KEY (package_id, maintainer_id)
    )
    "#,
    r#"
    CREATE TABLE package_architectures (
        package_id TEXT NOT NULL REFERENCES packages(id),
        architecture_id INTEGER NOT NULL REFERENCES architectures(id),
        PRIMARY KEY (package_id, architecture_id)
    )
    "#,
    r#"
    CREATE TABLE dependency_edges (
        source_id TEXT NOT NULL REFERENCES packages(id),
        target_id TEXT NOT NULL REFERENCES packages(id),
        kind TEXT NOT NULL,
        PRIMARY KEY (source_id, target_id, kind)
    )
    "#,
    r#"
    CREATE TABLE dropped_edges (
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        kind TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE embeddings (
        package_id TEXT PRIMARY KEY REFERENCES packages(id),
        content_hash TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE packages_kv (
        id TEXT PRIMARY KEY REFERENCES packages(id),
        blob BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE lexical_text (
        id TEXT PRIMARY KEY REFERENCES packages(id),
        name TEXT NOT NULL,
        attribute_path TEXT NOT NULL,
        description TEXT NOT NULL,
        long_description TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE dictionary (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        kind TEXT NOT NULL,
        bytes BLOB NOT NULL
    )
    "#,
    "CREATE INDEX idx_dependency_edges_target ON dependency_edges(target_id)",
];

/// Create the artifact tables in a fresh database file.
pub async fn create_artifact_schema(pool: &SqlitePool) -> Result<()> {
    for statement in ARTIFACT_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
