//! Snapshot catalog, build marker, and atomic cutover.
//!
//! Every generation moves through
//! `BUILDING → VALIDATING → PUBLISHED → RETIRED`; a generation that fails
//! validation ends in `FAILED` and never becomes visible. The catalog
//! (`catalog.sqlite`) records each generation's state. In-process readers
//! go through a [`SnapshotCell`], which is swapped to the new generation
//! only after its artifact has been reloaded from disk and validated.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use fs2::FileExt;
use tracing::{debug, info, warn};

use pkgsearch_core::error::ValidationError;
use pkgsearch_core::snapshot::Snapshot;

use crate::artifact;
use crate::config::DataConfig;
use crate::db;
use crate::migrate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    Building,
    Validating,
    Published,
    Retired,
    Failed,
}

impl SnapshotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Building => "BUILDING",
            SnapshotState::Validating => "VALIDATING",
            SnapshotState::Published => "PUBLISHED",
            SnapshotState::Retired => "RETIRED",
            SnapshotState::Failed => "FAILED",
        }
    }

    /// Legal state-machine edges. FAILED is only reachable from VALIDATING.
    pub fn can_transition_to(&self, next: SnapshotState) -> bool {
        matches!(
            (self, next),
            (SnapshotState::Building, SnapshotState::Validating)
                | (SnapshotState::Validating, SnapshotState::Published)
                | (SnapshotState::Validating, SnapshotState::Failed)
                | (SnapshotState::Published, SnapshotState::Retired)
        )
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "BUILDING" => SnapshotState::Building,
            "VALIDATING" => SnapshotState::Validating,
            "PUBLISHED" => SnapshotState::Published,
            "RETIRED" => SnapshotState::Retired,
            "FAILED" => SnapshotState::Failed,
            other => bail!("unknown snapshot state '{}'", other),
        })
    }
}

/// One catalog row.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub generation: u64,
    pub state: SnapshotState,
    /// Artifact path relative to the data directory.
    pub path: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub published_at: Option<i64>,
    pub error: Option<String>,
    pub package_count: u64,
    pub embedded_count: u64,
    pub deferred_count: u64,
    pub dropped_edge_count: u64,
}

/// Per-generation counters stored in the catalog.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SnapshotCounts {
    pub package_count: u64,
    pub embedded_count: u64,
    pub deferred_count: u64,
    pub dropped_edge_count: u64,
}

impl SnapshotCounts {
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            package_count: snapshot.store.len() as u64,
            embedded_count: snapshot.store.embedded_count() as u64,
            deferred_count: snapshot.deferred.len() as u64,
            dropped_edge_count: snapshot.store.dropped_edges.len() as u64,
        }
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SnapshotEntry> {
    let generation: i64 = row.get("generation");
    let state: String = row.get("state");
    let count = |column: &str| -> u64 { row.get::<i64, _>(column) as u64 };
    Ok(SnapshotEntry {
        generation: generation as u64,
        state: state.parse()?,
        path: row.get("path"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        published_at: row.get("published_at"),
        error: row.get("error"),
        package_count: count("package_count"),
        embedded_count: count("embedded_count"),
        deferred_count: count("deferred_count"),
        dropped_edge_count: count("dropped_edge_count"),
    })
}

/// The catalog database.
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub async fn open(data: &DataConfig) -> Result<Self> {
        let pool = db::connect(&data.catalog_path()).await?;
        migrate::run_catalog_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// All generations, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotEntry>> {
        sqlx::query("SELECT * FROM snapshots ORDER BY generation DESC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    pub async fn get(&self, generation: u64) -> Result<Option<SnapshotEntry>> {
        sqlx::query("SELECT * FROM snapshots WHERE generation = ?")
            .bind(generation as i64)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(entry_from_row)
            .transpose()
    }

    pub async fn published(&self) -> Result<Option<SnapshotEntry>> {
        sqlx::query("SELECT * FROM snapshots WHERE state = 'PUBLISHED'")
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(entry_from_row)
            .transpose()
    }

    /// Insert a BUILDING row for the next generation.
    async fn begin(&self, path_for: impl Fn(u64) -> String) -> Result<SnapshotEntry> {
        let mut tx = self.pool.begin().await?;
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(generation) FROM snapshots")
            .fetch_one(&mut *tx)
            .await?;
        let generation = last.unwrap_or(0) as u64 + 1;
        let now = chrono::Utc::now().timestamp();
        let path = path_for(generation);
        sqlx::query(
            "INSERT INTO snapshots (generation, state, path, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(generation as i64)
        .bind(SnapshotState::Building.as_str())
        .bind(&path)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.get(generation)
            .await?
            .context("BUILDING row vanished after insert")
    }

    /// Move `generation` from `from` to `to`, failing if it is not in `from`.
    pub async fn transition(
        &self,
        generation: u64,
        from: SnapshotState,
        to: SnapshotState,
        error: Option<&str>,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            bail!("illegal snapshot transition {} -> {}", from, to);
        }
        let result = sqlx::query(
            "UPDATE snapshots SET state = ?, updated_at = ?, error = COALESCE(?, error) WHERE generation = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(error)
        .bind(generation as i64)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!("generation {} is not {}", generation, from);
        }
        Ok(())
    }

    pub async fn record_counts(&self, generation: u64, counts: SnapshotCounts) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE snapshots SET package_count = ?, embedded_count = ?, deferred_count = ?,
                                 dropped_edge_count = ?, updated_at = ?
            WHERE generation = ?
            "#,
        )
        .bind(counts.package_count as i64)
        .bind(counts.embedded_count as i64)
        .bind(counts.deferred_count as i64)
        .bind(counts.dropped_edge_count as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(generation as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retire the current PUBLISHED row and publish `generation`, in one
    /// transaction. Returns the retired generation, if any.
    async fn cutover(&self, generation: u64) -> Result<Option<u64>> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let previous: Option<i64> =
            sqlx::query_scalar("SELECT generation FROM snapshots WHERE state = 'PUBLISHED'")
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            "UPDATE snapshots SET state = 'RETIRED', updated_at = ? WHERE state = 'PUBLISHED'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "UPDATE snapshots SET state = 'PUBLISHED', published_at = ?, updated_at = ? WHERE generation = ? AND state = 'VALIDATING'",
        )
        .bind(now)
        .bind(now)
        .bind(generation as i64)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            bail!("generation {} is not VALIDATING", generation);
        }
        tx.commit().await?;
        Ok(previous.map(|p| p as u64))
    }

    async fn delete(&self, generation: u64) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE generation = ?")
            .bind(generation as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Exclusive advisory lock held for the duration of one build.
///
/// The lock lives on the open file, not on the file's existence: the OS
/// releases it when the guard drops or the process dies, so a crashed
/// build never leaves a stale lock behind. The file itself is left in
/// place.
#[derive(Debug)]
pub struct BuildGuard {
    _file: File,
    path: PathBuf,
}

impl BuildGuard {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "acquired build lock");
                Ok(Self {
                    _file: file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                bail!("another build is in progress (lock held on {})", path.display())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "released build lock");
    }
}

/// The reference readers go through to reach the live snapshot.
///
/// Readers clone the `Arc` under a short read lock and keep using that
/// generation even after a swap; the old snapshot is freed when its last
/// reader drops it.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<Snapshot>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Point readers at `next`. Returns the snapshot it replaced.
    pub fn swap(&self, next: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.replace(next)
    }

    /// Generation currently served; 0 when nothing is loaded.
    pub fn generation(&self) -> u64 {
        self.load().map_or(0, |snapshot| snapshot.generation)
    }
}

/// A generation in the BUILDING state, owned by the running build.
#[derive(Debug)]
pub struct PendingSnapshot {
    pub generation: u64,
    pub path: PathBuf,
}

/// A generation that passed validation, reloaded from its artifact.
#[derive(Debug)]
pub struct ValidatedSnapshot {
    pub generation: u64,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub generation: u64,
    pub retired: Option<u64>,
    pub removed_artifacts: usize,
}

/// Drives generations through the catalog and swaps the [`SnapshotCell`].
pub struct Publisher {
    data: DataConfig,
    catalog: Catalog,
    cell: Arc<SnapshotCell>,
}

impl Publisher {
    pub async fn open(data: &DataConfig, cell: Arc<SnapshotCell>) -> Result<Self> {
        std::fs::create_dir_all(data.snapshots_dir())?;
        Ok(Self {
            data: data.clone(),
            catalog: Catalog::open(data).await?,
            cell,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cell(&self) -> &Arc<SnapshotCell> {
        &self.cell
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.data.dir.join(relative)
    }

    /// Load the PUBLISHED generation into the cell, if there is one.
    pub async fn load_current(&self) -> Result<Option<Arc<Snapshot>>> {
        let Some(entry) = self.catalog.published().await? else {
            return Ok(None);
        };
        let snapshot = Arc::new(artifact::load_snapshot(&self.resolve(&entry.path)).await?);
        self.cell.swap(Arc::clone(&snapshot));
        info!(generation = entry.generation, "loaded published snapshot");
        Ok(Some(snapshot))
    }

    /// Artifact of the PUBLISHED generation, for carrying embeddings over.
    pub async fn published_artifact(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .catalog
            .published()
            .await?
            .map(|entry| self.resolve(&entry.path)))
    }

    /// Start a new generation. Requires the build marker.
    ///
    /// Leftovers of interrupted builds are cleaned first: BUILDING rows are
    /// abandoned and VALIDATING rows are marked FAILED.
    pub async fn begin(&self, _guard: &BuildGuard) -> Result<PendingSnapshot> {
        for entry in self.catalog.list().await? {
            match entry.state {
                SnapshotState::Building => {
                    warn!(generation = entry.generation, "removing interrupted build");
                    self.remove(entry.generation, &entry.path).await?;
                }
                SnapshotState::Validating => {
                    self.catalog
                        .transition(
                            entry.generation,
                            SnapshotState::Validating,
                            SnapshotState::Failed,
                            Some("interrupted during validation"),
                        )
                        .await?;
                }
                _ => {}
            }
        }

        let entry = self
            .catalog
            .begin(|generation| format!("snapshots/gen-{:06}.sqlite", generation))
            .await?;
        let path = self.resolve(&entry.path);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale artifact {}", path.display()))?;
        }
        info!(generation = entry.generation, "build started");
        Ok(PendingSnapshot {
            generation: entry.generation,
            path,
        })
    }

    /// Drop a generation that errored before validation: no state change,
    /// its row and partial artifact disappear.
    pub async fn abandon(&self, pending: PendingSnapshot) -> Result<()> {
        warn!(generation = pending.generation, "abandoning build");
        let relative = format!("snapshots/gen-{:06}.sqlite", pending.generation);
        self.remove(pending.generation, &relative).await
    }

    async fn remove(&self, generation: u64, relative: &str) -> Result<()> {
        let path = self.resolve(relative);
        for file in artifact_files(&path) {
            if file.exists() {
                std::fs::remove_file(&file)?;
            }
        }
        self.catalog.delete(generation).await
    }

    /// Move a written generation to VALIDATING and check its artifact.
    ///
    /// The artifact is reloaded from disk so what gets validated is exactly
    /// what readers will load. On failure the generation ends in FAILED and
    /// the current PUBLISHED generation stays live.
    pub async fn validate(
        &self,
        pending: PendingSnapshot,
        expected: SnapshotCounts,
    ) -> Result<ValidatedSnapshot> {
        let generation = pending.generation;
        self.catalog
            .transition(generation, SnapshotState::Building, SnapshotState::Validating, None)
            .await?;
        self.catalog.record_counts(generation, expected).await?;

        match self.check_artifact(&pending.path, expected).await {
            Ok(snapshot) => Ok(ValidatedSnapshot {
                generation,
                snapshot,
            }),
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(generation, error = %message, "snapshot failed validation");
                self.catalog
                    .transition(
                        generation,
                        SnapshotState::Validating,
                        SnapshotState::Failed,
                        Some(&message),
                    )
                    .await?;
                bail!("generation {} failed validation: {}", generation, message)
            }
        }
    }

    /// Make a validated generation the PUBLISHED one and point readers at it.
    pub async fn publish(&self, validated: ValidatedSnapshot) -> Result<PublishOutcome> {
        let generation = validated.generation;
        let retired = self.catalog.cutover(generation).await?;
        self.cell.swap(Arc::new(validated.snapshot));
        info!(generation, retired = ?retired, "published snapshot");

        let removed_artifacts = self.apply_retention().await?;
        Ok(PublishOutcome {
            generation,
            retired,
            removed_artifacts,
        })
    }

    async fn check_artifact(&self, path: &Path, expected: SnapshotCounts) -> Result<Snapshot> {
        let snapshot = artifact::load_snapshot(path).await?;
        snapshot.validate()?;
        let actual = SnapshotCounts::of(&snapshot);
        if actual.package_count != expected.package_count
            || actual.embedded_count != expected.embedded_count
        {
            return Err(ValidationError::ArtifactMismatch(format!(
                "artifact holds {} packages / {} vectors, build produced {} / {}",
                actual.package_count,
                actual.embedded_count,
                expected.package_count,
                expected.embedded_count
            ))
            .into());
        }
        Ok(snapshot)
    }

    /// Delete artifact files of RETIRED generations beyond `keep_retired`.
    /// Catalog rows are kept.
    async fn apply_retention(&self) -> Result<usize> {
        let mut removed = 0;
        let retired = self
            .catalog
            .list()
            .await?
            .into_iter()
            .filter(|e| e.state == SnapshotState::Retired);
        for entry in retired.skip(self.data.keep_retired) {
            let path = self.resolve(&entry.path);
            if path.exists() {
                for file in artifact_files(&path) {
                    if file.exists() {
                        std::fs::remove_file(&file)?;
                    }
                }
                info!(generation = entry.generation, "removed retired artifact");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Open the catalog and load the PUBLISHED snapshot for a one-shot command.
pub async fn load_published(data: &DataConfig) -> Result<Arc<Snapshot>> {
    let publisher = Publisher::open(data, Arc::new(SnapshotCell::new())).await?;
    let loaded = publisher.load_current().await;
    publisher.catalog().close().await;
    loaded?.context("no published snapshot; run `pkgsearch build` first")
}

/// The artifact plus its SQLite WAL side files.
fn artifact_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use pkgsearch_core::compress::CompressedStore;
    use pkgsearch_core::normalize::NormalizedStore;
    use pkgsearch_core::raw::RawPackage;
    use pkgsearch_core::snapshot::IndexSettings;

    fn data_config(dir: &Path) -> DataConfig {
        DataConfig {
            dir: dir.to_path_buf(),
            keep_retired: 1,
        }
    }

    fn snapshot(generation: u64, names: &[&str]) -> Snapshot {
        let records = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let raw = RawPackage {
                    attribute_path: Some(name.to_string()),
                    version: Some(format!("{}.0", generation)),
                    ..RawPackage::default()
                };
                raw.into_package(i).unwrap().record
            })
            .collect();
        Snapshot::assemble(
            generation,
            NormalizedStore::build(records, vec![]),
            &IndexSettings::default(),
            None,
            BTreeSet::new(),
        )
        .unwrap()
    }

    async fn build(publisher: &Publisher, guard: &BuildGuard, names: &[&str]) -> Result<PublishOutcome> {
        let pending = publisher.begin(guard).await?;
        let snap = snapshot(pending.generation, names);
        artifact::write_snapshot(&pending.path, &snap, &BTreeMap::new()).await?;
        let validated = publisher.validate(pending, SnapshotCounts::of(&snap)).await?;
        publisher.publish(validated).await
    }

    #[test]
    fn state_machine_edges() {
        use SnapshotState::*;
        assert!(Building.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Failed));
        assert!(Published.can_transition_to(Retired));
        assert!(!Building.can_transition_to(Failed));
        assert!(!Building.can_transition_to(Published));
        assert!(!Retired.can_transition_to(Published));
        assert_eq!("FAILED".parse::<SnapshotState>().unwrap(), Failed);
    }

    #[test]
    fn build_guard_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = dir.path().join("build.lock");
        let guard = BuildGuard::acquire(&lock).unwrap();
        let err = BuildGuard::acquire(&lock).unwrap_err();
        assert!(err.to_string().contains("another build is in progress"));
        drop(guard);
        assert!(lock.exists());
        assert!(BuildGuard::acquire(&lock).is_ok());
    }

    #[test]
    fn leftover_lock_file_does_not_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = dir.path().join("build.lock");
        std::fs::write(&lock, "").unwrap();
        let guard = BuildGuard::acquire(&lock).unwrap();
        drop(guard);
        assert!(BuildGuard::acquire(&lock).is_ok());
    }

    #[test]
    fn lock_follows_the_open_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = dir.path().join("build.lock");
        // A forgotten guard keeps its descriptor open, like a live process.
        std::mem::forget(BuildGuard::acquire(&lock).unwrap());
        assert!(BuildGuard::acquire(&lock).is_err());

        // Closing the descriptor is what a crash does; nothing else needs
        // cleaning up before the next build.
        let other = dir.path().join("other.lock");
        let held = File::create(&other).unwrap();
        held.try_lock_exclusive().unwrap();
        assert!(BuildGuard::acquire(&other).is_err());
        drop(held);
        assert!(other.exists());
        assert!(BuildGuard::acquire(&other).is_ok());
    }

    #[test]
    fn cell_generation_tracks_the_loaded_snapshot() {
        let cell = SnapshotCell::new();
        assert_eq!(cell.generation(), 0);
        assert!(cell.swap(Arc::new(snapshot(4, &["hello"]))).is_none());
        assert_eq!(cell.generation(), 4);
        let pinned = cell.load().unwrap();
        let previous = cell.swap(Arc::new(snapshot(5, &["hello", "jq"]))).unwrap();
        assert_eq!(previous.generation, 4);
        assert_eq!(pinned.generation, 4);
        assert_eq!(cell.generation(), cell.load().unwrap().generation);
        assert_eq!(cell.generation(), 5);
    }

    #[tokio::test]
    async fn publish_retires_previous_and_applies_retention() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = data_config(dir.path());
        let cell = Arc::new(SnapshotCell::new());
        let publisher = Publisher::open(&data, Arc::clone(&cell)).await.unwrap();
        let guard = BuildGuard::acquire(&data.lock_path()).unwrap();

        for round in 1..=3u64 {
            let outcome = build(&publisher, &guard, &["hello", "jq"]).await.unwrap();
            assert_eq!(outcome.generation, round);
            assert_eq!(outcome.retired, (round > 1).then(|| round - 1));
            assert_eq!(cell.generation(), round);
        }

        let entries = publisher.catalog().list().await.unwrap();
        let states: Vec<SnapshotState> = entries.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![SnapshotState::Published, SnapshotState::Retired, SnapshotState::Retired]
        );
        // keep_retired = 1: generation 1's file is gone, generation 2's remains
        assert!(!dir.path().join("snapshots/gen-000001.sqlite").exists());
        assert!(dir.path().join("snapshots/gen-000002.sqlite").exists());
        assert_eq!(entries[0].package_count, 2);
    }

    #[tokio::test]
    async fn failed_validation_keeps_previous_live() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = data_config(dir.path());
        let cell = Arc::new(SnapshotCell::new());
        let publisher = Publisher::open(&data, Arc::clone(&cell)).await.unwrap();
        let guard = BuildGuard::acquire(&data.lock_path()).unwrap();
        build(&publisher, &guard, &["hello"]).await.unwrap();

        let pending = publisher.begin(&guard).await.unwrap();
        let generation = pending.generation;
        let mut broken = snapshot(generation, &["hello", "jq"]);
        let blobs: BTreeMap<String, Vec<u8>> = broken
            .records
            .blobs()
            .filter(|(id, _)| *id != "jq")
            .map(|(id, b)| (id.to_string(), b.to_vec()))
            .collect();
        broken.records = CompressedStore::from_parts(broken.records.dictionary().clone(), blobs);
        artifact::write_snapshot(&pending.path, &broken, &BTreeMap::new())
            .await
            .unwrap();
        let err = publisher
            .validate(pending, SnapshotCounts::of(&broken))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed validation"));

        let failed = publisher.catalog().get(generation).await.unwrap().unwrap();
        assert_eq!(failed.state, SnapshotState::Failed);
        assert!(failed.error.unwrap().contains("jq"));
        assert_eq!(publisher.catalog().published().await.unwrap().unwrap().generation, 1);
        assert_eq!(cell.generation(), 1);
        assert_eq!(cell.load().unwrap().store.len(), 1);
    }

    #[tokio::test]
    async fn abandon_removes_row_and_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = data_config(dir.path());
        let publisher = Publisher::open(&data, Arc::new(SnapshotCell::new())).await.unwrap();
        let guard = BuildGuard::acquire(&data.lock_path()).unwrap();
        let pending = publisher.begin(&guard).await.unwrap();
        let path = pending.path.clone();
        std::fs::write(&path, b"partial").unwrap();
        publisher.abandon(pending).await.unwrap();
        assert!(!path.exists());
        assert!(publisher.catalog().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_current_restores_published() {
        let dir = tempfile::TempDir::new().unwrap();
        let data = data_config(dir.path());
        {
            let publisher = Publisher::open(&data, Arc::new(SnapshotCell::new())).await.unwrap();
            let guard = BuildGuard::acquire(&data.lock_path()).unwrap();
            build(&publisher, &guard, &["hello", "jq", "curl"]).await.unwrap();
            publisher.catalog().close().await;
        }
        let cell = Arc::new(SnapshotCell::new());
        let publisher = Publisher::open(&data, Arc::clone(&cell)).await.unwrap();
        let loaded = publisher.load_current().await.unwrap().unwrap();
        assert_eq!(loaded.store.len(), 3);
        assert_eq!(cell.generation(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_a_mixed_snapshot() {
        let cell = Arc::new(SnapshotCell::new());
        cell.swap(Arc::new(snapshot(1, &["alpha", "beta"])));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    let snap = cell.load().unwrap();
                    let version = format!("{}.0", snap.generation);
                    // every record of a generation carries that generation's version
                    for id in snap.store.packages.keys() {
                        let record = snap.records.get(id).unwrap().unwrap();
                        assert_eq!(record.version, version);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for generation in 2..=20 {
            cell.swap(Arc::new(snapshot(generation, &["alpha", "beta"])));
            tokio::task::yield_now().await;
        }
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(cell.generation(), 20);
    }
}
