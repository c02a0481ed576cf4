//! Normalized store builder.
//!
//! Turns per-package license, maintainer and platform lists into
//! deduplicated lookup tables plus package-to-lookup junction rows, and
//! filters dependency edges down to those whose endpoints exist.
//!
//! Lookup rows are keyed by [`NaturalKey`]. Surrogate ids are assigned only
//! after all rows are collected, in natural-key order, so identical input
//! yields identical ids regardless of record order. Ids are not a stable
//! contract across different inputs; joins between snapshots go through
//! natural keys.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{DependencyReferenceError, ValidationError};
use crate::models::{Architecture, DependencyEdge, License, Maintainer, NaturalKey, PackageRecord};

/// A deduplicated lookup table.
#[derive(Debug, Clone)]
pub struct LookupTable<T: NaturalKey> {
    rows: BTreeMap<T::Key, (u32, T)>,
}

impl<T: NaturalKey + Clone> LookupTable<T> {
    fn from_values<'a>(values: impl IntoIterator<Item = &'a T>) -> Self
    where
        T: 'a,
    {
        let mut rows: BTreeMap<T::Key, (u32, T)> = BTreeMap::new();
        for value in values {
            rows.entry(value.natural_key())
                .or_insert_with(|| (0, value.clone()));
        }
        for (id, row) in rows.values_mut().enumerate() {
            row.0 = id as u32 + 1;
        }
        Self { rows }
    }

    pub fn id_of(&self, value: &T) -> Option<u32> {
        self.rows.get(&value.natural_key()).map(|(id, _)| *id)
    }

    pub fn contains_id(&self, id: u32) -> bool {
        id >= 1 && (id as usize) <= self.rows.len()
    }

    /// Rows in id order.
    pub fn rows(&self) -> impl Iterator<Item = (u32, &T)> {
        self.rows.values().map(|(id, value)| (*id, value))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A `(package_id, lookup_id)` association.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Junction {
    pub package_id: String,
    pub lookup_id: u32,
}

#[derive(Debug, Clone)]
pub struct NormalizedStore {
    /// Packages keyed by id.
    pub packages: BTreeMap<String, PackageRecord>,
    pub licenses: LookupTable<License>,
    pub maintainers: LookupTable<Maintainer>,
    pub architectures: LookupTable<Architecture>,
    pub package_licenses: Vec<Junction>,
    pub package_maintainers: Vec<Junction>,
    pub package_architectures: Vec<Junction>,
    /// Edges whose endpoints both exist, sorted and deduplicated.
    pub dependencies: Vec<DependencyEdge>,
    /// Edges dropped because the target is missing.
    pub dropped_edges: Vec<DependencyReferenceError>,
    /// Input records skipped because their id was already taken.
    pub duplicate_packages: usize,
}

impl NormalizedStore {
    /// Build the store. The first record wins when two share an id.
    pub fn build(records: Vec<PackageRecord>, edges: Vec<DependencyEdge>) -> Self {
        let mut packages: BTreeMap<String, PackageRecord> = BTreeMap::new();
        let mut duplicate_packages = 0;
        for record in records {
            if packages.contains_key(&record.id) {
                warn!(package = %record.id, "duplicate package id, keeping first occurrence");
                duplicate_packages += 1;
                continue;
            }
            packages.insert(record.id.clone(), record);
        }

        let licenses = LookupTable::from_values(packages.values().flat_map(|p| &p.licenses));
        let maintainers = LookupTable::from_values(packages.values().flat_map(|p| &p.maintainers));
        let architectures = LookupTable::from_values(packages.values().flat_map(|p| &p.platforms));

        let package_licenses = junctions(&packages, &licenses, |p| &p.licenses);
        let package_maintainers = junctions(&packages, &maintainers, |p| &p.maintainers);
        let package_architectures = junctions(&packages, &architectures, |p| &p.platforms);

        let mut kept: BTreeSet<DependencyEdge> = BTreeSet::new();
        let mut dropped_edges = Vec::new();
        for edge in edges {
            if edge.source_id == edge.target_id {
                debug!(package = %edge.source_id, "ignoring self dependency");
                continue;
            }
            if !packages.contains_key(&edge.source_id) || !packages.contains_key(&edge.target_id) {
                let err = DependencyReferenceError {
                    source_id: edge.source_id,
                    target_id: edge.target_id,
                    kind: edge.kind,
                };
                warn!(error = %err, "dropping dangling dependency edge");
                dropped_edges.push(err);
                continue;
            }
            kept.insert(edge);
        }
        dropped_edges.sort_by(|a, b| {
            (&a.source_id, &a.target_id, a.kind).cmp(&(&b.source_id, &b.target_id, b.kind))
        });
        dropped_edges.dedup();

        Self {
            packages,
            licenses,
            maintainers,
            architectures,
            package_licenses,
            package_maintainers,
            package_architectures,
            dependencies: kept.into_iter().collect(),
            dropped_edges,
            duplicate_packages,
        }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PackageRecord> {
        self.packages.get(id)
    }

    /// Packages carrying an embedding vector.
    pub fn embedded_count(&self) -> usize {
        self.packages
            .values()
            .filter(|p| p.embedding.is_some())
            .count()
    }

    /// Every junction row resolves on both sides and every edge resolves.
    pub fn check_integrity(&self) -> Result<(), ValidationError> {
        check_junctions("package_licenses", &self.package_licenses, self, |id| {
            self.licenses.contains_id(id)
        })?;
        check_junctions("package_maintainers", &self.package_maintainers, self, |id| {
            self.maintainers.contains_id(id)
        })?;
        check_junctions(
            "package_architectures",
            &self.package_architectures,
            self,
            |id| self.architectures.contains_id(id),
        )?;
        for edge in &self.dependencies {
            if !self.packages.contains_key(&edge.source_id)
                || !self.packages.contains_key(&edge.target_id)
            {
                return Err(ValidationError::DanglingDependency {
                    source_id: edge.source_id.clone(),
                    target_id: edge.target_id.clone(),
                });
            }
        }
        Ok(())
    }
}

fn check_junctions(
    table: &'static str,
    rows: &[Junction],
    store: &NormalizedStore,
    resolves: impl Fn(u32) -> bool,
) -> Result<(), ValidationError> {
    match rows
        .iter()
        .find(|row| !store.packages.contains_key(&row.package_id) || !resolves(row.lookup_id))
    {
        Some(row) => Err(ValidationError::OrphanedJunction {
            table,
            package_id: row.package_id.clone(),
            lookup_id: row.lookup_id,
        }),
        None => Ok(()),
    }
}

fn junctions<T: NaturalKey + Clone>(
    packages: &BTreeMap<String, PackageRecord>,
    table: &LookupTable<T>,
    values: impl Fn(&PackageRecord) -> &Vec<T>,
) -> Vec<Junction> {
    let mut rows: BTreeSet<Junction> = BTreeSet::new();
    for package in packages.values() {
        for value in values(package) {
            if let Some(lookup_id) = table.id_of(value) {
                rows.insert(Junction {
                    package_id: package.id.clone(),
                    lookup_id,
                });
            }
        }
    }
    rows.into_iter().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{DependencyKind, StatusFlags};

    pub(crate) fn package(id: &str, licenses: &[&str], maintainers: &[&str]) -> PackageRecord {
        PackageRecord {
            id: id.into(),
            name: id.into(),
            version: "1.0".into(),
            attribute_path: id.into(),
            description: Some(format!("{} package", id)),
            long_description: None,
            homepage: None,
            category: "misc".into(),
            flags: StatusFlags::default(),
            main_program: None,
            content_hash: format!("hash-{}", id),
            embedding: None,
            licenses: licenses
                .iter()
                .map(|l| License {
                    short_name: l.to_string(),
                    spdx_id: Some(l.to_uppercase()),
                    full_name: None,
                    url: None,
                    free: Some(true),
                })
                .collect(),
            maintainers: maintainers
                .iter()
                .map(|m| Maintainer {
                    name: Some(m.to_string()),
                    email: Some(format!("{}@example.org", m)),
                    github: None,
                    github_id: None,
                })
                .collect(),
            platforms: vec![Architecture {
                name: "x86_64-linux".into(),
            }],
        }
    }

    fn edge(source: &str, target: &str) -> DependencyEdge {
        DependencyEdge {
            source_id: source.into(),
            target_id: target.into(),
            kind: DependencyKind::Build,
        }
    }

    #[test]
    fn lookup_rows_are_unique() {
        let store = NormalizedStore::build(
            vec![
                package("a", &["mit", "gpl"], &["alice"]),
                package("b", &["mit"], &["alice", "bob"]),
                package("c", &["gpl"], &[]),
            ],
            vec![],
        );
        assert_eq!(store.licenses.len(), 2);
        assert_eq!(store.maintainers.len(), 2);
        assert_eq!(store.architectures.len(), 1);
        assert_eq!(store.package_licenses.len(), 4);
        assert_eq!(store.package_maintainers.len(), 3);
        assert!(store.check_integrity().is_ok());
    }

    #[test]
    fn ids_do_not_depend_on_input_order() {
        let forward = NormalizedStore::build(
            vec![package("a", &["zlib"], &[]), package("b", &["apache"], &[])],
            vec![],
        );
        let backward = NormalizedStore::build(
            vec![package("b", &["apache"], &[]), package("a", &["zlib"], &[])],
            vec![],
        );
        let f: Vec<(u32, String)> = forward
            .licenses
            .rows()
            .map(|(id, l)| (id, l.short_name.clone()))
            .collect();
        let b: Vec<(u32, String)> = backward
            .licenses
            .rows()
            .map(|(id, l)| (id, l.short_name.clone()))
            .collect();
        assert_eq!(f, b);
        assert_eq!(forward.package_licenses, backward.package_licenses);
    }

    #[test]
    fn dangling_edges_are_dropped_and_counted() {
        let store = NormalizedStore::build(
            vec![package("a", &[], &[]), package("b", &[], &[])],
            vec![edge("a", "b"), edge("b", "c"), edge("a", "a"), edge("a", "b")],
        );
        assert_eq!(store.dependencies, vec![edge("a", "b")]);
        assert_eq!(store.dropped_edges.len(), 1);
        assert_eq!(store.dropped_edges[0].target_id, "c");
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let mut second = package("a", &["other"], &[]);
        second.version = "2.0".into();
        let store = NormalizedStore::build(vec![package("a", &["mit"], &[]), second], vec![]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.duplicate_packages, 1);
        assert_eq!(store.get("a").map(|p| p.version.as_str()), Some("1.0"));
        assert_eq!(store.licenses.len(), 1);
    }

    #[test]
    fn integrity_detects_orphans() {
        let mut store = NormalizedStore::build(vec![package("a", &["mit"], &[])], vec![]);
        store.package_licenses.push(Junction {
            package_id: "a".into(),
            lookup_id: 99,
        });
        assert!(matches!(
            store.check_integrity(),
            Err(ValidationError::OrphanedJunction { .. })
        ));
    }
}
