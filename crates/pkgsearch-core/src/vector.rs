//! Approximate nearest-neighbour index over package embeddings.
//!
//! Uses rust-cv's [`hnsw`] graph with a [`space::Metric`] over owned
//! `Box<[f32]>` vectors. The graph is built in one batch: items are
//! inserted in package-id order and the crate seeds its level generator
//! with a fixed seed, so the same input always produces the same graph.
//! Artifacts therefore store only the embeddings and rebuild the graph on
//! load.
//!
//! Every comparison is a distance (lower is closer): the negated dot
//! product, mapped onto `u32` preserving order. For
//! [`DistanceMetric::Cosine`] vectors are L2 normalized up front so the
//! dot product equals cosine similarity.

use std::fmt;
use std::sync::Arc;

use hnsw::{Hnsw, Params, Searcher};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use space::{Metric, Neighbor};
use tracing::instrument;

use crate::embedding::l2_normalize;
use crate::error::IndexError;

/// Links per node on upper layers.
const M: usize = 16;
/// Links per node on layer 0.
const M0: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Dot,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
        }
    }
}

/// Build quality versus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Order-preserving map from `f32` onto `u32`.
fn ordered_bits(x: f32) -> u32 {
    let bits = x.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

#[derive(Debug, Clone, Copy)]
struct NegatedDot;

impl Metric<Box<[f32]>> for NegatedDot {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        ordered_bits(-dot(a, b))
    }
}

fn prepare(metric: DistanceMetric, mut vector: Vec<f32>) -> Box<[f32]> {
    if metric == DistanceMetric::Cosine {
        l2_normalize(&mut vector);
    }
    vector.into_boxed_slice()
}

type Graph = Hnsw<NegatedDot, Box<[f32]>, StdRng, M, M0>;

#[derive(Clone)]
pub struct VectorIndex {
    metric: DistanceMetric,
    params: HnswParams,
    dims: usize,
    /// Package id per graph item, in insertion order.
    ids: Arc<Vec<String>>,
    graph: Arc<Graph>,
}

impl fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorIndex")
            .field("metric", &self.metric)
            .field("params", &self.params)
            .field("dims", &self.dims)
            .field("nodes", &self.ids.len())
            .finish()
    }
}

impl VectorIndex {
    /// Build the graph. Every vector must have the same dimensionality.
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn build(
        mut items: Vec<(String, Vec<f32>)>,
        metric: DistanceMetric,
        params: HnswParams,
    ) -> Result<Self, IndexError> {
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let dims = items.first().map(|(_, v)| v.len()).unwrap_or(0);
        if let Some((_, v)) = items.iter().find(|(_, v)| v.len() != dims) {
            return Err(IndexError::DimensionMismatch {
                expected: dims,
                actual: v.len(),
            });
        }

        let mut graph: Graph = Hnsw::new_params(
            NegatedDot,
            Params::new().ef_construction(params.ef_construction.max(1)),
        );
        let mut searcher = Searcher::default();
        let mut ids = Vec::with_capacity(items.len());
        for (id, vector) in items {
            graph.insert(prepare(metric, vector), &mut searcher);
            ids.push(id);
        }

        Ok(Self {
            metric,
            params,
            dims,
            ids: Arc::new(ids),
            graph: Arc::new(graph),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Top `k` packages by similarity (cosine or dot), highest first; ties
    /// broken by package id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f64)>, IndexError> {
        if self.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        let query = prepare(self.metric, query.to_vec());
        let want = k.min(self.ids.len());
        let ef = self.params.ef_search.max(want);

        // Searcher scratch space is per query; the graph itself is shared.
        let mut searcher = Searcher::default();
        let mut neighbours = vec![
            Neighbor {
                index: !0,
                distance: !0
            };
            want
        ];
        let found = self.graph.nearest(&query, ef, &mut searcher, &mut neighbours);

        let mut hits: Vec<(String, f64)> = found
            .iter()
            .filter(|n| n.index != !0)
            .filter_map(|n| {
                let id = self.ids.get(n.index)?;
                Some((id.clone(), dot(&query, self.graph.feature(n.index)) as f64))
            })
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn random_items(n: usize, dims: usize, seed: u64) -> Vec<(String, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let v: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
                (format!("pkg{:04}", i), v)
            })
            .collect()
    }

    fn brute_force(items: &[(String, Vec<f32>)], query: &[f32], k: usize) -> Vec<String> {
        let q = prepare(DistanceMetric::Cosine, query.to_vec());
        let mut scored: Vec<(String, f32)> = items
            .iter()
            .map(|(id, v)| (id.clone(), dot(&q, &prepare(DistanceMetric::Cosine, v.clone()))))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    #[test]
    fn ordered_bits_preserves_order() {
        let values = [-3.5f32, -1.0, -0.0, 0.0, 0.25, 1.0, 7.0];
        for pair in values.windows(2) {
            assert!(ordered_bits(pair[0]) <= ordered_bits(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn exact_match_is_nearest() {
        let items = vec![
            ("a".to_string(), vec![1.0, 0.0, 0.0]),
            ("b".to_string(), vec![0.0, 1.0, 0.0]),
            ("c".to_string(), vec![0.0, 0.0, 1.0]),
        ];
        let index = VectorIndex::build(items, DistanceMetric::Cosine, HnswParams::default()).unwrap();
        let hits = index.search(&[0.0, 2.0, 0.1], 3).unwrap();
        assert_eq!(hits[0].0, "b");
        assert_eq!(hits.len(), 3);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn recall_against_brute_force() {
        let items = random_items(300, 16, 7);
        let index = VectorIndex::build(items.clone(), DistanceMetric::Cosine, HnswParams::default())
            .unwrap();
        let queries = random_items(20, 16, 99);
        let mut found = 0;
        for (_, q) in &queries {
            let truth = brute_force(&items, q, 10);
            let hits = index.search(q, 10).unwrap();
            found += hits.iter().filter(|(id, _)| truth.contains(id)).count();
        }
        let recall = found as f64 / (queries.len() * 10) as f64;
        assert!(recall >= 0.9, "recall too low: {}", recall);
    }

    #[test]
    fn dot_metric_prefers_magnitude() {
        let items = vec![
            ("small".to_string(), vec![1.0, 0.0]),
            ("large".to_string(), vec![5.0, 0.0]),
        ];
        let dot_index = VectorIndex::build(items.clone(), DistanceMetric::Dot, HnswParams::default()).unwrap();
        assert_eq!(dot_index.search(&[1.0, 0.0], 1).unwrap()[0].0, "large");

        let cos_index = VectorIndex::build(items, DistanceMetric::Cosine, HnswParams::default()).unwrap();
        let hits = cos_index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].1, hits[1].1);
        assert_eq!(hits[0].0, "large");
    }

    #[test]
    fn build_is_deterministic_and_order_independent() {
        let items = random_items(100, 8, 3);
        let mut reversed = items.clone();
        reversed.reverse();
        let a = VectorIndex::build(items, DistanceMetric::Cosine, HnswParams::default()).unwrap();
        let b = VectorIndex::build(reversed, DistanceMetric::Cosine, HnswParams::default()).unwrap();
        assert_eq!(a.ids(), b.ids());
        for (_, q) in random_items(10, 8, 42) {
            assert_eq!(a.search(&q, 5).unwrap(), b.search(&q, 5).unwrap());
        }
    }

    #[test]
    fn dimension_errors() {
        let err = VectorIndex::build(
            vec![("a".into(), vec![1.0, 0.0]), ("b".into(), vec![1.0])],
            DistanceMetric::Cosine,
            HnswParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));

        let index = VectorIndex::build(
            vec![("a".into(), vec![1.0, 0.0])],
            DistanceMetric::Cosine,
            HnswParams::default(),
        )
        .unwrap();
        assert!(index.search(&[1.0, 0.0, 0.0], 1).is_err());
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = VectorIndex::build(vec![], DistanceMetric::Dot, HnswParams::default()).unwrap();
        assert!(index.is_empty());
        assert!(index.search(&[1.0], 5).unwrap().is_empty());
    }
}
