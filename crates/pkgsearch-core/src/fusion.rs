//! Reciprocal Rank Fusion.
//!
//! `fused(id) = Σ 1 / (k0 + rank)` over every list containing `id`, with
//! 1-based ranks. Only positions matter; the lists' native scores (BM25,
//! similarity) are not comparable and are ignored.

use std::collections::HashMap;

use serde::Serialize;

/// Damping constant from Cormack, Clarke and Buettcher (SIGIR 2009).
pub const RRF_K0: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedCandidate {
    pub id: String,
    pub score: f64,
    /// 1-based rank in the lexical list, if present there.
    pub lexical_rank: Option<usize>,
    /// 1-based rank in the vector list, if present there.
    pub vector_rank: Option<usize>,
}

/// Fuse a lexical and a vector ranking, each ordered best first.
///
/// Output is sorted by fused score descending, ties broken by id ascending.
/// A list is assumed not to repeat ids; a repeat keeps its first rank.
pub fn reciprocal_rank_fusion(lexical: &[String], vector: &[String], k0: f64) -> Vec<FusedCandidate> {
    let mut fused: HashMap<&str, FusedCandidate> = HashMap::new();

    for (pos, id) in lexical.iter().enumerate() {
        let entry = fused.entry(id.as_str()).or_insert_with(|| FusedCandidate {
            id: id.clone(),
            score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        if entry.lexical_rank.is_none() {
            entry.lexical_rank = Some(pos + 1);
            entry.score += 1.0 / (k0 + (pos + 1) as f64);
        }
    }

    for (pos, id) in vector.iter().enumerate() {
        let entry = fused.entry(id.as_str()).or_insert_with(|| FusedCandidate {
            id: id.clone(),
            score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        if entry.vector_rank.is_none() {
            entry.vector_rank = Some(pos + 1);
            entry.score += 1.0 / (k0 + (pos + 1) as f64);
        }
    }

    let mut out: Vec<FusedCandidate> = fused.into_values().collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fused_scores_match_formula() {
        let lexical = ids(&["A", "B", "C"]);
        let vector = ids(&["B", "C", "A"]);
        let fused = reciprocal_rank_fusion(&lexical, &vector, RRF_K0);

        let order: Vec<&str> = fused.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);

        let expected_b = 1.0 / 62.0 + 1.0 / 61.0;
        let expected_a = 1.0 / 61.0 + 1.0 / 63.0;
        let expected_c = 1.0 / 63.0 + 1.0 / 62.0;
        assert!((fused[0].score - expected_b).abs() < 1e-12);
        assert!((fused[1].score - expected_a).abs() < 1e-12);
        assert!((fused[2].score - expected_c).abs() < 1e-12);

        assert_eq!(fused[0].lexical_rank, Some(2));
        assert_eq!(fused[0].vector_rank, Some(1));
    }

    #[test]
    fn single_list_members_score_from_one_rank() {
        let fused = reciprocal_rank_fusion(&ids(&["x"]), &ids(&["y"]), RRF_K0);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].score, fused[1].score);
        assert_eq!(fused[0].id, "x");
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[1].lexical_rank, None);
    }

    #[test]
    fn empty_side_preserves_other_order() {
        let lexical = ids(&["c", "a", "b"]);
        let fused = reciprocal_rank_fusion(&lexical, &[], RRF_K0);
        let order: Vec<&str> = fused.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn repeated_id_keeps_first_rank() {
        let fused = reciprocal_rank_fusion(&ids(&["a", "a"]), &[], RRF_K0);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
    }
}
