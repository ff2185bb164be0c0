use std::collections::HashMap;

use uuid::Uuid;

/// A point after rank fusion, before payload hydration.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: Uuid,
    pub score: f32,
    /// Rank in the dense list, used as the tie-breaker. Points seen only by
    /// the sparse retrieval sort after dense-ranked ones on equal score.
    pub dense_rank: Option<usize>,
}

/// Reciprocal Rank Fusion of the two prefetch result lists:
/// `score(p) = sum over lists of 1 / (k + rank)`, rank starting at 1.
pub fn reciprocal_rank_fusion(dense: &[Uuid], sparse: &[Uuid], k: u32) -> Vec<FusedHit> {
    let k = k.max(1) as f32;
    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    let mut dense_ranks: HashMap<Uuid, usize> = HashMap::new();

    for (rank, id) in dense.iter().enumerate() {
        *scores.entry(*id).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
        dense_ranks.entry(*id).or_insert(rank);
    }
    for (rank, id) in sparse.iter().enumerate() {
        *scores.entry(*id).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, score)| FusedHit {
            id,
            score,
            dense_rank: dense_ranks.get(&id).copied(),
        })
        .collect();

    sort_fused(&mut fused);
    fused
}

/// Multiplicative fact-density boost applied to a fused score:
/// `score * (1 + boost * density)`; records without a stored density use
/// 0.5. A non-positive boost leaves the score untouched.
pub fn boosted_score(score: f32, boost: f32, fact_density: Option<f32>) -> f32 {
    if boost <= 0.0 {
        return score;
    }
    let density = fact_density.unwrap_or(0.5).clamp(0.0, 1.0);
    score * (1.0 + boost * density)
}

fn sort_fused(hits: &mut [FusedHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_rank = a.dense_rank.unwrap_or(usize::MAX);
                let b_rank = b.dense_rank.unwrap_or(usize::MAX);
                a_rank.cmp(&b_rank)
            })
    });
}

/// Re-sorts hits after boosting, keeping the dense-rank tie-break.
pub fn resort(hits: &mut [FusedHit]) {
    sort_fused(hits);
}
