//! Reciprocal Rank Fusion (RRF).
//!
//! Merges any number of ranked lists into one. A hit at 0-based rank `r`
//! contributes `weight / (k + r + 1)` to its document's score, whatever its
//! raw backend score; contributions for the same document are summed.
//!
//! Ties keep the order in which documents were first encountered, lists being
//! visited in the order given.

use crate::types::{DocumentPayload, FusedResult, HitSource, RankedHit};
use std::collections::HashMap;

/// One ranked list and the weight of its contribution.
#[derive(Debug, Clone, Copy)]
pub struct WeightedList<'a> {
    pub hits: &'a [RankedHit],
    pub weight: f32,
}

impl<'a> WeightedList<'a> {
    pub fn new(hits: &'a [RankedHit], weight: f32) -> Self {
        Self { hits, weight }
    }
}

/// Contribution of a hit at 0-based `rank`.
pub fn rrf_contribution(weight: f32, k: u32, rank: usize) -> f64 {
    weight as f64 / (k as f64 + rank as f64 + 1.0)
}

/// Fuse a dense and a sparse list.
///
/// Documents present in only one list receive only that list's term.
/// Documents known only from the sparse list take their display fields from
/// the sparse payload.
pub fn fuse(
    dense: &[RankedHit],
    sparse: &[RankedHit],
    dense_weight: f32,
    sparse_weight: f32,
    k: u32,
    limit: usize,
) -> Vec<FusedResult> {
    fuse_lists(
        &[
            WeightedList::new(dense, dense_weight),
            WeightedList::new(sparse, sparse_weight),
        ],
        k,
        limit,
    )
}

struct Accumulator {
    document_id: String,
    dense_score: f32,
    sparse_score: f32,
    fused: f64,
    payload: DocumentPayload,
}

/// Fuse any number of weighted lists, truncating to `limit`.
pub fn fuse_lists(lists: &[WeightedList<'_>], k: u32, limit: usize) -> Vec<FusedResult> {
    let mut order: Vec<Accumulator> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for list in lists {
        for (rank, hit) in list.hits.iter().enumerate() {
            let contribution = rrf_contribution(list.weight, k, rank);
            let idx = *positions.entry(hit.document_id.as_str()).or_insert_with(|| {
                order.push(Accumulator {
                    document_id: hit.document_id.clone(),
                    dense_score: 0.0,
                    sparse_score: 0.0,
                    fused: 0.0,
                    payload: hit.payload.clone(),
                });
                order.len() - 1
            });

            let entry = &mut order[idx];
            entry.fused += contribution;
            match hit.source {
                HitSource::Dense => entry.dense_score = entry.dense_score.max(hit.score),
                HitSource::Sparse => entry.sparse_score = entry.sparse_score.max(hit.score),
            }
            if entry.payload == DocumentPayload::default() {
                entry.payload = hit.payload.clone();
            }
        }
    }

    // Vec::sort_by is stable, so equal scores keep first-encounter order.
    order.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(limit);

    order
        .into_iter()
        .map(|acc| FusedResult {
            document_id: acc.document_id,
            dense_score: acc.dense_score,
            sparse_score: acc.sparse_score,
            fused_score: acc.fused as f32,
            payload: acc.payload,
        })
        .collect()
}
