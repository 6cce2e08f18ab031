//! Relevance scoring and top-k selection.
//!
//! # Scoring
//!
//! `score(record) = Σ tf_weight(tf(t, record)) × idf(t)` over the distinct
//! query tokens `t` that occur in the record, with
//!
//! - `tf_weight(tf) = 1 + ln(tf)` (strictly increasing in `tf`),
//! - `idf(t) = ln(1 + (N - df + 0.5) / (df + 0.5))` (BM25's idf, always
//!   positive so a common term never subtracts).
//!
//! # Ordering
//!
//! Results are totally ordered by score (desc), `occurred_at` (desc),
//! then id (asc), so pagination over a fixed corpus is stable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub fn tf_weight(tf: u32) -> f64 {
    if tf == 0 {
        0.0
    } else {
        1.0 + (tf as f64).ln()
    }
}

pub fn idf(doc_count: u64, doc_freq: u64) -> f64 {
    // Counters are read without blocking writers and may lag; never let
    // df exceed N.
    let n = doc_count.max(doc_freq) as f64;
    let df = doc_freq as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// A candidate record with its accumulated score.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub id: String,
    pub score: f64,
    pub occurred_at: i64,
}

/// `Less` when `a` ranks ahead of `b`.
pub fn rank_order(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(b.occurred_at.cmp(&a.occurred_at))
        .then_with(|| a.id.cmp(&b.id))
}

struct Ranked(Scored);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        rank_order(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(&self.0, &other.0)
    }
}

/// The best `k` candidates in rank order.
///
/// Keeps a heap of at most `k` entries whose top is the worst one kept,
/// so selection is `O(n log k)` instead of sorting every candidate.
pub fn top_k<I>(candidates: I, k: usize) -> Vec<Scored>
where
    I: IntoIterator<Item = Scored>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(k + 1);
    for cand in candidates {
        if heap.len() < k {
            heap.push(Ranked(cand));
            continue;
        }
        let worse_than_cand = heap
            .peek()
            .map(|worst| rank_order(&cand, &worst.0) == Ordering::Less)
            .unwrap_or(false);
        if worse_than_cand {
            heap.pop();
            heap.push(Ranked(cand));
        }
    }
    heap.into_sorted_vec().into_iter().map(|r| r.0).collect()
}
