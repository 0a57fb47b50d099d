//! Candidate ranking for inference.
//!
//! Pure and deterministic: the same scores always give the same order, and
//! candidates with equal scores keep their input order.

use std::cmp::Ordering;

/// Clamp a predictor score into `[0, 1]`; NaN counts as no similarity
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Element-wise `candidate - request`
pub fn difference(candidate: &[f64], request: &[f64]) -> Vec<f64> {
    candidate
        .iter()
        .zip(request)
        .map(|(c, r)| c - r)
        .collect()
}

/// Indices of the best `max_count` scores, highest first
pub fn rank_indices(scores: &[f64], max_count: usize) -> Vec<usize> {
    let clamped: Vec<f64> = scores.iter().copied().map(clamp_score).collect();

    let mut order: Vec<usize> = (0..clamped.len()).collect();
    // Stable sort: ties keep input order
    order.sort_by(|&a, &b| {
        clamped[b]
            .partial_cmp(&clamped[a])
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(max_count);
    order
}

/// The ids of the best `max_count` candidates, highest score first
///
/// `ids` and `scores` are parallel; extra entries on either side are ignored.
pub fn rank<T: Clone>(ids: &[T], scores: &[f64], max_count: usize) -> Vec<T> {
    let len = ids.len().min(scores.len());
    rank_indices(&scores[..len], max_count)
        .into_iter()
        .map(|index| ids[index].clone())
        .collect()
}
