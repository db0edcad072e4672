use std::cmp::Ordering;

use expenseflow_core::{clamp_unit, FeatureVector, HistoricalOutcome};

const DISTANCE_EPSILON: f64 = 1e-6;

/// k-nearest-neighbour vote over reviewed outcomes. Each neighbour counts 1
/// (confirmed) or 0 (rejected), weighted by inverse distance. Equal distances
/// are broken by outcome id so the vote is reproducible.
///
/// Returns `None` when there is no history to vote with.
pub fn knn_confidence(features: &FeatureVector, history: &[HistoricalOutcome], k: usize) -> Option<f64> {
    if history.is_empty() || k == 0 {
        return None;
    }

    let mut neighbours: Vec<(f64, i64, bool)> = history
        .iter()
        .map(|h| (features.distance(&h.features), h.id, h.confirmed))
        .filter(|(d, _, _)| d.is_finite())
        .collect();
    neighbours.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)));
    neighbours.truncate(k);
    if neighbours.is_empty() {
        return None;
    }

    let (weighted, total) = neighbours.iter().fold((0.0, 0.0), |(acc, sum), (d, _, confirmed)| {
        let w = 1.0 / (d + DISTANCE_EPSILON);
        let label = if *confirmed { 1.0 } else { 0.0 };
        (acc + w * label, sum + w)
    });
    Some(clamp_unit(weighted / total))
}
