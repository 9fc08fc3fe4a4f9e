use comps_core::{ComparableResult, FactorScores, SimilarityFactors};

/// Weighted sum of factor scores. Weights are expected to be normalised.
pub fn weighted_similarity(scores: &FactorScores, factors: &SimilarityFactors) -> f64 {
    scores
        .iter()
        .map(|(factor, score)| score * factors.weight(*factor))
        .sum::<f64>()
        .clamp(0.0, 1.0)
}

/// Drop results at or below the threshold, order best-first and keep the top `max_results`.
///
/// The sort is stable so equal scores keep discovery order.
pub fn rank(
    mut results: Vec<ComparableResult>,
    min_similarity: f64,
    max_results: usize,
) -> Vec<ComparableResult> {
    results.retain(|r| r.similarity_score > min_similarity);
    results.sort_by(|a, b| b.similarity_score.total_cmp(&a.similarity_score));
    results.truncate(max_results);
    results
}
