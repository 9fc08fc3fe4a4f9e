//! Candidate scoring strategies and the per-batch fallback between them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use comps_ai::{candidate_scoring_request, parse_candidate_scores, AiError, LanguageModel};
use comps_core::{ComparableResult, Parcel, ScoreSource, SimilarityFactors};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::{aggregate, confidence, factors, geo};

/// Candidates sent to the language model per request.
pub const BATCH_SIZE: usize = 5;

/// Failure of a model-backed path. Always recovered by the deterministic path.
#[derive(Debug, Error)]
pub enum AssistError {
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

#[async_trait]
pub trait CandidateScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score one batch of candidates against the target, in batch order.
    ///
    /// Candidates the scorer rejects may be omitted from the output.
    async fn score_batch(
        &self,
        target: &Parcel,
        batch: &[Parcel],
    ) -> Result<Vec<ComparableResult>, AssistError>;
}

/// Weighted-formula scorer. Never fails.
#[derive(Debug, Clone)]
pub struct DeterministicScorer {
    factors: SimilarityFactors,
}

impl DeterministicScorer {
    pub fn new(factors: SimilarityFactors) -> Self {
        Self { factors }
    }

    pub fn score(&self, target: &Parcel, candidate: &Parcel) -> ComparableResult {
        let factor_scores = factors::score_all(target, candidate, &self.factors);
        ComparableResult {
            target_id: target.id.clone(),
            parcel: candidate.clone(),
            similarity_score: aggregate::weighted_similarity(&factor_scores, &self.factors),
            distance_miles: Some(geo::distance_miles(target, candidate)),
            factor_scores,
            confidence_score: confidence::confidence(target, candidate),
            source: ScoreSource::Deterministic,
            reasoning: None,
        }
    }

    pub fn score_all(&self, target: &Parcel, batch: &[Parcel]) -> Vec<ComparableResult> {
        batch.iter().map(|c| self.score(target, c)).collect()
    }
}

#[async_trait]
impl CandidateScorer for DeterministicScorer {
    fn name(&self) -> &'static str {
        "deterministic"
    }

    async fn score_batch(
        &self,
        target: &Parcel,
        batch: &[Parcel],
    ) -> Result<Vec<ComparableResult>, AssistError> {
        Ok(self.score_all(target, batch))
    }
}

/// Language-model scorer. Similarity and confidence come from the model;
/// the factor breakdown and distance are still computed locally.
pub struct AiScorer {
    model: Arc<dyn LanguageModel>,
    factors: SimilarityFactors,
}

impl AiScorer {
    pub fn new(model: Arc<dyn LanguageModel>, factors: SimilarityFactors) -> Self {
        Self { model, factors }
    }
}

#[async_trait]
impl CandidateScorer for AiScorer {
    fn name(&self) -> &'static str {
        "ai"
    }

    async fn score_batch(
        &self,
        target: &Parcel,
        batch: &[Parcel],
    ) -> Result<Vec<ComparableResult>, AssistError> {
        let request = candidate_scoring_request(target, batch, self.factors.min_similarity);
        let reply = self.model.complete(&request).await?;
        let scores = parse_candidate_scores(&reply)?;

        let mut by_id = HashMap::new();
        for score in scores {
            by_id.entry(score.id.clone()).or_insert(score);
        }

        let mut out = Vec::new();
        for candidate in batch {
            let Some(score) = by_id.remove(&candidate.id) else {
                continue;
            };
            if score.similarity_score <= self.factors.min_similarity {
                continue;
            }
            out.push(ComparableResult {
                target_id: target.id.clone(),
                parcel: candidate.clone(),
                similarity_score: score.similarity_score,
                distance_miles: Some(geo::distance_miles(target, candidate)),
                factor_scores: factors::score_all(target, candidate, &self.factors),
                confidence_score: score.confidence_score,
                source: ScoreSource::Ai,
                reasoning: Some(score.reasoning),
            });
        }
        if !by_id.is_empty() {
            debug!(ignored = by_id.len(), "model returned ids outside the batch");
        }
        Ok(out)
    }
}

/// Tries the primary scorer per batch and falls back to the formula on any failure.
pub struct FallbackScorer {
    primary: Option<Box<dyn CandidateScorer>>,
    fallback: DeterministicScorer,
}

impl FallbackScorer {
    pub fn deterministic(factors: SimilarityFactors) -> Self {
        Self {
            primary: None,
            fallback: DeterministicScorer::new(factors),
        }
    }

    pub fn with_primary(primary: Box<dyn CandidateScorer>, factors: SimilarityFactors) -> Self {
        Self {
            primary: Some(primary),
            fallback: DeterministicScorer::new(factors),
        }
    }

    pub fn primary_name(&self) -> &'static str {
        self.primary
            .as_ref()
            .map(|p| p.name())
            .unwrap_or_else(|| self.fallback.name())
    }

    /// Score a batch, bounding the primary attempt by `deadline`.
    pub async fn score(
        &self,
        target: &Parcel,
        batch: &[Parcel],
        deadline: Instant,
    ) -> Vec<ComparableResult> {
        let Some(primary) = &self.primary else {
            return self.fallback.score_all(target, batch);
        };

        let outcome = if Instant::now() >= deadline {
            Err(AssistError::DeadlineExceeded)
        } else {
            timeout_at(deadline, primary.score_batch(target, batch))
                .await
                .unwrap_or(Err(AssistError::DeadlineExceeded))
        };

        match outcome {
            Ok(results) => {
                debug!(
                    scorer = primary.name(),
                    batch = batch.len(),
                    kept = results.len(),
                    "scored batch"
                );
                results
            }
            Err(err) => {
                warn!(
                    target_id = %target.id,
                    scorer = primary.name(),
                    batch = batch.len(),
                    error = %err,
                    "falling back to deterministic scoring"
                );
                self.fallback.score_all(target, batch)
            }
        }
    }
}
