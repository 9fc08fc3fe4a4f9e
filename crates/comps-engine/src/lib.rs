//! Comparable discovery: candidate retrieval, scoring with per-batch fallback,
//! ranking and market analysis.

pub mod aggregate;
pub mod confidence;
pub mod factors;
pub mod geo;
pub mod insights;
pub mod scorer;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use comps_ai::{AiConfig, LanguageModel, OpenAiClient};
use comps_core::{
    ComparableResult, ComparablesReport, FactorsError, MarketInsight, Parcel, SimilarityFactors,
};
use comps_storage::{CandidatePolicy, ParcelStore, StoreError};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};

pub use insights::{AiAnalyst, DeterministicAnalyst, FallbackAnalyst, MarketAnalyst};
pub use scorer::{AiScorer, AssistError, CandidateScorer, DeterministicScorer, FallbackScorer};

pub const CRATE_NAME: &str = "comps-engine";

pub const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub factors: SimilarityFactors,
    pub candidate_policy: CandidatePolicy,
    /// Bound on one whole discovery request, store query included.
    pub request_timeout: Duration,
    pub max_results: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            factors: SimilarityFactors::default(),
            candidate_policy: CandidatePolicy::default(),
            request_timeout: Duration::from_secs(30),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let factors = match std::env::var("COMPS_SCORING_FILE") {
            Ok(path) if !path.trim().is_empty() => load_similarity_factors(path)?,
            _ => SimilarityFactors::default(),
        };
        Ok(Self {
            factors,
            request_timeout: Duration::from_secs(
                std::env::var("COMPS_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            ..Self::default()
        })
    }
}

/// Read weights and tolerances from YAML. Omitted keys keep their defaults.
pub fn load_similarity_factors(path: impl AsRef<Path>) -> anyhow::Result<SimilarityFactors> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading scoring file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing scoring file {}", path.display()))
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parcel store failed: {0}")]
    Store(#[from] StoreError),
    #[error("parcel store did not answer within {0:?}")]
    StoreTimeout(Duration),
    #[error("invalid scoring configuration: {0}")]
    InvalidFactors(#[from] FactorsError),
}

pub struct ComparableEngine {
    store: Arc<dyn ParcelStore>,
    scorer: FallbackScorer,
    analyst: FallbackAnalyst,
    config: EngineConfig,
}

impl ComparableEngine {
    /// Build a formula-only engine. Weights are rescaled to sum to 1.0 when needed.
    pub fn new(store: Arc<dyn ParcelStore>, mut config: EngineConfig) -> Result<Self, EngineError> {
        let (factors, original_sum) = config.factors.normalized()?;
        if (original_sum - 1.0).abs() > 1e-9 {
            warn!(original_sum, "factor weights did not sum to 1.0; rescaled");
        }
        config.factors = factors;
        Ok(Self {
            store,
            scorer: FallbackScorer::deterministic(config.factors.clone()),
            analyst: FallbackAnalyst::deterministic(config.factors.max_distance_miles),
            config,
        })
    }

    /// Route scoring and analysis through `model`, keeping the formula as fallback.
    pub fn with_language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        let factors = self.config.factors.clone();
        self.scorer = FallbackScorer::with_primary(
            Box::new(AiScorer::new(model.clone(), factors.clone())),
            factors.clone(),
        );
        self.analyst =
            FallbackAnalyst::with_primary(Box::new(AiAnalyst::new(model)), factors.max_distance_miles);
        self
    }

    /// Engine configured from the environment; model-assisted only when a credential is set.
    pub fn from_env(store: Arc<dyn ParcelStore>) -> anyhow::Result<Self> {
        let engine = Self::new(store, EngineConfig::from_env()?)?;
        match AiConfig::from_env() {
            Some(ai) => {
                let client = OpenAiClient::new(ai).context("building language model client")?;
                info!(model = client.model(), "language model scoring enabled");
                Ok(engine.with_language_model(Arc::new(client)))
            }
            None => {
                info!("no model credential configured; using deterministic scoring");
                Ok(engine)
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.request_timeout
    }

    /// Rank the best comparables for `target`, at most `max_results`.
    pub async fn find_comparables(
        &self,
        target: &Parcel,
        max_results: usize,
    ) -> Result<Vec<ComparableResult>, EngineError> {
        self.find_comparables_until(target, max_results, self.deadline())
            .await
    }

    async fn find_comparables_until(
        &self,
        target: &Parcel,
        max_results: usize,
        deadline: Instant,
    ) -> Result<Vec<ComparableResult>, EngineError> {
        let span = info_span!(
            "find_comparables",
            target_id = %target.id,
            scorer = self.scorer.primary_name()
        );
        self.rank_candidates(target, max_results, deadline)
            .instrument(span)
            .await
    }

    async fn rank_candidates(
        &self,
        target: &Parcel,
        max_results: usize,
        deadline: Instant,
    ) -> Result<Vec<ComparableResult>, EngineError> {
        let candidates = timeout_at(
            deadline,
            self.store
                .get_candidates(target, &self.config.candidate_policy),
        )
        .await
        .map_err(|_| EngineError::StoreTimeout(self.config.request_timeout))??;

        if candidates.is_empty() {
            warn!("no candidate parcels found");
            return Ok(Vec::new());
        }

        let mut scored = Vec::with_capacity(candidates.len());
        for batch in candidates.chunks(scorer::BATCH_SIZE) {
            scored.extend(self.scorer.score(target, batch, deadline).await);
        }

        let results = aggregate::rank(scored, self.config.factors.min_similarity, max_results);
        info!(
            candidates = candidates.len(),
            returned = results.len(),
            "comparables ranked"
        );
        Ok(results)
    }

    pub async fn generate_market_insights(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> MarketInsight {
        self.analyst
            .market_insight(target, comparables, self.deadline())
            .await
    }

    pub async fn generate_recommendations(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Vec<String> {
        self.analyst
            .recommendations(target, comparables, self.deadline())
            .await
    }

    /// Comparables plus market analysis for one target, under a single deadline.
    pub async fn analyze(
        &self,
        target: &Parcel,
        max_results: usize,
    ) -> Result<ComparablesReport, EngineError> {
        let deadline = self.deadline();
        let comparables = self
            .find_comparables_until(target, max_results, deadline)
            .await?;
        let market_insight = self
            .analyst
            .market_insight(target, &comparables, deadline)
            .await;
        let recommendations = self
            .analyst
            .recommendations(target, &comparables, deadline)
            .await;

        Ok(ComparablesReport {
            target: target.clone(),
            count: comparables.len(),
            comparables,
            generated_at: Utc::now(),
            market_insight,
            recommendations,
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use comps_ai::{AiError, ChatRequest, LanguageModel};
    use comps_core::Parcel;

    /// Chicago, cook county, M-1, 50k sq ft; everything else absent.
    pub fn mk_parcel(id: &str) -> Parcel {
        Parcel {
            id: id.to_string(),
            region_id: "cook".into(),
            address: format!("{id} Industrial Way"),
            city: "Chicago".into(),
            state: "IL".into(),
            zip_code: None,
            property_type: None,
            zoning_code: Some("M-1".into()),
            building_area: Some(50_000.0),
            lot_area: None,
            year_built: None,
            assessed_value: None,
            market_value: None,
            sale_price: None,
            sale_date: None,
            latitude: None,
            longitude: None,
            data_source: "test".into(),
            last_updated: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
            quality_score: None,
            is_verified: false,
            outlier_flags: vec![],
        }
    }

    pub fn empty_parcel(id: &str) -> Parcel {
        Parcel {
            region_id: String::new(),
            address: String::new(),
            city: String::new(),
            state: String::new(),
            zoning_code: None,
            building_area: None,
            ..mk_parcel(id)
        }
    }

    /// Replays canned replies in order; errors once they run out.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, AiError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<String, AiError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AiError::EmptyResponse))
        }
    }

    pub struct FailingModel;

    #[async_trait]
    impl LanguageModel for FailingModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, AiError> {
            Err(AiError::HttpStatus {
                status: 503,
                body: "upstream unavailable".into(),
            })
        }
    }
}
