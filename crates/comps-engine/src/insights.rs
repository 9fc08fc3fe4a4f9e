//! Market positioning and next-step recommendations for a set of comparables.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use comps_ai::{
    market_insight_request, parse_market_insight, parse_recommendations, recommendation_request,
    AiError, LanguageModel,
};
use comps_core::{ComparableResult, MarketInsight, MarketPosition, Parcel, ValueRange};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::scorer::AssistError;

pub const MAX_RECOMMENDATIONS: usize = 5;

const ABOVE_MARKET_FACTOR: f64 = 1.1;
const BELOW_MARKET_FACTOR: f64 = 0.9;
const WEAK_SIMILARITY: f64 = 0.6;

#[async_trait]
pub trait MarketAnalyst: Send + Sync {
    fn name(&self) -> &'static str;

    async fn market_insight(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Result<MarketInsight, AssistError>;

    async fn recommendations(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Result<Vec<String>, AssistError>;
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Price-per-square-foot analysis and rule-based recommendations.
#[derive(Debug, Clone)]
pub struct DeterministicAnalyst {
    max_distance_miles: f64,
}

impl DeterministicAnalyst {
    pub fn new(max_distance_miles: f64) -> Self {
        Self { max_distance_miles }
    }

    pub fn insight(&self, target: &Parcel, comparables: &[ComparableResult]) -> MarketInsight {
        if comparables.is_empty() {
            return MarketInsight {
                market_position: MarketPosition::Unknown,
                value_range: ValueRange::default(),
                market_trends: "Insufficient data for analysis".into(),
                key_insights: strings(&["No comparable properties found"]),
                recommendations: strings(&["Expand search criteria"]),
            };
        }

        let psf: Vec<f64> = comparables
            .iter()
            .filter_map(|c| c.parcel.assessed_price_per_sqft())
            .collect();
        if psf.is_empty() {
            return MarketInsight {
                market_position: MarketPosition::Unknown,
                value_range: ValueRange::default(),
                market_trends: "Insufficient valuation data".into(),
                key_insights: strings(&["Comparable properties lack sufficient valuation data"]),
                recommendations: strings(&["Obtain professional appraisal"]),
            };
        }

        let avg = psf.iter().sum::<f64>() / psf.len() as f64;
        let min = psf.iter().copied().fold(f64::INFINITY, f64::min);
        let max = psf.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let market_position = match target.assessed_price_per_sqft() {
            Some(own) if own > avg * ABOVE_MARKET_FACTOR => MarketPosition::AboveMarket,
            Some(own) if own < avg * BELOW_MARKET_FACTOR => MarketPosition::BelowMarket,
            Some(_) => MarketPosition::AtMarket,
            None => MarketPosition::Unknown,
        };
        let value_range = match target.building_area {
            Some(area) if area > 0.0 => ValueRange {
                min: (min * area).trunc() as i64,
                max: (max * area).trunc() as i64,
            },
            _ => ValueRange::default(),
        };

        MarketInsight {
            market_position,
            value_range,
            market_trends: format!("Average price per sq ft: ${avg:.2}"),
            key_insights: vec![
                format!("Property positioned {}", market_position.label()),
                format!("Comparable properties range from ${min:.2} to ${max:.2} per sq ft"),
            ],
            recommendations: strings(&[
                "Consider local market conditions",
                "Review property condition and amenities",
            ]),
        }
    }

    pub fn advise(&self, comparables: &[ComparableResult]) -> Vec<String> {
        if comparables.is_empty() {
            return strings(&[
                "Expand search criteria to find more comparable properties",
                "Consider properties in adjacent markets",
            ]);
        }

        let mut out = Vec::new();
        let avg_similarity =
            comparables.iter().map(|c| c.similarity_score).sum::<f64>() / comparables.len() as f64;
        if avg_similarity < WEAK_SIMILARITY {
            out.push("Consider expanding search radius for better comparables".to_string());
        }

        let distances: Vec<f64> = comparables
            .iter()
            .filter_map(|c| c.distance_miles)
            .filter(|d| *d > 0.0)
            .collect();
        if !distances.is_empty() {
            let avg_distance = distances.iter().sum::<f64>() / distances.len() as f64;
            if avg_distance > self.max_distance_miles {
                out.push(
                    "Consider local market factors due to distance from comparables".to_string(),
                );
            }
        }

        out.extend(strings(&[
            "Review property condition and maintenance requirements",
            "Consider market trends and economic factors",
            "Evaluate potential for property improvements",
        ]));
        out.truncate(MAX_RECOMMENDATIONS);
        out
    }
}

#[async_trait]
impl MarketAnalyst for DeterministicAnalyst {
    fn name(&self) -> &'static str {
        "deterministic"
    }

    async fn market_insight(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Result<MarketInsight, AssistError> {
        Ok(self.insight(target, comparables))
    }

    async fn recommendations(
        &self,
        _target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Result<Vec<String>, AssistError> {
        Ok(self.advise(comparables))
    }
}

pub struct AiAnalyst {
    model: Arc<dyn LanguageModel>,
}

impl AiAnalyst {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl MarketAnalyst for AiAnalyst {
    fn name(&self) -> &'static str {
        "ai"
    }

    async fn market_insight(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Result<MarketInsight, AssistError> {
        let reply = self
            .model
            .complete(&market_insight_request(target, comparables))
            .await?;
        Ok(parse_market_insight(&reply)?)
    }

    async fn recommendations(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
    ) -> Result<Vec<String>, AssistError> {
        let reply = self
            .model
            .complete(&recommendation_request(target, comparables))
            .await?;
        let mut items: Vec<String> = parse_recommendations(&reply)?
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() {
            return Err(AiError::Schema("no recommendations returned".into()).into());
        }
        items.truncate(MAX_RECOMMENDATIONS);
        Ok(items)
    }
}

/// Model-backed analysis with the rule-based analyst behind it.
///
/// An empty comparable set always gets the rule-based answer.
pub struct FallbackAnalyst {
    primary: Option<Box<dyn MarketAnalyst>>,
    fallback: DeterministicAnalyst,
}

impl FallbackAnalyst {
    pub fn deterministic(max_distance_miles: f64) -> Self {
        Self {
            primary: None,
            fallback: DeterministicAnalyst::new(max_distance_miles),
        }
    }

    pub fn with_primary(primary: Box<dyn MarketAnalyst>, max_distance_miles: f64) -> Self {
        Self {
            primary: Some(primary),
            fallback: DeterministicAnalyst::new(max_distance_miles),
        }
    }

    pub async fn market_insight(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
        deadline: Instant,
    ) -> MarketInsight {
        let primary = match &self.primary {
            Some(primary) if !comparables.is_empty() => primary,
            _ => return self.fallback.insight(target, comparables),
        };
        let outcome = before_deadline(deadline, primary.market_insight(target, comparables)).await;
        match outcome {
            Ok(insight) => insight,
            Err(err) => {
                warn!(
                    target_id = %target.id,
                    analyst = primary.name(),
                    error = %err,
                    "falling back to deterministic market analysis"
                );
                self.fallback.insight(target, comparables)
            }
        }
    }

    pub async fn recommendations(
        &self,
        target: &Parcel,
        comparables: &[ComparableResult],
        deadline: Instant,
    ) -> Vec<String> {
        let primary = match &self.primary {
            Some(primary) if !comparables.is_empty() => primary,
            _ => return self.fallback.advise(comparables),
        };
        let outcome = before_deadline(deadline, primary.recommendations(target, comparables)).await;
        match outcome {
            Ok(items) => items,
            Err(err) => {
                warn!(
                    target_id = %target.id,
                    analyst = primary.name(),
                    error = %err,
                    "falling back to deterministic recommendations"
                );
                self.fallback.advise(comparables)
            }
        }
    }
}

/// Run `call` only while time remains; a spent deadline never starts it.
async fn before_deadline<T>(
    deadline: Instant,
    call: impl Future<Output = Result<T, AssistError>>,
) -> Result<T, AssistError> {
    if Instant::now() >= deadline {
        return Err(AssistError::DeadlineExceeded);
    }
    timeout_at(deadline, call)
        .await
        .unwrap_or(Err(AssistError::DeadlineExceeded))
}
