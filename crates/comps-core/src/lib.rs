//! Core domain model for parcel comparables: parcels, scoring configuration and results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "comps-core";

/// A single real-estate record as supplied by the ingestion side.
///
/// Every numeric attribute is optional; absence is a valid state and the
/// scorers map it to neutral values rather than failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    pub id: String,
    /// County (or other provider region) the parcel belongs to.
    pub region_id: String,
    pub address: String,
    pub city: String,
    pub state: String,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub zoning_code: Option<String>,
    /// Square feet.
    #[serde(default)]
    pub building_area: Option<f64>,
    /// Square feet.
    #[serde(default)]
    pub lot_area: Option<f64>,
    #[serde(default)]
    pub year_built: Option<i32>,
    #[serde(default)]
    pub assessed_value: Option<f64>,
    #[serde(default)]
    pub market_value: Option<f64>,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default)]
    pub sale_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub data_source: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub outlier_flags: Vec<String>,
}

impl Parcel {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    /// Case-insensitive; a blank city never matches.
    pub fn same_city(&self, other: &Parcel) -> bool {
        !self.city.trim().is_empty() && self.city.to_lowercase() == other.city.to_lowercase()
    }

    pub fn same_region(&self, other: &Parcel) -> bool {
        !self.region_id.is_empty() && self.region_id == other.region_id
    }

    /// Assessed dollars per square foot of building, when both inputs are usable.
    pub fn assessed_price_per_sqft(&self) -> Option<f64> {
        match (self.assessed_value, self.building_area) {
            (Some(value), Some(area)) if value > 0.0 && area > 0.0 => Some(value / area),
            _ => None,
        }
    }
}

/// One named dimension of similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Location,
    Size,
    Age,
    Zoning,
    Value,
    SalePrice,
}

impl Factor {
    pub const ALL: [Factor; 6] = [
        Factor::Location,
        Factor::Size,
        Factor::Age,
        Factor::Zoning,
        Factor::Value,
        Factor::SalePrice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Factor::Location => "location",
            Factor::Size => "size",
            Factor::Age => "age",
            Factor::Zoning => "zoning",
            Factor::Value => "value",
            Factor::SalePrice => "sale_price",
        }
    }
}

/// Per-factor score breakdown, keyed in declaration order.
pub type FactorScores = BTreeMap<Factor, f64>;

#[derive(Debug, Error, PartialEq)]
pub enum FactorsError {
    #[error("weight for {factor} must be finite and non-negative, got {value}")]
    InvalidWeight { factor: &'static str, value: f64 },
    #[error("factor weights sum to zero")]
    ZeroWeights,
    #[error("{name} must be positive and finite, got {value}")]
    InvalidTolerance { name: &'static str, value: f64 },
}

/// Weights and tolerances used by the deterministic scorer.
///
/// All thresholds live here so the scorers never carry their own constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityFactors {
    pub location_weight: f64,
    pub size_weight: f64,
    pub age_weight: f64,
    pub zoning_weight: f64,
    pub value_weight: f64,
    pub sale_price_weight: f64,
    pub age_tolerance_years: u32,
    /// Fractional tolerance on assessed value (0.3 == within 30%).
    pub value_tolerance: f64,
    /// Fractional tolerance on last sale price.
    pub sale_price_tolerance: f64,
    /// Size ratios below this floor are penalised by half.
    pub size_ratio_floor: f64,
    /// Candidates scoring at or below this are never returned.
    pub min_similarity: f64,
    /// Average comparable distance above this triggers a locality recommendation.
    pub max_distance_miles: f64,
}

impl Default for SimilarityFactors {
    fn default() -> Self {
        Self {
            location_weight: 0.10,
            size_weight: 0.25,
            age_weight: 0.05,
            zoning_weight: 0.05,
            value_weight: 0.20,
            sale_price_weight: 0.35,
            age_tolerance_years: 10,
            value_tolerance: 0.3,
            sale_price_tolerance: 0.3,
            size_ratio_floor: 0.5,
            min_similarity: 0.3,
            max_distance_miles: 10.0,
        }
    }
}

impl SimilarityFactors {
    pub fn weight(&self, factor: Factor) -> f64 {
        match factor {
            Factor::Location => self.location_weight,
            Factor::Size => self.size_weight,
            Factor::Age => self.age_weight,
            Factor::Zoning => self.zoning_weight,
            Factor::Value => self.value_weight,
            Factor::SalePrice => self.sale_price_weight,
        }
    }

    fn weight_mut(&mut self, factor: Factor) -> &mut f64 {
        match factor {
            Factor::Location => &mut self.location_weight,
            Factor::Size => &mut self.size_weight,
            Factor::Age => &mut self.age_weight,
            Factor::Zoning => &mut self.zoning_weight,
            Factor::Value => &mut self.value_weight,
            Factor::SalePrice => &mut self.sale_price_weight,
        }
    }

    pub fn weight_sum(&self) -> f64 {
        Factor::ALL.iter().map(|f| self.weight(*f)).sum()
    }

    /// Validate the configuration and rescale weights so they sum to 1.0.
    ///
    /// Returns the normalised copy together with the original weight sum so
    /// callers can report when rescaling happened.
    pub fn normalized(&self) -> Result<(Self, f64), FactorsError> {
        for factor in Factor::ALL {
            let value = self.weight(factor);
            if !value.is_finite() || value < 0.0 {
                return Err(FactorsError::InvalidWeight {
                    factor: factor.as_str(),
                    value,
                });
            }
        }
        for (name, value) in [
            ("value_tolerance", self.value_tolerance),
            ("sale_price_tolerance", self.sale_price_tolerance),
            ("size_ratio_floor", self.size_ratio_floor),
            ("max_distance_miles", self.max_distance_miles),
            ("age_tolerance_years", f64::from(self.age_tolerance_years)),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(FactorsError::InvalidTolerance { name, value });
            }
        }

        let sum = self.weight_sum();
        if sum <= 0.0 {
            return Err(FactorsError::ZeroWeights);
        }

        let mut out = self.clone();
        if (sum - 1.0).abs() > 1e-9 {
            for factor in Factor::ALL {
                *out.weight_mut(factor) /= sum;
            }
        }
        Ok((out, sum))
    }
}

/// Which path produced a comparable's top-level numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Deterministic,
    Ai,
}

/// A ranked candidate with its explainable breakdown.
///
/// Built fresh for every discovery request and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparableResult {
    pub target_id: String,
    pub parcel: Parcel,
    pub similarity_score: f64,
    pub distance_miles: Option<f64>,
    pub factor_scores: FactorScores,
    pub confidence_score: f64,
    pub source: ScoreSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPosition {
    AboveMarket,
    AtMarket,
    BelowMarket,
    Unknown,
}

impl MarketPosition {
    pub fn label(&self) -> &'static str {
        match self {
            MarketPosition::AboveMarket => "above market",
            MarketPosition::AtMarket => "at market",
            MarketPosition::BelowMarket => "below market",
            MarketPosition::Unknown => "unknown",
        }
    }
}

/// Whole-dollar estimate range for the target parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInsight {
    pub market_position: MarketPosition,
    pub value_range: ValueRange,
    pub market_trends: String,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Full response for one comparable-discovery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparablesReport {
    pub target: Parcel,
    pub comparables: Vec<ComparableResult>,
    pub count: usize,
    pub generated_at: DateTime<Utc>,
    pub market_insight: MarketInsight,
    pub recommendations: Vec<String>,
}
