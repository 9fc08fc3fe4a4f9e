//! Per-factor similarity scorers. Each returns a value in `[0, 1]`.

use comps_core::{Factor, FactorScores, Parcel, SimilarityFactors};

/// Score used when either side lacks the attribute.
pub const NEUTRAL: f64 = 0.5;

pub const SAME_CITY: f64 = 1.0;
pub const SAME_REGION: f64 = 0.8;
pub const DIFFERENT_REGION: f64 = 0.3;

pub const INDUSTRIAL_ZONES: [&str; 13] = [
    "M1", "M2", "M3", "M-1", "M-2", "M-3", "I1", "I2", "I3", "I-1", "I-2", "I-3", "INDUSTRIAL",
];
const ZONING_KEYWORDS: [&str; 3] = ["INDUSTRIAL", "MANUFACTURING", "WAREHOUSE"];

pub fn location(target: &Parcel, candidate: &Parcel) -> f64 {
    if target.same_city(candidate) {
        SAME_CITY
    } else if target.same_region(candidate) {
        SAME_REGION
    } else {
        DIFFERENT_REGION
    }
}

/// Missing area scores 0.0 rather than neutral: size is the anchor of a comparable.
pub fn size(target: &Parcel, candidate: &Parcel, factors: &SimilarityFactors) -> f64 {
    let (Some(a), Some(b)) = (target.building_area, candidate.building_area) else {
        return 0.0;
    };
    let ratio = smaller_over_larger(a, b);
    if ratio >= factors.size_ratio_floor {
        ratio
    } else {
        ratio * 0.5
    }
}

pub fn age(target: &Parcel, candidate: &Parcel, factors: &SimilarityFactors) -> f64 {
    let (Some(a), Some(b)) = (target.year_built, candidate.year_built) else {
        return NEUTRAL;
    };
    let diff = f64::from(a.abs_diff(b));
    let tol = f64::from(factors.age_tolerance_years);
    if diff <= tol {
        1.0 - (diff / tol) * 0.5
    } else {
        (0.5 - (diff - tol) / (2.0 * tol)).max(0.0)
    }
}

pub fn zoning(target: &Parcel, candidate: &Parcel) -> f64 {
    let (Some(a), Some(b)) = (target.zoning_code.as_deref(), candidate.zoning_code.as_deref())
    else {
        return NEUTRAL;
    };
    let a = a.trim().to_uppercase();
    let b = b.trim().to_uppercase();
    if a.is_empty() || b.is_empty() {
        return NEUTRAL;
    }

    if a == b {
        1.0
    } else if INDUSTRIAL_ZONES.contains(&a.as_str()) && INDUSTRIAL_ZONES.contains(&b.as_str()) {
        0.8
    } else if ZONING_KEYWORDS
        .iter()
        .any(|kw| a.contains(kw) && b.contains(kw))
    {
        0.7
    } else {
        0.3
    }
}

pub fn value(target: &Parcel, candidate: &Parcel, factors: &SimilarityFactors) -> f64 {
    tolerance_ratio(
        target.assessed_value,
        candidate.assessed_value,
        factors.value_tolerance,
    )
}

pub fn sale_price(target: &Parcel, candidate: &Parcel, factors: &SimilarityFactors) -> f64 {
    tolerance_ratio(
        target.sale_price,
        candidate.sale_price,
        factors.sale_price_tolerance,
    )
}

fn tolerance_ratio(a: Option<f64>, b: Option<f64>, tolerance: f64) -> f64 {
    let (Some(a), Some(b)) = (a, b) else {
        return NEUTRAL;
    };
    let ratio = smaller_over_larger(a, b);
    if ratio >= 1.0 - tolerance {
        1.0
    } else {
        ratio
    }
}

fn smaller_over_larger(a: f64, b: f64) -> f64 {
    let (a, b) = (a.max(0.0), b.max(0.0));
    let larger = a.max(b);
    if larger <= 0.0 || !larger.is_finite() {
        return 0.0;
    }
    (a.min(b) / larger).clamp(0.0, 1.0)
}

/// Full per-factor breakdown for one pair.
pub fn score_all(target: &Parcel, candidate: &Parcel, factors: &SimilarityFactors) -> FactorScores {
    Factor::ALL
        .iter()
        .map(|factor| {
            let score = match factor {
                Factor::Location => location(target, candidate),
                Factor::Size => size(target, candidate, factors),
                Factor::Age => age(target, candidate, factors),
                Factor::Zoning => zoning(target, candidate),
                Factor::Value => value(target, candidate, factors),
                Factor::SalePrice => sale_price(target, candidate, factors),
            };
            (*factor, score)
        })
        .collect()
}
