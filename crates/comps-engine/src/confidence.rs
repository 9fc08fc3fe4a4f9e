use comps_core::Parcel;

/// Quality assumed for parcels the ingestion side never scored.
pub const DEFAULT_QUALITY: f64 = 0.5;

const COMPLETENESS_WEIGHT: f64 = 0.6;
const QUALITY_WEIGHT: f64 = 0.4;

/// Fraction of the eleven essential and optional attributes that are populated.
pub fn completeness(parcel: &Parcel) -> f64 {
    let text = |s: &str| !s.trim().is_empty();
    let fields = [
        text(&parcel.address),
        text(&parcel.city),
        text(&parcel.state),
        parcel.building_area.is_some(),
        parcel.zoning_code.as_deref().is_some_and(text),
        text(&parcel.region_id),
        parcel.year_built.is_some(),
        parcel.assessed_value.is_some(),
        parcel.latitude.is_some(),
        parcel.longitude.is_some(),
        parcel.lot_area.is_some(),
    ];
    let populated = fields.iter().filter(|f| **f).count();
    populated as f64 / fields.len() as f64
}

pub fn confidence(target: &Parcel, candidate: &Parcel) -> f64 {
    let completeness = (completeness(target) + completeness(candidate)) / 2.0;
    let quality = (target.quality_score.unwrap_or(DEFAULT_QUALITY)
        + candidate.quality_score.unwrap_or(DEFAULT_QUALITY))
        / 2.0;
    (COMPLETENESS_WEIGHT * completeness + QUALITY_WEIGHT * quality).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{empty_parcel, mk_parcel};

    fn complete(id: &str) -> Parcel {
        let mut p = mk_parcel(id);
        p.year_built = Some(1990);
        p.assessed_value = Some(1_000_000.0);
        p.latitude = Some(41.88);
        p.longitude = Some(-87.63);
        p.lot_area = Some(80_000.0);
        p.quality_score = Some(1.0);
        p
    }

    #[test]
    fn complete_pair_with_perfect_quality_is_fully_confident() {
        let a = complete("a");
        let b = complete("b");
        assert_eq!(completeness(&a), 1.0);
        assert!((confidence(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_pair_without_quality_scores_only_counts_default_quality() {
        let a = empty_parcel("a");
        let b = empty_parcel("b");
        assert_eq!(completeness(&a), 0.0);
        assert!((confidence(&a, &b) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn partial_parcel_counts_populated_fields() {
        let p = mk_parcel("p");
        // address, city, state, area, zoning, region
        assert!((completeness(&p) - 6.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn out_of_range_quality_is_clamped() {
        let mut a = complete("a");
        let mut b = complete("b");
        a.quality_score = Some(3.0);
        b.quality_score = Some(3.0);
        assert_eq!(confidence(&a, &b), 1.0);
    }
}
