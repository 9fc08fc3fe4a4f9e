//! Distance between parcels, for display next to each comparable.

use comps_core::Parcel;

pub const EARTH_RADIUS_MILES: f64 = 3959.0;

pub const SAME_CITY_MILES: f64 = 5.0;
pub const SAME_REGION_MILES: f64 = 25.0;
pub const UNRELATED_MILES: f64 = 100.0;

/// Great-circle distance in miles between two `(lat, lon)` pairs in degrees.
pub fn haversine_miles(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().min(1.0).asin()
}

/// Haversine when both parcels are geocoded, otherwise a locality tier estimate.
pub fn distance_miles(target: &Parcel, candidate: &Parcel) -> f64 {
    match (target.coordinates(), candidate.coordinates()) {
        (Some(a), Some(b)) => haversine_miles(a, b),
        _ if target.same_city(candidate) => SAME_CITY_MILES,
        _ if target.same_region(candidate) => SAME_REGION_MILES,
        _ => UNRELATED_MILES,
    }
}
