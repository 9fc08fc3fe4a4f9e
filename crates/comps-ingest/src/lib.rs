//! Fixture-first ingestion of provider parcel responses into the parcel store.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use comps_core::Parcel;
use comps_storage::{ParcelStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "comps-ingest";

pub const DATA_SOURCE: &str = "attom";
pub const NATIONAL_REGION: &str = "national";

/// Parcels at or below this building area are not industrial comparables.
pub const MIN_BUILDING_AREA: f64 = 1000.0;
const MAX_BUILDING_AREA: f64 = 10_000_000.0;
const MAX_MONEY: f64 = 1_000_000_000.0;
const MIN_YEAR_BUILT: i32 = 1800;

/// A saved provider response plus capture metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBundle {
    pub bundle_id: String,
    pub provider: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub response: JsonValue,
}

pub fn load_provider_bundle(path: impl AsRef<Path>) -> Result<ProviderBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bundle {0} has no property array")]
    MissingProperties(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub parcel_id: String,
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub bundle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub found: usize,
    pub normalized: usize,
    pub skipped: usize,
    pub rejected: Vec<Rejection>,
    pub saved: usize,
}

/// Accept numbers or numeric strings with thousands separators and `$`.
pub fn safe_f64(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',' && *c != '$').collect();
            let cleaned = cleaned.trim();
            if cleaned.is_empty() {
                None
            } else {
                cleaned.parse().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub fn safe_i32(value: &JsonValue) -> Option<i32> {
    safe_f64(value)
        .filter(|v| v.abs() < f64::from(i32::MAX))
        .map(|v| v.trunc() as i32)
}

fn first_positive(record: &JsonValue, pointers: &[&str]) -> Option<f64> {
    pointers
        .iter()
        .filter_map(|p| record.pointer(p).and_then(safe_f64))
        .find(|v| *v > 0.0)
}

fn text_at(record: &JsonValue, pointer: &str) -> String {
    match record.pointer(pointer) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// County identifier for a ZIP (ZIP+4 accepted).
pub fn region_for_zip(zip: &str) -> &'static str {
    let five = zip.split('-').next().unwrap_or("").trim();
    if five.len() != 5 || !five.chars().all(|c| c.is_ascii_digit()) {
        return NATIONAL_REGION;
    }
    match &five[..3] {
        "606" => "cook",
        "752" => "dallas",
        "900" => "los_angeles",
        _ => NATIONAL_REGION,
    }
}

/// Map a free-text zoning value onto the canonical industrial codes.
pub fn classify_zoning(raw: &str) -> String {
    fn has_any(z: &str, codes: &[&str]) -> bool {
        codes.iter().any(|c| z.contains(c))
    }

    let z = raw.trim().to_uppercase();
    if has_any(&z, &["M-1", "M1"]) {
        "M-1".into()
    } else if has_any(&z, &["M-2", "M2"]) {
        "M-2".into()
    } else if has_any(&z, &["M-3", "M3"]) {
        "M-3".into()
    } else if has_any(&z, &["I-1", "I1"]) {
        "I-1".into()
    } else if has_any(&z, &["I-2", "I2"]) {
        "I-2".into()
    } else if has_any(&z, &["I-3", "I3"]) {
        "I-3".into()
    } else if z.contains("MANUFACTURING") {
        "MANUFACTURING".into()
    } else if z.contains("WAREHOUSE") {
        "WAREHOUSE".into()
    } else if z.contains("DISTRIBUTION") {
        "DISTRIBUTION".into()
    } else if z.contains("LIGHT") && z.contains("INDUSTRIAL") {
        "I-1".into()
    } else if z.contains("HEAVY") && z.contains("INDUSTRIAL") {
        "I-2".into()
    } else if z.contains("INDUSTRIAL") {
        "INDUSTRIAL".into()
    } else {
        z.chars().take(20).collect()
    }
}

const ZONING_POINTERS: [&str; 7] = [
    "/lot/zoning",
    "/address/zoning",
    "/summary/zoning",
    "/zoning",
    "/lot/zoningDescription",
    "/summary/zoningCode",
    "/summary/zoningDescription",
];

/// Zoning from explicit fields, then the provider's property indicator.
pub fn extract_zoning(record: &JsonValue) -> Option<String> {
    if let Some(raw) = ZONING_POINTERS
        .iter()
        .map(|p| text_at(record, p))
        .find(|s| !s.is_empty())
    {
        return Some(classify_zoning(&raw));
    }

    match text_at(record, "/summary/propIndicator").as_str() {
        "50" => Some("M-1".into()),
        "51" => Some("M-2".into()),
        "52" => Some("I-1".into()),
        "53" => Some("I-2".into()),
        _ if text_at(record, "/address/oneLine")
            .to_uppercase()
            .contains("INDUSTRIAL") =>
        {
            Some("INDUSTRIAL".into())
        }
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Turn one provider record into a parcel. `None` when the record is not a
/// usable comparable (no address, city or meaningful building area).
pub fn normalize_record(record: &JsonValue, fetched_at: DateTime<Utc>) -> Option<Parcel> {
    let address = text_at(record, "/address/oneLine");
    let city = text_at(record, "/address/locality");
    let building_area = first_positive(
        record,
        &[
            "/building/size/universalsize",
            "/building/size/bldgsize",
            "/building/size/grosssize",
        ],
    );
    if address.is_empty() || city.is_empty() {
        return None;
    }
    if !building_area.is_some_and(|a| a > MIN_BUILDING_AREA) {
        return None;
    }

    let attom_id = text_at(record, "/identifier/attomId");
    let zip = text_at(record, "/address/postal1");

    let mut assessed_value = first_positive(
        record,
        &[
            "/assessment/assessed/assdTtlValue",
            "/assessment/assessed/assdLndValue",
            "/assessment/assessed/assdImpValue",
        ],
    );
    let mut market_value = first_positive(
        record,
        &[
            "/assessment/market/mktTtlValue",
            "/assessment/market/mktLndValue",
            "/assessment/market/mktImpValue",
        ],
    );
    if assessed_value.is_none() && market_value.is_none() {
        assessed_value = first_positive(record, &["/summary/assessedValue"]);
        market_value = first_positive(record, &["/summary/marketValue"]);
    }

    Some(Parcel {
        id: if attom_id.is_empty() {
            String::new()
        } else {
            format!("attom_{attom_id}")
        },
        region_id: region_for_zip(&zip).to_string(),
        address,
        city,
        state: text_at(record, "/address/countrySubd"),
        zip_code: (!zip.is_empty()).then_some(zip),
        property_type: Some("industrial".into()),
        zoning_code: extract_zoning(record),
        building_area,
        lot_area: first_positive(record, &["/lot/lotsize2", "/lot/lotsize1"]),
        year_built: record.pointer("/summary/yearbuilt").and_then(safe_i32),
        assessed_value,
        market_value,
        sale_price: first_positive(record, &["/assessment/sale/amount"]),
        sale_date: parse_date(&text_at(record, "/assessment/sale/saleTransDate")),
        latitude: record.pointer("/location/latitude").and_then(safe_f64),
        longitude: record.pointer("/location/longitude").and_then(safe_f64),
        data_source: DATA_SOURCE.to_string(),
        last_updated: fetched_at,
        quality_score: None,
        is_verified: true,
        outlier_flags: Vec::new(),
    })
}

pub fn validate_parcel(parcel: &Parcel, current_year: i32) -> Result<(), ValidationError> {
    for (field, value) in [
        ("id", &parcel.id),
        ("address", &parcel.address),
        ("city", &parcel.city),
        ("state", &parcel.state),
        ("data_source", &parcel.data_source),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field));
        }
    }

    if let Some(area) = parcel.building_area {
        if area <= 0.0 || area > MAX_BUILDING_AREA {
            return Err(ValidationError::OutOfRange {
                field: "building_area",
                value: area,
            });
        }
    }
    if let Some(year) = parcel.year_built {
        if !(MIN_YEAR_BUILT..=current_year).contains(&year) {
            return Err(ValidationError::OutOfRange {
                field: "year_built",
                value: f64::from(year),
            });
        }
    }
    for (field, value) in [
        ("assessed_value", parcel.assessed_value),
        ("market_value", parcel.market_value),
        ("sale_price", parcel.sale_price),
    ] {
        if let Some(value) = value {
            if value <= 0.0 || value > MAX_MONEY {
                return Err(ValidationError::OutOfRange { field, value });
            }
        }
    }
    Ok(())
}

/// Completeness of the key attributes plus two plausibility checks, in `[0, 1]`.
pub fn quality_score(parcel: &Parcel, current_year: i32) -> f64 {
    let text = |s: &str| !s.trim().is_empty();
    let important = [
        text(&parcel.address),
        text(&parcel.city),
        text(&parcel.state),
        parcel.building_area.is_some(),
        parcel.assessed_value.is_some(),
        parcel.zoning_code.as_deref().is_some_and(text),
    ];
    let mut score = important.iter().filter(|f| **f).count() as f64;
    if parcel.building_area.is_some_and(|a| a > 0.0) {
        score += 0.2;
    }
    if parcel
        .year_built
        .is_some_and(|y| (MIN_YEAR_BUILT..=current_year).contains(&y))
    {
        score += 0.2;
    }
    (score / (important.len() + 2) as f64).min(1.0)
}

pub fn outlier_flags(parcel: &Parcel) -> Vec<String> {
    let mut flags = Vec::new();
    if let Some(area) = parcel.building_area {
        if area > 1_000_000.0 {
            flags.push("Building area unusually large".to_string());
        } else if area < 500.0 {
            flags.push("Building area unusually small".to_string());
        }
    }
    if let Some(value) = parcel.assessed_value {
        if value > 50_000_000.0 {
            flags.push("Assessed value unusually high".to_string());
        } else if value < 10_000.0 {
            flags.push("Assessed value unusually low".to_string());
        }
    }
    flags
}

/// Output of normalising one bundle, before anything is written.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub found: usize,
    pub skipped: usize,
    pub parcels: Vec<Parcel>,
    pub rejected: Vec<Rejection>,
}

pub fn normalize_bundle(
    bundle: &ProviderBundle,
    current_year: i32,
) -> Result<NormalizedBatch, IngestError> {
    let records = bundle
        .response
        .get("property")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| IngestError::MissingProperties(bundle.bundle_id.clone()))?;

    let mut batch = NormalizedBatch {
        found: records.len(),
        ..NormalizedBatch::default()
    };
    for record in records {
        let Some(mut parcel) = normalize_record(record, bundle.fetched_at) else {
            batch.skipped += 1;
            continue;
        };
        if let Err(err) = validate_parcel(&parcel, current_year) {
            warn!(parcel_id = %parcel.id, address = %parcel.address, error = %err, "rejected parcel");
            batch.rejected.push(Rejection {
                parcel_id: parcel.id,
                address: parcel.address,
                reason: err.to_string(),
            });
            continue;
        }
        parcel.quality_score = Some(quality_score(&parcel, current_year));
        parcel.outlier_flags = outlier_flags(&parcel);
        batch.parcels.push(parcel);
    }
    Ok(batch)
}

pub struct IngestPipeline {
    store: Arc<dyn ParcelStore>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn ParcelStore>) -> Self {
        Self { store }
    }

    pub async fn run_bundle(&self, bundle: &ProviderBundle) -> Result<IngestSummary, IngestError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let batch = normalize_bundle(bundle, started_at.year())?;
        let normalized = batch.parcels.len() + batch.rejected.len();

        let saved = if batch.parcels.is_empty() {
            0
        } else {
            self.store.upsert_parcels(&batch.parcels).await?
        };

        let summary = IngestSummary {
            run_id,
            bundle_id: bundle.bundle_id.clone(),
            started_at,
            finished_at: Utc::now(),
            found: batch.found,
            normalized,
            skipped: batch.skipped,
            rejected: batch.rejected,
            saved,
        };
        info!(
            %run_id,
            bundle_id = %summary.bundle_id,
            found = summary.found,
            saved = summary.saved,
            rejected = summary.rejected.len(),
            "ingest run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comps_storage::InMemoryParcelStore;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn sample_bundle() -> ProviderBundle {
        load_provider_bundle(
            workspace_root()
                .join("fixtures")
                .join("attom")
                .join("sample")
                .join("bundle.json"),
        )
        .unwrap()
    }

    #[test]
    fn parses_formatted_numbers() {
        assert_eq!(safe_f64(&json!("$1,850,000")), Some(1_850_000.0));
        assert_eq!(safe_f64(&json!(42)), Some(42.0));
        assert_eq!(safe_f64(&json!("")), None);
        assert_eq!(safe_f64(&json!("n/a")), None);
        assert_eq!(safe_f64(&JsonValue::Null), None);
        assert_eq!(safe_i32(&json!("1985")), Some(1985));
    }

    #[test]
    fn maps_zip_to_region() {
        assert_eq!(region_for_zip("60608"), "cook");
        assert_eq!(region_for_zip("60609-4411"), "cook");
        assert_eq!(region_for_zip("75207"), "dallas");
        assert_eq!(region_for_zip("90021"), "los_angeles");
        assert_eq!(region_for_zip("10001"), NATIONAL_REGION);
        assert_eq!(region_for_zip(""), NATIONAL_REGION);
    }

    #[test]
    fn classifies_zoning_text() {
        assert_eq!(classify_zoning("PMD-M2"), "M-2");
        assert_eq!(classify_zoning("m1"), "M-1");
        assert_eq!(classify_zoning("Light Industrial"), "I-1");
        assert_eq!(classify_zoning("HEAVY INDUSTRIAL"), "I-2");
        assert_eq!(classify_zoning("IM WAREHOUSE"), "WAREHOUSE");
        assert_eq!(classify_zoning("PLANNED DEVELOPMENT DISTRICT 77"), "PLANNED DEVELOPMENT ");
    }

    #[test]
    fn zoning_falls_back_to_property_indicator() {
        let record = json!({ "summary": { "propIndicator": "52" } });
        assert_eq!(extract_zoning(&record).as_deref(), Some("I-1"));
        let bare = json!({ "address": { "oneLine": "1 MAIN ST" } });
        assert_eq!(extract_zoning(&bare), None);
    }

    #[test]
    fn normalizes_the_sample_bundle() {
        let batch = normalize_bundle(&sample_bundle(), 2026).unwrap();
        assert_eq!(batch.found, 7);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.rejected.len(), 2);
        assert_eq!(batch.parcels.len(), 4);

        let halsted = &batch.parcels[0];
        assert_eq!(halsted.id, "attom_1001");
        assert_eq!(halsted.region_id, "cook");
        assert_eq!(halsted.zoning_code.as_deref(), Some("M-2"));
        assert_eq!(halsted.building_area, Some(48_500.0));
        assert_eq!(halsted.lot_area, Some(96_000.0));
        assert_eq!(halsted.assessed_value, Some(1_850_000.0));
        assert_eq!(halsted.sale_price, Some(2_100_000.0));
        assert!(halsted.sale_date.is_some());
        assert_eq!(halsted.coordinates(), Some((41.8486, -87.6466)));
        assert!((halsted.quality_score.unwrap() - 0.8).abs() < 1e-12);

        let morgan = &batch.parcels[1];
        assert_eq!(morgan.zoning_code.as_deref(), Some("I-1"));
        assert_eq!(morgan.zip_code.as_deref(), Some("60609-4411"));

        let big = &batch.parcels[2];
        assert_eq!(
            big.outlier_flags,
            vec![
                "Building area unusually large".to_string(),
                "Assessed value unusually high".to_string()
            ]
        );

        let dallas = &batch.parcels[3];
        assert_eq!(dallas.region_id, "dallas");
        assert_eq!(dallas.zoning_code.as_deref(), Some("WAREHOUSE"));
        assert!((dallas.quality_score.unwrap() - 5.4 / 8.0).abs() < 1e-12);

        let reasons: Vec<_> = batch.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec!["year_built out of range: 2150", "missing required field id"]
        );
    }

    #[test]
    fn validation_bounds() {
        let bundle = sample_bundle();
        let batch = normalize_bundle(&bundle, 2026).unwrap();
        let mut parcel = batch.parcels[0].clone();
        assert_eq!(validate_parcel(&parcel, 2026), Ok(()));

        parcel.sale_price = Some(0.0);
        assert_eq!(
            validate_parcel(&parcel, 2026),
            Err(ValidationError::OutOfRange {
                field: "sale_price",
                value: 0.0
            })
        );
        parcel.sale_price = None;
        parcel.building_area = Some(20_000_000.0);
        assert!(validate_parcel(&parcel, 2026).is_err());
    }

    #[test]
    fn bundle_without_properties_is_an_error() {
        let mut bundle = sample_bundle();
        bundle.response = json!({ "status": { "code": 1 } });
        assert!(matches!(
            normalize_bundle(&bundle, 2026),
            Err(IngestError::MissingProperties(_))
        ));
    }

    #[tokio::test]
    async fn pipeline_upserts_valid_parcels() {
        let store = Arc::new(InMemoryParcelStore::default());
        let pipeline = IngestPipeline::new(store.clone());

        let summary = pipeline.run_bundle(&sample_bundle()).await.unwrap();
        assert_eq!(summary.found, 7);
        assert_eq!(summary.normalized, 6);
        assert_eq!(summary.saved, 4);
        assert!(summary.finished_at >= summary.started_at);

        let again = pipeline.run_bundle(&sample_bundle()).await.unwrap();
        assert_ne!(again.run_id, summary.run_id);

        let counts = store.region_counts().await.unwrap();
        assert_eq!(counts.get("cook"), Some(&3));
        assert_eq!(counts.get("dallas"), Some(&1));
    }
}
