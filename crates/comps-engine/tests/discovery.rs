use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use comps_core::{Parcel, ScoreSource};
use comps_engine::{ComparableEngine, EngineConfig, EngineError};
use comps_storage::{CandidatePolicy, InMemoryParcelStore, ParcelQuery, ParcelStore, StoreError};

fn parcel(id: &str, region: &str, city: &str, area: f64, assessed: f64) -> Parcel {
    Parcel {
        id: id.to_string(),
        region_id: region.to_string(),
        address: format!("{id} Commerce Dr"),
        city: city.to_string(),
        state: "IL".into(),
        zip_code: None,
        property_type: Some("industrial".into()),
        zoning_code: Some("I-1".into()),
        building_area: Some(area),
        lot_area: None,
        year_built: Some(1995),
        assessed_value: Some(assessed),
        market_value: None,
        sale_price: None,
        sale_date: None,
        latitude: None,
        longitude: None,
        data_source: "fixture".into(),
        last_updated: Utc.with_ymd_and_hms(2026, 4, 2, 9, 30, 0).single().unwrap(),
        quality_score: Some(0.9),
        is_verified: true,
        outlier_flags: vec![],
    }
}

struct SlowStore;

#[async_trait]
impl ParcelStore for SlowStore {
    async fn get_candidates(
        &self,
        _target: &Parcel,
        _policy: &CandidatePolicy,
    ) -> Result<Vec<Parcel>, StoreError> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok(Vec::new())
    }

    async fn get_parcel(&self, _id: &str) -> Result<Option<Parcel>, StoreError> {
        Ok(None)
    }

    async fn upsert_parcels(&self, parcels: &[Parcel]) -> Result<usize, StoreError> {
        Ok(parcels.len())
    }

    async fn region_counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        Ok(BTreeMap::new())
    }

    async fn search(&self, _query: &ParcelQuery) -> Result<Vec<Parcel>, StoreError> {
        Ok(Vec::new())
    }
}

struct BrokenStore;

#[async_trait]
impl ParcelStore for BrokenStore {
    async fn get_candidates(
        &self,
        target: &Parcel,
        _policy: &CandidatePolicy,
    ) -> Result<Vec<Parcel>, StoreError> {
        Err(StoreError::InvalidRow {
            id: target.id.clone(),
            reason: "corrupt row".into(),
        })
    }

    async fn get_parcel(&self, _id: &str) -> Result<Option<Parcel>, StoreError> {
        Ok(None)
    }

    async fn upsert_parcels(&self, _parcels: &[Parcel]) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn region_counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        Ok(BTreeMap::new())
    }

    async fn search(&self, _query: &ParcelQuery) -> Result<Vec<Parcel>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn same_county_comparables_outrank_distant_ones() {
    let target = parcel("t", "cook", "Chicago", 60_000.0, 3_000_000.0);
    let store = Arc::new(InMemoryParcelStore::new(vec![
        target.clone(),
        parcel("far", "dallas", "Dallas", 60_000.0, 3_000_000.0),
        parcel("near", "cook", "Chicago", 60_000.0, 3_000_000.0),
        parcel("tiny", "cook", "Chicago", 2_000.0, 90_000.0),
    ]));
    let engine = ComparableEngine::new(store, EngineConfig::default()).unwrap();

    let report = engine.analyze(&target, 10).await.unwrap();
    let ids: Vec<_> = report.comparables.iter().map(|c| c.parcel.id.as_str()).collect();
    assert_eq!(ids[0], "near");
    assert!(ids.contains(&"far"));
    assert!(report.comparables.iter().all(|c| c.source == ScoreSource::Deterministic));
    assert_eq!(report.count, report.comparables.len());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["market_insight"]["market_position"], "at_market");
    assert!(json["comparables"][0]["factor_scores"]["sale_price"].is_number());
}

#[tokio::test(start_paused = true)]
async fn slow_store_fails_the_request() {
    let config = EngineConfig {
        request_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let engine = ComparableEngine::new(Arc::new(SlowStore), config).unwrap();
    let target = parcel("t", "cook", "Chicago", 60_000.0, 3_000_000.0);

    let err = engine.find_comparables(&target, 10).await.unwrap_err();
    assert!(matches!(err, EngineError::StoreTimeout(_)));
}

#[tokio::test]
async fn store_errors_propagate() {
    let engine = ComparableEngine::new(Arc::new(BrokenStore), EngineConfig::default()).unwrap();
    let target = parcel("t", "cook", "Chicago", 60_000.0, 3_000_000.0);

    let err = engine.find_comparables(&target, 10).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::InvalidRow { .. })));
}
