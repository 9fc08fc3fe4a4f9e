//! Parcel persistence: the store contract used by comparable discovery, plus
//! in-memory and Postgres implementations.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comps_core::Parcel;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "comps-storage";

/// How many candidates to pull and when to reach outside the target's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub limit: usize,
    /// Other regions are only consulted when the same-region pull returns fewer rows than this.
    pub pad_below: usize,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self {
            limit: 50,
            pad_below: 20,
        }
    }
}

/// Filters for browsing stored parcels. Empty lists and `None` leave a
/// dimension unfiltered.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelQuery {
    pub regions: Vec<String>,
    /// Case-insensitive substring of the property type.
    pub property_type: Option<String>,
    pub min_size: Option<f64>,
    pub max_size: Option<f64>,
    /// A parcel matches when its zoning contains any of these, ignoring case.
    pub zoning_codes: Vec<String>,
    pub limit: usize,
}

pub const DEFAULT_SEARCH_LIMIT: usize = 100;

impl Default for ParcelQuery {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            property_type: None,
            min_size: None,
            max_size: None,
            zoning_codes: Vec::new(),
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl ParcelQuery {
    pub fn matches(&self, parcel: &Parcel) -> bool {
        if !self.regions.is_empty() && !self.regions.contains(&parcel.region_id) {
            return false;
        }
        if let Some(wanted) = self.property_type.as_deref() {
            if !contains_ignore_case(parcel.property_type.as_deref(), wanted) {
                return false;
            }
        }
        if self.min_size.is_some() || self.max_size.is_some() {
            let Some(area) = parcel.building_area else {
                return false;
            };
            let too_small = self.min_size.is_some_and(|min| area < min);
            let too_large = self.max_size.is_some_and(|max| area > max);
            if too_small || too_large {
                return false;
            }
        }
        self.zoning_codes.is_empty()
            || self
                .zoning_codes
                .iter()
                .any(|code| contains_ignore_case(parcel.zoning_code.as_deref(), code))
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid parcel row {id}: {reason}")]
    InvalidRow { id: String, reason: String },
}

#[async_trait]
pub trait ParcelStore: Send + Sync {
    /// Candidates for comparison against `target`: same region first, padded
    /// with other regions, never the target itself, never rows without building area.
    async fn get_candidates(
        &self,
        target: &Parcel,
        policy: &CandidatePolicy,
    ) -> Result<Vec<Parcel>, StoreError>;

    async fn get_parcel(&self, id: &str) -> Result<Option<Parcel>, StoreError>;

    /// Insert new parcels and merge non-empty fields into existing ones.
    async fn upsert_parcels(&self, parcels: &[Parcel]) -> Result<usize, StoreError>;

    async fn region_counts(&self) -> Result<BTreeMap<String, usize>, StoreError>;

    /// Parcels matching `query`, at most `query.limit`, in stable order.
    async fn search(&self, query: &ParcelQuery) -> Result<Vec<Parcel>, StoreError>;
}

/// Copy every populated field of `incoming` over `existing`.
pub fn merge_parcel(existing: &mut Parcel, incoming: &Parcel) {
    fn take_text(slot: &mut String, value: &str) {
        if !value.is_empty() {
            *slot = value.to_string();
        }
    }
    fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
        if value.is_some() {
            slot.clone_from(value);
        }
    }

    take_text(&mut existing.region_id, &incoming.region_id);
    take_text(&mut existing.address, &incoming.address);
    take_text(&mut existing.city, &incoming.city);
    take_text(&mut existing.state, &incoming.state);
    take_text(&mut existing.data_source, &incoming.data_source);
    take(&mut existing.zip_code, &incoming.zip_code);
    take(&mut existing.property_type, &incoming.property_type);
    take(&mut existing.zoning_code, &incoming.zoning_code);
    take(&mut existing.building_area, &incoming.building_area);
    take(&mut existing.lot_area, &incoming.lot_area);
    take(&mut existing.year_built, &incoming.year_built);
    take(&mut existing.assessed_value, &incoming.assessed_value);
    take(&mut existing.market_value, &incoming.market_value);
    take(&mut existing.sale_price, &incoming.sale_price);
    take(&mut existing.sale_date, &incoming.sale_date);
    take(&mut existing.latitude, &incoming.latitude);
    take(&mut existing.longitude, &incoming.longitude);
    take(&mut existing.quality_score, &incoming.quality_score);
    existing.last_updated = incoming.last_updated;
    existing.is_verified = incoming.is_verified;
    existing.outlier_flags = incoming.outlier_flags.clone();
}

fn eligible<'a>(parcels: &'a [Parcel], target: &'a Parcel) -> impl Iterator<Item = &'a Parcel> {
    parcels
        .iter()
        .filter(move |p| p.id != target.id && p.building_area.is_some())
}

/// Insertion-ordered store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryParcelStore {
    parcels: RwLock<Vec<Parcel>>,
}

impl InMemoryParcelStore {
    pub fn new(parcels: Vec<Parcel>) -> Self {
        Self {
            parcels: RwLock::new(parcels),
        }
    }

    /// Load a JSON array of parcels, e.g. the output of `comps-cli ingest --out`.
    pub async fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let parcels: Vec<Parcel> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(count = parcels.len(), path = %path.display(), "loaded parcels");
        Ok(Self::new(parcels))
    }

    pub async fn snapshot(&self) -> Vec<Parcel> {
        self.parcels.read().await.clone()
    }
}

#[async_trait]
impl ParcelStore for InMemoryParcelStore {
    async fn get_candidates(
        &self,
        target: &Parcel,
        policy: &CandidatePolicy,
    ) -> Result<Vec<Parcel>, StoreError> {
        let parcels = self.parcels.read().await;

        let mut out: Vec<Parcel> = eligible(&parcels, target)
            .filter(|p| target.same_region(p))
            .take(policy.limit)
            .cloned()
            .collect();
        let same_region = out.len();

        if same_region < policy.pad_below {
            out.extend(
                eligible(&parcels, target)
                    .filter(|p| !target.same_region(p))
                    .take(policy.limit - same_region)
                    .cloned(),
            );
        }

        debug!(
            target_id = %target.id,
            same_region,
            total = out.len(),
            "selected in-memory candidates"
        );
        Ok(out)
    }

    async fn get_parcel(&self, id: &str) -> Result<Option<Parcel>, StoreError> {
        Ok(self.parcels.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn upsert_parcels(&self, incoming: &[Parcel]) -> Result<usize, StoreError> {
        let mut parcels = self.parcels.write().await;
        for parcel in incoming {
            match parcels.iter_mut().find(|p| p.id == parcel.id) {
                Some(existing) => merge_parcel(existing, parcel),
                None => parcels.push(parcel.clone()),
            }
        }
        Ok(incoming.len())
    }

    async fn region_counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for parcel in self.parcels.read().await.iter() {
            *counts.entry(parcel.region_id.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn search(&self, query: &ParcelQuery) -> Result<Vec<Parcel>, StoreError> {
        let parcels = self.parcels.read().await;
        let found: Vec<Parcel> = parcels
            .iter()
            .filter(|p| query.matches(p))
            .take(query.limit)
            .cloned()
            .collect();
        debug!(found = found.len(), "searched in-memory parcels");
        Ok(found)
    }
}

const PARCEL_COLUMNS: &str = "id, region_id, address, city, state, zip_code, property_type, \
     zoning_code, building_area, lot_area, year_built, assessed_value, market_value, \
     sale_price, sale_date, latitude, longitude, data_source, last_updated, quality_score, \
     is_verified, outlier_flags";

/// Postgres-backed store. Expects an existing `parcels` table; schema
/// management happens outside this crate.
#[derive(Debug, Clone)]
pub struct PgParcelStore {
    pool: PgPool,
}

impl PgParcelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to parcel database")?;
        Ok(Self::new(pool))
    }

    async fn fetch_candidate_rows(
        &self,
        target: &Parcel,
        same_region: bool,
        limit: usize,
    ) -> Result<Vec<Parcel>, StoreError> {
        // A blank target region matches nothing, so every row counts as another region.
        let region_clause = if same_region {
            "region_id = $2 AND $2 <> ''"
        } else {
            "(region_id IS DISTINCT FROM $2 OR $2 = '')"
        };
        let sql = format!(
            "SELECT {PARCEL_COLUMNS} FROM parcels \
              WHERE id <> $1 AND building_area IS NOT NULL AND {region_clause} \
              ORDER BY id LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(&target.id)
            .bind(&target.region_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parcel_from_row).collect()
    }
}

fn parcel_from_row(row: &PgRow) -> Result<Parcel, StoreError> {
    let id: String = row.try_get("id")?;
    let outlier_flags: Option<serde_json::Value> = row.try_get("outlier_flags")?;
    let outlier_flags = match outlier_flags {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value(value).map_err(|err| StoreError::InvalidRow {
            id: id.clone(),
            reason: format!("outlier_flags: {err}"),
        })?,
    };
    let last_updated: Option<DateTime<Utc>> = row.try_get("last_updated")?;

    Ok(Parcel {
        region_id: row.try_get::<Option<String>, _>("region_id")?.unwrap_or_default(),
        address: row.try_get::<Option<String>, _>("address")?.unwrap_or_default(),
        city: row.try_get::<Option<String>, _>("city")?.unwrap_or_default(),
        state: row.try_get::<Option<String>, _>("state")?.unwrap_or_default(),
        zip_code: row.try_get("zip_code")?,
        property_type: row.try_get("property_type")?,
        zoning_code: row.try_get("zoning_code")?,
        building_area: row.try_get("building_area")?,
        lot_area: row.try_get("lot_area")?,
        year_built: row.try_get("year_built")?,
        assessed_value: row.try_get("assessed_value")?,
        market_value: row.try_get("market_value")?,
        sale_price: row.try_get("sale_price")?,
        sale_date: row.try_get("sale_date")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        data_source: row.try_get::<Option<String>, _>("data_source")?.unwrap_or_default(),
        last_updated: last_updated.unwrap_or_else(Utc::now),
        quality_score: row.try_get("quality_score")?,
        is_verified: row.try_get::<Option<bool>, _>("is_verified")?.unwrap_or(false),
        outlier_flags,
        id,
    })
}

#[async_trait]
impl ParcelStore for PgParcelStore {
    async fn get_candidates(
        &self,
        target: &Parcel,
        policy: &CandidatePolicy,
    ) -> Result<Vec<Parcel>, StoreError> {
        let mut out = self.fetch_candidate_rows(target, true, policy.limit).await?;
        let same_region = out.len();
        if same_region < policy.pad_below {
            let others = self
                .fetch_candidate_rows(target, false, policy.limit - same_region)
                .await?;
            out.extend(others);
        }
        debug!(target_id = %target.id, same_region, total = out.len(), "selected db candidates");
        Ok(out)
    }

    async fn get_parcel(&self, id: &str) -> Result<Option<Parcel>, StoreError> {
        let sql = format!("SELECT {PARCEL_COLUMNS} FROM parcels WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(parcel_from_row).transpose()
    }

    async fn upsert_parcels(&self, parcels: &[Parcel]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for parcel in parcels {
            let flags = serde_json::to_value(&parcel.outlier_flags).map_err(|err| {
                StoreError::InvalidRow {
                    id: parcel.id.clone(),
                    reason: format!("outlier_flags: {err}"),
                }
            })?;
            sqlx::query(
                r#"
                INSERT INTO parcels (
                    id, region_id, address, city, state, zip_code, property_type,
                    zoning_code, building_area, lot_area, year_built, assessed_value,
                    market_value, sale_price, sale_date, latitude, longitude, data_source,
                    last_updated, quality_score, is_verified, outlier_flags
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22
                )
                ON CONFLICT (id) DO UPDATE SET
                    region_id = COALESCE(NULLIF(EXCLUDED.region_id, ''), parcels.region_id),
                    address = COALESCE(NULLIF(EXCLUDED.address, ''), parcels.address),
                    city = COALESCE(NULLIF(EXCLUDED.city, ''), parcels.city),
                    state = COALESCE(NULLIF(EXCLUDED.state, ''), parcels.state),
                    zip_code = COALESCE(EXCLUDED.zip_code, parcels.zip_code),
                    property_type = COALESCE(EXCLUDED.property_type, parcels.property_type),
                    zoning_code = COALESCE(EXCLUDED.zoning_code, parcels.zoning_code),
                    building_area = COALESCE(EXCLUDED.building_area, parcels.building_area),
                    lot_area = COALESCE(EXCLUDED.lot_area, parcels.lot_area),
                    year_built = COALESCE(EXCLUDED.year_built, parcels.year_built),
                    assessed_value = COALESCE(EXCLUDED.assessed_value, parcels.assessed_value),
                    market_value = COALESCE(EXCLUDED.market_value, parcels.market_value),
                    sale_price = COALESCE(EXCLUDED.sale_price, parcels.sale_price),
                    sale_date = COALESCE(EXCLUDED.sale_date, parcels.sale_date),
                    latitude = COALESCE(EXCLUDED.latitude, parcels.latitude),
                    longitude = COALESCE(EXCLUDED.longitude, parcels.longitude),
                    data_source = COALESCE(NULLIF(EXCLUDED.data_source, ''), parcels.data_source),
                    last_updated = EXCLUDED.last_updated,
                    quality_score = COALESCE(EXCLUDED.quality_score, parcels.quality_score),
                    is_verified = EXCLUDED.is_verified,
                    outlier_flags = EXCLUDED.outlier_flags
                "#,
            )
            .bind(&parcel.id)
            .bind(&parcel.region_id)
            .bind(&parcel.address)
            .bind(&parcel.city)
            .bind(&parcel.state)
            .bind(&parcel.zip_code)
            .bind(&parcel.property_type)
            .bind(&parcel.zoning_code)
            .bind(parcel.building_area)
            .bind(parcel.lot_area)
            .bind(parcel.year_built)
            .bind(parcel.assessed_value)
            .bind(parcel.market_value)
            .bind(parcel.sale_price)
            .bind(parcel.sale_date)
            .bind(parcel.latitude)
            .bind(parcel.longitude)
            .bind(&parcel.data_source)
            .bind(parcel.last_updated)
            .bind(parcel.quality_score)
            .bind(parcel.is_verified)
            .bind(flags)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = parcels.len(), "upserted parcels");
        Ok(parcels.len())
    }

    async fn region_counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(region_id, '') AS region_id, COUNT(*) AS n
              FROM parcels
             GROUP BY 1
             ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let region: String = row.try_get("region_id")?;
            let n: i64 = row.try_get("n")?;
            out.insert(region, n.max(0) as usize);
        }
        Ok(out)
    }

    async fn search(&self, query: &ParcelQuery) -> Result<Vec<Parcel>, StoreError> {
        let mut sql = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PARCEL_COLUMNS} FROM parcels WHERE TRUE"
        ));
        if !query.regions.is_empty() {
            sql.push(" AND region_id = ANY(")
                .push_bind(query.regions.clone())
                .push(")");
        }
        if let Some(property_type) = &query.property_type {
            sql.push(" AND property_type ILIKE ")
                .push_bind(format!("%{property_type}%"));
        }
        if let Some(min) = query.min_size {
            sql.push(" AND building_area >= ").push_bind(min);
        }
        if let Some(max) = query.max_size {
            sql.push(" AND building_area <= ").push_bind(max);
        }
        if !query.zoning_codes.is_empty() {
            let patterns: Vec<String> = query
                .zoning_codes
                .iter()
                .map(|code| format!("%{code}%"))
                .collect();
            sql.push(" AND zoning_code ILIKE ANY(")
                .push_bind(patterns)
                .push(")");
        }
        sql.push(" ORDER BY id LIMIT ")
            .push_bind(query.limit as i64);

        let rows = sql.build().fetch_all(&self.pool).await?;
        debug!(found = rows.len(), "searched db parcels");
        rows.iter().map(parcel_from_row).collect()
    }
}
