use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comps_engine::ComparableEngine;
use comps_ingest::{load_provider_bundle, IngestPipeline};
use comps_storage::{InMemoryParcelStore, ParcelQuery, ParcelStore, PgParcelStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_PARCELS_FILE: &str = "parcels.json";

#[derive(Debug, Parser)]
#[command(name = "comps-cli")]
#[command(about = "Industrial parcel comparables command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalise a saved provider response and upsert its parcels.
    Ingest {
        #[arg(long)]
        bundle: PathBuf,
        /// Parcel snapshot to merge into when no DATABASE_URL is set.
        #[arg(long, default_value = DEFAULT_PARCELS_FILE)]
        out: PathBuf,
    },
    /// Rank comparables for one parcel and print the report as JSON.
    Comparables {
        #[arg(long)]
        target: String,
        #[arg(long, default_value = DEFAULT_PARCELS_FILE)]
        parcels: PathBuf,
        #[arg(long, default_value_t = comps_engine::DEFAULT_MAX_RESULTS)]
        max_results: usize,
    },
    /// List stored parcels matching the given filters as JSON.
    Search {
        #[arg(long, default_value = DEFAULT_PARCELS_FILE)]
        parcels: PathBuf,
        /// Repeat to allow several regions.
        #[arg(long = "region")]
        regions: Vec<String>,
        #[arg(long)]
        property_type: Option<String>,
        #[arg(long)]
        min_size: Option<f64>,
        #[arg(long)]
        max_size: Option<f64>,
        /// Repeat to match any of several zoning codes.
        #[arg(long = "zoning")]
        zoning_codes: Vec<String>,
        #[arg(long, default_value_t = comps_storage::DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Parcel counts per region.
    Stats {
        #[arg(long, default_value = DEFAULT_PARCELS_FILE)]
        parcels: PathBuf,
    },
}

/// Postgres when `DATABASE_URL` is set, otherwise a JSON snapshot on disk.
enum StoreHandle {
    Postgres(Arc<PgParcelStore>),
    File {
        store: Arc<InMemoryParcelStore>,
        path: PathBuf,
    },
}

impl StoreHandle {
    async fn open(parcels: &Path, allow_missing: bool) -> Result<Self> {
        if let Some(url) = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()) {
            let store = PgParcelStore::connect(&url).await?;
            return Ok(Self::Postgres(Arc::new(store)));
        }

        let store = if parcels.exists() {
            InMemoryParcelStore::from_json_file(parcels).await?
        } else if allow_missing {
            InMemoryParcelStore::default()
        } else {
            bail!(
                "parcel file {} not found; run `comps-cli ingest` first or set DATABASE_URL",
                parcels.display()
            );
        };
        Ok(Self::File {
            store: Arc::new(store),
            path: parcels.to_path_buf(),
        })
    }

    fn store(&self) -> Arc<dyn ParcelStore> {
        match self {
            Self::Postgres(store) => store.clone(),
            Self::File { store, .. } => store.clone(),
        }
    }

    async fn persist(&self) -> Result<()> {
        let Self::File { store, path } = self else {
            return Ok(());
        };
        let parcels = store.snapshot().await;
        let json = serde_json::to_string_pretty(&parcels)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(count = parcels.len(), path = %path.display(), "wrote parcel snapshot");
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { bundle, out } => {
            let bundle = load_provider_bundle(&bundle)?;
            let handle = StoreHandle::open(&out, true).await?;
            let summary = IngestPipeline::new(handle.store()).run_bundle(&bundle).await?;
            handle.persist().await?;
            println!(
                "ingest complete: run_id={} found={} normalized={} rejected={} saved={}",
                summary.run_id,
                summary.found,
                summary.normalized,
                summary.rejected.len(),
                summary.saved
            );
            for rejection in &summary.rejected {
                println!("  rejected {} ({}): {}", rejection.parcel_id, rejection.address, rejection.reason);
            }
        }
        Commands::Comparables {
            target,
            parcels,
            max_results,
        } => {
            let handle = StoreHandle::open(&parcels, false).await?;
            let store = handle.store();
            let Some(parcel) = store.get_parcel(&target).await? else {
                bail!("parcel {target} not found");
            };
            let engine = ComparableEngine::from_env(store)?;
            let report = engine.analyze(&parcel, max_results).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Search {
            parcels,
            regions,
            property_type,
            min_size,
            max_size,
            zoning_codes,
            limit,
        } => {
            let handle = StoreHandle::open(&parcels, false).await?;
            let query = ParcelQuery {
                regions,
                property_type,
                min_size,
                max_size,
                zoning_codes,
                limit,
            };
            let found = handle.store().search(&query).await?;
            info!(found = found.len(), "search complete");
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        Commands::Stats { parcels } => {
            let handle = StoreHandle::open(&parcels, false).await?;
            let counts = handle.store().region_counts().await?;
            let total: usize = counts.values().sum();
            for (region, count) in &counts {
                println!("{region:<16} {count}");
            }
            println!("{:<16} {total}", "total");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comparables_defaults() {
        let cli = Cli::parse_from(["comps-cli", "comparables", "--target", "attom_1001"]);
        match cli.command {
            Commands::Comparables {
                target,
                parcels,
                max_results,
            } => {
                assert_eq!(target, "attom_1001");
                assert_eq!(parcels, PathBuf::from(DEFAULT_PARCELS_FILE));
                assert_eq!(max_results, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_repeated_search_filters() {
        let cli = Cli::parse_from([
            "comps-cli",
            "search",
            "--region",
            "cook",
            "--region",
            "dallas",
            "--zoning",
            "M-1",
            "--min-size",
            "10000",
        ]);
        match cli.command {
            Commands::Search {
                regions,
                zoning_codes,
                min_size,
                max_size,
                limit,
                ..
            } => {
                assert_eq!(regions, vec!["cook", "dallas"]);
                assert_eq!(zoning_codes, vec!["M-1"]);
                assert_eq!(min_size, Some(10_000.0));
                assert_eq!(max_size, None);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_parcel_file_is_only_fine_for_ingest() {
        if std::env::var("DATABASE_URL").is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.json");
        assert!(StoreHandle::open(&path, false).await.is_err());

        let handle = StoreHandle::open(&path, true).await.unwrap();
        handle.persist().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
    }
}
