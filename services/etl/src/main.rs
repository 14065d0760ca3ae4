//! ETL Service - Loads regional market panels into the database
//!
//! Responsibilities:
//! - Retrieve every selected panel (HTTP or an offline directory)
//! - Reshape wide panels into long observations with yoy/mom ratios
//! - Merge metric streams sharing a table
//! - Upsert in batches and write the run report
//!
//! Usage:
//!   # Full run:
//!   cargo run --bin etl -- --config config/sources.json
//!
//!   # Single ZIP, no database writes, replaying collected files:
//!   cargo run --bin etl -- --region 32937 --dry-run --offline-dir data/raw

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use collector::{Fetcher, HttpConfig, HttpFetcher, LocalFetcher, SourcesConfig};
use etl::{DerivationMode, MemoryStore, PgStore, Pipeline, PipelineError, PipelineOptions, TargetStore};

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Reshapes, merges and loads regional market panels")]
struct Args {
    /// Path to sources config file
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Restrict to these source ids (repeatable)
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Keep only rows for this region key
    #[arg(long)]
    region: Option<String>,

    /// Run every phase without writing to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Records per upsert call [env: BATCH_SIZE]
    #[arg(long)]
    batch_size: Option<usize>,

    /// Derived ratio distance: ordinal or calendar [env: DERIVATION_MODE]
    #[arg(long)]
    derivation: Option<DerivationMode>,

    /// Read panels from this directory instead of downloading
    #[arg(long)]
    offline_dir: Option<PathBuf>,

    /// Directory for run reports [env: REPORTS_DIR]
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Re-download even if today's file exists
    #[arg(long, default_value = "false")]
    force: bool,

    /// Phase timeout in seconds [env: PHASE_TIMEOUT_SECS]
    #[arg(long)]
    phase_timeout_secs: Option<u64>,
}

impl Args {
    fn options(&self) -> Result<PipelineOptions> {
        let mut options = PipelineOptions::from_env().context("Invalid pipeline settings in environment")?;
        if let Some(batch_size) = self.batch_size {
            options.batch_size = batch_size;
        }
        if let Some(derivation) = self.derivation {
            options.derivation = derivation;
        }
        if let Some(dir) = &self.report_dir {
            options.report_dir = dir.clone();
        }
        if let Some(secs) = self.phase_timeout_secs {
            options.phase_timeout = Duration::from_secs(secs);
        }
        options.dry_run = self.dry_run;
        options.region = self.region.clone();
        options.sources = self.sources.clone();
        options.validate().context("Invalid pipeline options")?;
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    collector::init_tracing();

    let args = Args::parse();
    let options = args.options()?;
    let catalog = SourcesConfig::load(&args.config)
        .with_context(|| format!("Failed to load sources config {}", args.config))?;

    info!("=== Regional Market ETL ===");
    info!(version = %catalog.version, sources = catalog.sources.len(), "loaded sources config");
    info!("Mode: {}", if options.dry_run { "dry-run" } else { "live" });
    if let Some(region) = &options.region {
        info!(region = %region, "Single-region run");
    }

    let fetcher: Arc<dyn Fetcher> = match &args.offline_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Replaying panels from disk");
            Arc::new(LocalFetcher::new(dir.clone()))
        }
        None => {
            let mut http_config = HttpConfig::from_env();
            http_config.force = args.force;
            Arc::new(HttpFetcher::new(http_config).context("Failed to build HTTP client")?)
        }
    };

    let store: Arc<dyn TargetStore> = if options.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
        Arc::new(
            PgStore::connect(&db_url)
                .await
                .context("Failed to connect to database")?,
        )
    };

    let pipeline = Pipeline::new(catalog, options, fetcher, store);
    match pipeline.run().await {
        Ok(outcome) => {
            info!(
                path = %outcome.report_path.display(),
                success_rate = %outcome.report.summary.success_rate,
                "Run complete"
            );
            Ok(())
        }
        Err(e @ PipelineError::NoSourcesRetrieved { .. }) => {
            error!(error = %e, "Run failed");
            Err(e.into())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Run failed")),
    }
}
