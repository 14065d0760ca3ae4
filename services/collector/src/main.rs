//! Collector Service - Downloads raw regional panels from public sources
//!
//! Responsibilities:
//! - Fetch each enabled source in the catalog
//! - Apply rate limiting to avoid degrading source sites
//! - Reuse same-day downloads unless forced
//! - Store raw panels under RAW_FS_DIR for later ETL runs
//!
//! Usage:
//!   # Every enabled source:
//!   cargo run --bin collector -- --config config/sources.json
//!
//!   # Specific source(s):
//!   cargo run --bin collector -- --config config/sources.json --source zhvi_zip

use anyhow::{Context, Result};
use clap::Parser;
use collector::{Fetcher, HttpConfig, HttpFetcher, SourcesConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Downloads raw regional panels from public sources")]
struct Args {
    /// Path to sources config file
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Restrict to these source ids (repeatable)
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Force re-download even if today's file exists
    #[arg(long, default_value = "false")]
    force: bool,

    /// List configured sources and exit
    #[arg(long, default_value = "false")]
    list: bool,
}

fn print_sources_summary(sources_config: &SourcesConfig) {
    println!("\nConfigured sources:");
    println!("{:-<60}", "");
    for source in &sources_config.sources {
        let status = if source.enabled { "✓" } else { "✗" };
        println!(
            "  {} {} - {} [{:?} -> {}.{}]",
            status, source.id, source.name, source.kind, source.table, source.metric
        );
    }
    println!("{:-<60}", "");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    collector::init_tracing();

    let args = Args::parse();
    let sources_config = SourcesConfig::load(&args.config)
        .with_context(|| format!("Failed to load sources config {}", args.config))?;
    info!(version = %sources_config.version, "loaded sources config");

    if args.list {
        print_sources_summary(&sources_config);
        return Ok(());
    }

    let sources = sources_config.select(&args.sources);
    if sources.is_empty() {
        print_sources_summary(&sources_config);
        anyhow::bail!("No sources match the filter criteria");
    }

    let mut http_config = HttpConfig::from_env();
    http_config.force = args.force;
    info!(raw_dir = %http_config.raw_dir.display(), "storage");
    let fetcher = HttpFetcher::new(http_config).context("Failed to build HTTP client")?;

    let mut collected = 0;
    let mut failed = 0;

    for source in sources {
        match fetcher.fetch(source).await {
            Ok(artifact) => {
                info!(
                    source = %source.id,
                    bytes = artifact.size_bytes(),
                    path = ?artifact.local_path,
                    "collected"
                );
                collected += 1;
            }
            Err(e) => {
                error!(source = %source.id, error = %e, "collection failed");
                failed += 1;
            }
        }
    }

    info!(collected, failed, "collection summary");
    if collected == 0 {
        warn!("no sources collected");
        anyhow::bail!("All {} source(s) failed", failed);
    }

    Ok(())
}
