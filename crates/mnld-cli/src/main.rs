use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};
use mnld_import::ImportWriter;
use mnld_pipeline::{load_plan, report_markdown, ImportSink, Pipeline};
use mnld_sources::{PlacesSearchSource, WebsiteEnricher};
use mnld_storage::{PacedClient, PacedClientConfig, RunStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mnld-cli")]
#[command(about = "MNLD collection pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the collection pipeline: search, enrich, synthesize, import.
    Run {
        /// Start from the newest sealed search snapshot instead of
        /// re-querying the search source.
        #[arg(long)]
        resume: bool,
        /// City and search-term configuration.
        #[arg(long, default_value = "cities.yaml")]
        config: PathBuf,
        /// Directory holding per-run snapshots and reports.
        #[arg(long, default_value = "collected_data")]
        output_dir: PathBuf,
        /// Collect and synthesize only; do not touch the destination store.
        #[arg(long)]
        skip_import: bool,
    },
    /// Print a digest of recent run summaries.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long, default_value = "collected_data")]
        output_dir: PathBuf,
    },
}

fn env_duration_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_ms),
    )
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mnld=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            resume,
            config,
            output_dir,
            skip_import,
        } => run(resume, config, output_dir, skip_import).await,
        Commands::Report { runs, output_dir } => {
            let store = RunStore::new(output_dir);
            let markdown = report_markdown(&store, runs).await?;
            println!("{markdown}");
            Ok(())
        }
    }
}

async fn run(resume: bool, config: PathBuf, output_dir: PathBuf, skip_import: bool) -> Result<()> {
    // Configuration problems stop the run before any phase begins.
    let api_key = match std::env::var("PLACES_API_KEY") {
        Ok(key) if !key.trim().is_empty() => key,
        _ => bail!("PLACES_API_KEY is not set; the search source cannot authenticate"),
    };

    let sink: Option<Arc<dyn ImportSink>> = if skip_import {
        None
    } else {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL is not set; pass --skip-import to collect without a store")?;
        let writer = ImportWriter::connect(&database_url).await?;
        writer.ensure_reachable().await?;
        Some(Arc::new(writer))
    };

    let plan = load_plan(&config)?;
    let user_agent = std::env::var("MNLD_USER_AGENT").unwrap_or_else(|_| "mnld-bot/0.1".to_string());
    let timeout = env_duration_secs("MNLD_HTTP_TIMEOUT_SECS", 20);
    let min_delay = env_duration_ms("MNLD_MIN_DELAY_MS", 1_000);

    // One paced client per downstream source family: the search API has its
    // own budget, firm websites share another.
    let search_http = Arc::new(PacedClient::new(PacedClientConfig {
        timeout,
        user_agent: Some(user_agent.clone()),
        min_delay: env_duration_ms("MNLD_SEARCH_MIN_DELAY_MS", 2_000),
        ..Default::default()
    })?);
    let website_http = Arc::new(PacedClient::new(PacedClientConfig {
        timeout,
        user_agent: Some(user_agent),
        min_delay,
        ..Default::default()
    })?);

    let source = Arc::new(PlacesSearchSource::new(search_http, api_key));
    let enricher = Arc::new(WebsiteEnricher::new(website_http, Utc::now().year())?);

    let pipeline = Pipeline::new(RunStore::new(&output_dir), plan, source, enricher, sink);

    info!(output_dir = %output_dir.display(), resume, "starting collection run");
    let summary = pipeline.run(resume).await?;

    println!(
        "run complete: run_id={} candidates={} records={} failed_queries={} snapshots={}",
        summary.run_id,
        summary.candidates,
        summary.records,
        summary.failed_queries,
        output_dir.join(&summary.run_id).display(),
    );
    if let Some(import) = &summary.import {
        println!(
            "import: inserted={} updated={} skipped={} failed={}",
            import.inserted, import.updated, import.skipped, import.failed
        );
    }
    Ok(())
}
