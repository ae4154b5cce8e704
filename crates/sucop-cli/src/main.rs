use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use sucop_core::RawNoticeRecord;
use sucop_pipeline::{retag_all, LogChannel, MonitorPipeline, PipelineConfig};
use sucop_store::{MemStore, NoticeStore, PgStore};

#[derive(Debug, Parser)]
#[command(name = "sucop-cli")]
#[command(about = "SUCOP consultation monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full monitoring run over a scraped batch file.
    Run {
        /// JSON array of scraped registry records.
        batch: std::path::PathBuf,
        /// Evaluation date (ISO), defaults to today in UTC.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Reconcile a scraped batch file without tagging or alerting.
    Ingest { batch: std::path::PathBuf },
    /// Recompute keyword links for every stored notice.
    Retag,
    /// Print notices open for comment as JSON.
    Active,
    /// Print upcoming deadlines as JSON.
    Deadlines {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print the alert log as JSON.
    Alerts,
    /// Apply pending database migrations.
    Migrate,
}

async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn NoticeStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using a process-local store");
            Ok(Arc::new(MemStore::new()))
        }
    }
}

fn load_batch(path: &Path) -> Result<Vec<RawNoticeRecord>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Run { batch, date } => {
            let store = open_store(&config).await?;
            let records = load_batch(&batch)?;
            let today = date.unwrap_or_else(|| Utc::now().date_naive());
            let pipeline = MonitorPipeline::new(config, store, Arc::new(LogChannel));
            let summary = pipeline.run_once(records, today).await?;
            println!(
                "run complete: run_id={} created={} updated={} unchanged={} rejected={} alerts={} reports={}",
                summary.run_id,
                summary.stats.created,
                summary.stats.updated,
                summary.stats.unchanged,
                summary.stats.rejected,
                summary.alerts.fired,
                summary.reports_dir,
            );
        }
        Commands::Ingest { batch } => {
            let store = open_store(&config).await?;
            let records = load_batch(&batch)?;
            let reconciler = sucop_pipeline::IngestionReconciler::new(config.reference_policy);
            let report = reconciler
                .ingest_batch(store.as_ref(), records, Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Retag => {
            let store = open_store(&config).await?;
            let summary = retag_all(store.as_ref()).await?;
            println!(
                "retag complete: notices={} links={}",
                summary.notices, summary.links
            );
        }
        Commands::Active => {
            let store = open_store(&config).await?;
            let rows = store.active_notices().await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Deadlines { date } => {
            let store = open_store(&config).await?;
            let today = date.unwrap_or_else(|| Utc::now().date_naive());
            let rows = store.upcoming_deadlines(today).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Alerts => {
            let store = open_store(&config).await?;
            let records = store.list_alert_records().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
