use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use review_warehouse::config::PipelineConfig;
use review_warehouse::loader::AuditRecorder;
use review_warehouse::models::RunStatus;
use review_warehouse::storage::{Warehouse, projections};
use review_warehouse::{IngestSummary, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "review-warehouse", version, about = "Governed review ingestion into a SQLite warehouse")]
struct Cli {
    /// Pipeline configuration file (defaults to src/configs/pipeline.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover, validate and load source files
    Ingest {
        /// Override the configured discovery patterns
        #[arg(long = "glob")]
        globs: Vec<String>,
    },
    /// Merge an existing stage artifact again
    Replay {
        #[arg(long)]
        stage: PathBuf,
    },
    /// Recompute every metrics summary from the fact table
    Rebuild,
    /// Latest load and review totals
    Status {
        /// Number of audit entries to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Create the warehouse schema and working directories
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load pipeline configuration")?;
    info!(
        "Loaded configuration: warehouse={} patterns={:?}",
        config.paths.warehouse.display(),
        config.discovery.patterns
    );

    match cli.cmd {
        Commands::Ingest { globs } => {
            let patterns = if globs.is_empty() { config.discovery.patterns.clone() } else { globs };
            let pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;
            watch_for_interrupt(&pipeline);

            info!("🚀 Starting review ingestion");
            let summary = tokio::task::spawn_blocking(move || pipeline.ingest_patterns(&patterns))
                .await
                .context("Ingestion task panicked")?
                .context("Ingestion failed")?;

            print_summary(&summary)?;
            if summary.has_failures() {
                bail!(
                    "{} run(s) failed, {} aborted",
                    summary.count(RunStatus::Failed),
                    summary.count(RunStatus::Aborted)
                );
            }
            info!("🎉 Ingestion completed");
        }
        Commands::Replay { stage } => {
            let pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;
            let report = tokio::task::spawn_blocking(move || pipeline.replay_stage(&stage))
                .await
                .context("Replay task panicked")?
                .context("Replay failed")?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status == RunStatus::Failed {
                bail!("Replay of {} failed", report.file.display());
            }
        }
        Commands::Rebuild => {
            let pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;
            let rows = tokio::task::spawn_blocking(move || pipeline.rebuild_metrics())
                .await
                .context("Rebuild task panicked")?
                .context("Rebuild failed")?;
            println!("REBUILD OK summary_rows={}", rows);
        }
        Commands::Status { limit } => {
            let warehouse = Warehouse::open_read_only(&config.paths.warehouse)
                .with_context(|| format!("Failed to open warehouse {}", config.paths.warehouse.display()))?;
            let conn = warehouse.connection();

            let health = projections::health(conn)?;
            println!("{}", serde_json::to_string_pretty(&health)?);

            let entries = AuditRecorder::entries(conn)?;
            for entry in entries.iter().rev().take(limit) {
                println!(
                    "#{:<5} {:<9} {:<30} read={} accepted={} quarantined={} at {}",
                    entry.id,
                    entry.status,
                    entry.file_name,
                    entry.rows_read,
                    entry.rows_accepted,
                    entry.rows_quarantined,
                    entry.finished_at
                );
            }
        }
        Commands::Init => {
            let pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;
            let report = pipeline.init().context("Failed to initialize warehouse")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.missing.is_empty() {
                bail!("Warehouse is missing objects: {:?}", report.missing);
            }
        }
    }

    Ok(())
}

/// Ctrl-C rolls back the in-flight run and stops before the next one.
fn watch_for_interrupt(pipeline: &Pipeline) {
    let abort = pipeline.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received; finishing current step and aborting");
            abort.store(true, Ordering::SeqCst);
        }
    });
}

fn print_summary(summary: &IngestSummary) -> Result<()> {
    info!("\n=== Ingestion Summary ===");
    for run in &summary.runs {
        info!(
            "{} {}: read={} accepted={} quarantined={} inserted={} replaced={}",
            run.status,
            run.file.display(),
            run.rows_read,
            run.rows_accepted,
            run.rows_quarantined,
            run.inserted,
            run.replaced
        );
    }
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
