use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use review_warehouse::config::PipelineConfig;
use review_warehouse::storage::{Warehouse, projections};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    // Warehouse path from the first argument, else from configuration.
    let path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => PipelineConfig::load(None)?.paths.warehouse,
    };

    println!("=== VERIFYING WAREHOUSE {} ===\n", path.display());
    if !path.exists() {
        bail!("Warehouse {} does not exist; run `review-warehouse init` first", path.display());
    }

    let warehouse = Warehouse::open_read_only(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let report = warehouse.verify()?;

    println!("Foreign keys enabled: {}", report.foreign_keys_on);
    println!("Journal mode: {}", report.journal_mode);
    for (name, kind) in &report.objects {
        println!("  {:<6} {}", kind, name);
    }

    let health = projections::health(warehouse.connection())?;
    println!("\nReviews: {}", health.total_reviews);
    match &health.latest_load {
        Some(entry) => println!("Latest load: {} {} at {}", entry.file_name, entry.status, entry.finished_at),
        None => println!("Latest load: none"),
    }

    if !report.missing.is_empty() {
        bail!("Missing warehouse objects: {}", report.missing.join(", "));
    }
    if !report.foreign_keys_on {
        bail!("Foreign key enforcement is off");
    }

    println!("\n✅ Warehouse schema verified");
    Ok(())
}
