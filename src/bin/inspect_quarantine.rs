use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

use review_warehouse::config::PipelineConfig;
use review_warehouse::storage::QuarantineStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    // Explicit files, or every quarantine file under the configured directory.
    let mut files: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if files.is_empty() {
        let dir = PipelineConfig::load(None)?.paths.quarantine_dir;
        let pattern = format!("{}/*_bad_rows.csv", dir.display());
        files = glob::glob(&pattern)?.filter_map(|entry| entry.ok()).collect();
        files.sort();
    }

    println!("=== QUARANTINE REPORT ({} files) ===\n", files.len());

    let mut rule_totals: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_rows = 0;

    for file in &files {
        let records = QuarantineStore::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        println!("{} ({} rows)", file.display(), records.len());

        for record in &records {
            let rules: Vec<&str> = record.rules.iter().map(|r| r.as_str()).collect();
            println!("  row {:<6} [{}] {}", record.raw.source_row, rules.join(","), record.reason);
            for rule in rules {
                *rule_totals.entry(rule.to_string()).or_default() += 1;
            }
        }
        total_rows += records.len();
    }

    println!("\n=== TOTALS ===");
    println!("Quarantined rows: {}", total_rows);
    for (rule, count) in &rule_totals {
        println!("  {:<22} {}", rule, count);
    }

    Ok(())
}
