#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use review_warehouse::Pipeline;
use review_warehouse::config::PipelineConfig;
use review_warehouse::loader::AuditRecorder;
use review_warehouse::models::LoadAudit;
use review_warehouse::storage::Warehouse;
use tempfile::TempDir;

pub const HEADER: &str = "Review Id,Reviewer Id,Business Id,Review Rating,Review Date,Review Title,\
Review Content,Review IP Address,Email Address,Reviewer Name,Reviewer Country,Business Name";

/// One export row with plausible optional columns.
pub fn review_line(review_id: &str, user_id: &str, business_id: &str, rating: &str, date: &str) -> String {
    format!(
        "{review_id},{user_id},{business_id},{rating},{date},Title {review_id},Content for {review_id},\
10.0.0.1,{user_id}@example.com,Name {user_id},gb,Business {business_id}"
    )
}

/// An isolated workspace: raw inputs, stage, quarantine and warehouse under one tempdir.
pub struct Fixture {
    pub dir: TempDir,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed creating tempdir");
        let root = dir.path();

        let mut config = PipelineConfig::default();
        config.discovery.patterns = vec![
            format!("{}/raw/*.csv", root.display()),
            format!("{}/raw/*.xlsx", root.display()),
        ];
        config.paths.warehouse = root.join("warehouse.db");
        config.paths.stage_dir = root.join("stage");
        config.paths.quarantine_dir = root.join("quarantine");

        fs::create_dir_all(root.join("raw")).expect("failed creating raw dir");
        Self { dir, config }
    }

    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("raw").join(name)
    }

    /// Write a CSV export with the standard header.
    pub fn write_source(&self, name: &str, lines: &[String]) -> PathBuf {
        let mut body = String::from(HEADER);
        body.push('\n');
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        let path = self.raw_path(name);
        fs::write(&path, body).expect("failed writing source file");
        path
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.config.clone()).expect("failed creating pipeline")
    }

    pub fn warehouse(&self) -> Warehouse {
        Warehouse::open(&self.config.paths.warehouse).expect("failed opening warehouse")
    }

    pub fn audit(&self) -> Vec<LoadAudit> {
        AuditRecorder::entries(self.warehouse().connection()).expect("failed reading audit")
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.warehouse()
            .connection()
            .query_row(sql, [], |row| row.get(0))
            .expect("count query failed")
    }
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            files.sort();
            files
        }
        Err(_) => Vec::new(),
    }
}
