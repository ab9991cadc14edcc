use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, Result};
use crate::loader::aggregates::PeriodWidth;
use crate::processor::{DatePolicy, DedupePolicy};

pub const DEFAULT_CONFIG_PATH: &str = "src/configs/pipeline.toml";
pub const ENV_PREFIX: &str = "REVIEWS";
/// One hundred years.
pub const MAX_FUTURE_TOLERANCE_HOURS: i64 = 8760 * 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub discovery: DiscoveryConfig,
    pub paths: PathsConfig,
    pub normalize: NormalizeConfig,
    pub dq: DqConfig,
    pub stage: StageConfig,
    pub aggregation: AggregationConfig,
    pub run: RunConfig,
}

/// Glob patterns for source files. A file matched by several patterns is
/// processed once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub warehouse: PathBuf,
    pub stage_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    /// Defaults to the warehouse path with a `.lock` extension.
    pub lock_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub date_policy: DatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DqConfig {
    /// Fraction of quarantined rows above which a run is marked degraded.
    pub quarantine_rate_threshold: f64,
    pub future_tolerance_hours: i64,
    pub dedupe_policy: DedupePolicy,
    /// Validate email format. Absent emails are always accepted.
    pub enforce_email: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Write Parquet; when false, or when Parquet fails, CSV is written.
    pub columnar: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub period: PeriodWidth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_parallel_files: usize,
}

impl PipelineConfig {
    /// Load a TOML file as-is, without environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: PipelineConfig = toml::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration: built-in defaults, then the TOML file (the
    /// default path is optional, an explicit one is required), then
    /// `REVIEWS_*` environment variables such as `REVIEWS_DQ__DEDUPE_POLICY`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("discovery.patterns")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let config: PipelineConfig = settings
            .try_deserialize()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery.patterns.iter().all(|p| p.trim().is_empty()) {
            return Err(PipelineError::Config(
                "At least one discovery pattern is required".to_string(),
            ));
        }

        let threshold = self.dq.quarantine_rate_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::Config(format!(
                "dq.quarantine_rate_threshold must be within [0, 1], got {}",
                threshold
            )));
        }

        if !(0..=MAX_FUTURE_TOLERANCE_HOURS).contains(&self.dq.future_tolerance_hours) {
            return Err(PipelineError::Config(format!(
                "dq.future_tolerance_hours must be within [0, {}], got {}",
                MAX_FUTURE_TOLERANCE_HOURS, self.dq.future_tolerance_hours
            )));
        }

        if self.run.max_parallel_files == 0 {
            return Err(PipelineError::Config(
                "run.max_parallel_files must be at least 1".to_string(),
            ));
        }

        if self.paths.warehouse.as_os_str().is_empty() {
            return Err(PipelineError::Config("paths.warehouse cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl PathsConfig {
    pub fn lock_path(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.warehouse.with_extension("lock"))
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            patterns: vec![
                "data/raw/*.xlsx".to_string(),
                "data/raw/*.csv".to_string(),
            ],
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            warehouse: PathBuf::from("data/warehouse.db"),
            stage_dir: PathBuf::from("data/stage"),
            quarantine_dir: PathBuf::from("data/quarantine"),
            lock_file: None,
        }
    }
}

impl Default for DqConfig {
    fn default() -> Self {
        Self {
            quarantine_rate_threshold: 0.2,
            future_tolerance_hours: 24,
            dedupe_policy: DedupePolicy::RetainFirst,
            enforce_email: true,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self { columnar: true }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel_files: 4,
        }
    }
}
