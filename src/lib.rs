pub mod config;
pub mod errors;
pub mod fetcher;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod storage;

pub use errors::{PipelineError, Result};
pub use pipeline::{IngestSummary, Pipeline, RunReport};
