pub mod file_fetcher;

pub use file_fetcher::*;
