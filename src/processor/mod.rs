pub mod date_parser;
pub mod dq_validator;
pub mod schema_normalizer;

pub use date_parser::*;
pub use dq_validator::*;
pub use schema_normalizer::{HeaderMap, SchemaNormalizer};
