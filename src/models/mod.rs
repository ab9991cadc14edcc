pub mod records;
pub mod warehouse;

pub use records::*;
pub use warehouse::*;
