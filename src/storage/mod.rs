pub mod projections;
pub mod quarantine_store;
pub mod run_lock;
pub mod stage_writer;
pub mod warehouse;

pub use quarantine_store::QuarantineStore;
pub use run_lock::RunLock;
pub use stage_writer::*;
pub use warehouse::*;
