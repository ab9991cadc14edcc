pub mod aggregates;
pub mod audit;
pub mod idempotency;
pub mod upserter;

pub use aggregates::{PeriodKey, PeriodWidth};
pub use audit::AuditRecorder;
pub use idempotency::*;
pub use upserter::*;
