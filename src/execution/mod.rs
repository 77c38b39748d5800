pub mod executor;
pub mod idempotency;

pub use executor::{ExecutionResult, OrderExecutor};
pub use idempotency::{IdempotencyManager, RequestStatus};
