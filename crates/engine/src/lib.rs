//! Core of the detection-and-delivery pipeline: ports, retry, idempotency,
//! delivery fan-out and the store implementations.

pub mod enqueuer;
pub mod hash;
pub mod idempotency;
pub mod memory;
pub mod pg_store;
pub mod ports;
pub mod requeue;
pub mod retry;

pub use enqueuer::DeliveryEnqueuer;
pub use idempotency::{ClaimPolicy, GuardOutcome, IdempotencyGuard, IdempotencyStore};
pub use requeue::RequeuePolicy;
pub use retry::RetryPolicy;
