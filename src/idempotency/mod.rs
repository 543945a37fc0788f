//! Exactly-once execution for client-initiated operations.
//!
//! [`ResponseCache`] lets a boundary layer replay a response when a client
//! retries with the same key. [`IdempotencyCoordinator`] collapses concurrent
//! executions of the same logical operation into one.

pub mod coordinator;
pub mod response_cache;

pub use coordinator::{CoordinatorStats, IdempotencyCoordinator};
pub use response_cache::{validate_idempotency_key, CachedResponse, ResponseCache, DEFAULT_RESPONSE_TTL};
