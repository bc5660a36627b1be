//! Failure isolation and at-most-once execution.

mod circuit_breaker;
mod idempotency;

pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitState, ROTATION_STORE_BREAKER, VALIDATOR_BREAKER,
};
pub use idempotency::{IdempotencyCheck, IdempotencyGuard, IdempotencyRecord};
