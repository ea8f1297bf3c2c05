//! Resilience Patterns
//!
//! Per-provider circuit breaking and the fallback chain that traverses a
//! routing row's `(provider, model)` entries with retries and backoff.

pub mod circuit_breaker;
pub mod fallback;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use fallback::{AttemptOutcome, ChainResult, FallbackChain};
