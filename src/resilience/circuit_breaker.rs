//! Circuit Breaker Implementation
//!
//! Prevents cascading failures by failing fast on a provider whose
//! consecutive failure count crosses the threshold. Per provider, not per
//! model.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::ResilienceConfig;
use crate::providers::Provider;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// Exactly one probe call may proceed.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-provider breaker. Transitions and counter updates are serialized
/// behind one short-lived lock.
pub struct CircuitBreaker {
    provider: Provider,
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(provider: Provider, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            provider,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Ask to place a call. An open circuit whose reset timeout has elapsed
    /// moves to half-open and admits the caller as its single probe.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(provider = %self.provider, "circuit transitioning to half-open");
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::HalfOpen => {
                info!(provider = %self.provider, "circuit closing after successful probe");
                state.state = CircuitState::Closed;
                state.failure_count = 0;
                state.opened_at = None;
                state.probe_in_flight = false;
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        failures = state.failure_count,
                        "circuit opening"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(provider = %self.provider, "circuit reopening after failed probe");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Force the circuit open, as if the threshold had just been crossed.
    /// Admin and test hook.
    pub fn trip(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.probe_in_flight = false;
    }
}

/// One breaker per provider, created lazily with shared tunables.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<Provider, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_secs(config.reset_timeout_secs),
        }
    }

    pub fn breaker(&self, provider: Provider) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider,
                    self.failure_threshold,
                    self.reset_timeout,
                ))
            })
            .clone()
    }
}
