//! Fallback Chain
//!
//! Traverses an ordered `(provider, model)` list. Each entry gets up to
//! `max_retries` attempts with exponential backoff and jitter; the chain
//! moves on when retries are exhausted or the error is non-retryable, and
//! returns the last seen error once every entry has failed.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreakerRegistry;
use crate::config::ResilienceConfig;
use crate::providers::{LlmError, LlmProvider, LlmRequest, LlmResponse, ProviderSet};
use crate::routing::ModelRef;

/// Jitter added to every backoff sleep, milliseconds.
const JITTER_MAX_MS: u64 = 1000;

/// What happened to one chain entry that did not succeed.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub entry: ModelRef,
    /// Attempts actually placed against the provider. Zero for circuit
    /// fast-fails.
    pub attempts: u32,
    pub error: LlmError,
}

/// The result of one chain traversal.
#[derive(Debug)]
pub struct ChainResult {
    /// The successful response, if any entry succeeded.
    pub response: Option<LlmResponse>,
    /// Failed entries in traversal order.
    pub failures: Vec<AttemptOutcome>,
}

impl ChainResult {
    /// The last seen error. Only meaningful when `response` is `None`.
    pub fn last_error(&self) -> Option<&LlmError> {
        self.failures.last().map(|f| &f.error)
    }
}

/// Retry/backoff executor over a fallback list, with every provider wrapped
/// in its circuit breaker.
pub struct FallbackChain {
    config: ResilienceConfig,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl FallbackChain {
    pub fn new(config: ResilienceConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { config, breakers }
    }

    /// Run the chain. `request.model` is overwritten per entry.
    pub async fn execute(
        &self,
        entries: &[ModelRef],
        request: &LlmRequest,
        providers: &ProviderSet,
    ) -> ChainResult {
        let mut failures = Vec::new();

        for entry in entries {
            let breaker = self.breakers.breaker(entry.provider);
            let Some(adapter) = providers.get(entry.provider) else {
                warn!(provider = %entry.provider, "no adapter registered; skipping entry");
                failures.push(AttemptOutcome {
                    entry: entry.clone(),
                    attempts: 0,
                    error: LlmError::new(
                        entry.provider,
                        &entry.model,
                        crate::providers::LlmErrorKind::ModelUnavailable,
                        false,
                        "no adapter registered for provider",
                    ),
                });
                continue;
            };

            let mut entry_request = request.clone();
            entry_request.model = entry.model.clone();

            match self
                .run_entry(entry, adapter.as_ref(), &breaker, &entry_request)
                .await
            {
                Ok(response) => {
                    return ChainResult {
                        response: Some(response),
                        failures,
                    };
                }
                Err(outcome) => failures.push(outcome),
            }
        }

        ChainResult {
            response: None,
            failures,
        }
    }

    /// Attempt one entry up to `max_retries` times. A fresh attempt counter
    /// per entry; retries never carry across entries.
    async fn run_entry(
        &self,
        entry: &ModelRef,
        adapter: &dyn LlmProvider,
        breaker: &super::circuit_breaker::CircuitBreaker,
        request: &LlmRequest,
    ) -> Result<LlmResponse, AttemptOutcome> {
        let mut attempts = 0u32;
        let mut last_error: Option<LlmError> = None;

        while attempts < self.config.max_retries {
            if !breaker.try_acquire() {
                debug!(provider = %entry.provider, "circuit open; failing entry fast");
                return Err(AttemptOutcome {
                    entry: entry.clone(),
                    attempts,
                    error: LlmError::circuit_open(entry.provider, &entry.model),
                });
            }

            match adapter.invoke(request).await {
                Ok(response) => {
                    breaker.record_success();
                    if attempts > 0 {
                        debug!(
                            provider = %entry.provider,
                            model = %entry.model,
                            attempts = attempts + 1,
                            "entry succeeded after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(err) => {
                    breaker.record_failure();
                    attempts += 1;
                    let exhausted = attempts >= self.config.max_retries;
                    if !err.retryable || exhausted {
                        warn!(
                            provider = %entry.provider,
                            model = %entry.model,
                            attempts,
                            error = %err,
                            "entry failed; moving to next fallback"
                        );
                        return Err(AttemptOutcome {
                            entry: entry.clone(),
                            attempts,
                            error: err,
                        });
                    }
                    let delay = self.backoff_delay(attempts - 1);
                    debug!(
                        provider = %entry.provider,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure; backing off"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        // Loop exit without return only happens when max_retries is zero.
        Err(AttemptOutcome {
            entry: entry.clone(),
            attempts,
            error: last_error.unwrap_or_else(|| {
                LlmError::new(
                    entry.provider,
                    &entry.model,
                    crate::providers::LlmErrorKind::ApiError,
                    false,
                    "no attempts configured",
                )
            }),
        })
    }

    /// `min(base * 2^attempt + jitter(0..1000ms), max_delay)`
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .config
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..JITTER_MAX_MS);
        Duration::from_millis((exponential + jitter).min(self.config.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LlmErrorKind, MockProvider, Provider};
    use crate::routing::ModelRef;

    fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: 5,
            reset_timeout_secs: 300,
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            provider_timeout_secs: 30,
        }
    }

    fn chain(config: ResilienceConfig) -> (FallbackChain, Arc<CircuitBreakerRegistry>) {
        let registry = Arc::new(CircuitBreakerRegistry::new(&config));
        (FallbackChain::new(config, registry.clone()), registry)
    }

    fn request() -> LlmRequest {
        LlmRequest {
            model: "placeholder".into(),
            prompt: "hi".into(),
            system_prompt: None,
            max_tokens: 100,
            temperature: 0.5,
            image: None,
            is_vision: false,
        }
    }

    #[tokio::test]
    async fn primary_success_stops_the_chain() {
        let (chain, _) = chain(fast_config());
        let primary = Arc::new(MockProvider::new(Provider::Anthropic));
        let fallback = Arc::new(MockProvider::new(Provider::OpenAi));
        let providers = ProviderSet::new()
            .with(primary.clone())
            .with(fallback.clone());

        let entries = vec![
            ModelRef::new(Provider::Anthropic, "claude-sonnet-4-20250514"),
            ModelRef::new(Provider::OpenAi, "gpt-4o"),
        ];
        let result = chain.execute(&entries, &request(), &providers).await;

        assert!(result.response.is_some());
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 0);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn retryable_errors_retry_within_the_entry() {
        let (chain, _) = chain(fast_config());
        let primary = Arc::new(MockProvider::new(Provider::OpenAi));
        primary.push_failure(LlmErrorKind::RateLimit, true);
        primary.push_failure(LlmErrorKind::RateLimit, true);
        // Third attempt succeeds (empty script yields default success).
        let providers = ProviderSet::new().with(primary.clone());

        let entries = vec![ModelRef::new(Provider::OpenAi, "gpt-4o")];
        let result = chain.execute(&entries, &request(), &providers).await;

        assert!(result.response.is_some());
        assert_eq!(primary.call_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_moves_to_next_entry_immediately() {
        let (chain, _) = chain(fast_config());
        let primary = Arc::new(MockProvider::new(Provider::OpenAi));
        primary.push_failure(LlmErrorKind::InvalidRequest, false);
        let fallback = Arc::new(MockProvider::new(Provider::Google));
        let providers = ProviderSet::new()
            .with(primary.clone())
            .with(fallback.clone());

        let entries = vec![
            ModelRef::new(Provider::OpenAi, "gpt-4o"),
            ModelRef::new(Provider::Google, "gemini-2.0-flash"),
        ];
        let result = chain.execute(&entries, &request(), &providers).await;

        assert!(result.response.is_some());
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let (chain, _) = chain(fast_config());
        let a = Arc::new(MockProvider::new(Provider::OpenAi));
        let b = Arc::new(MockProvider::new(Provider::Google));
        for _ in 0..3 {
            a.push_failure(LlmErrorKind::ApiError, true);
        }
        b.push_failure(LlmErrorKind::InvalidRequest, false);
        let providers = ProviderSet::new().with(a.clone()).with(b.clone());

        let entries = vec![
            ModelRef::new(Provider::OpenAi, "gpt-4o"),
            ModelRef::new(Provider::Google, "gemini-2.0-flash"),
        ];
        let result = chain.execute(&entries, &request(), &providers).await;

        assert!(result.response.is_none());
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.last_error().unwrap().kind, LlmErrorKind::InvalidRequest);
        assert_eq!(a.call_count(), 3);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test]
    async fn open_circuit_fast_fails_the_entry_with_zero_attempts() {
        let config = fast_config();
        let (chain, registry) = chain(config);
        registry.breaker(Provider::Anthropic).trip();

        let primary = Arc::new(MockProvider::new(Provider::Anthropic));
        let fallback = Arc::new(MockProvider::new(Provider::OpenAi));
        let providers = ProviderSet::new()
            .with(primary.clone())
            .with(fallback.clone());

        let entries = vec![
            ModelRef::new(Provider::Anthropic, "claude-sonnet-4-20250514"),
            ModelRef::new(Provider::OpenAi, "gpt-4o"),
        ];
        let result = chain.execute(&entries, &request(), &providers).await;

        assert!(result.response.is_some());
        assert_eq!(primary.call_count(), 0);
        assert_eq!(fallback.call_count(), 1);
        assert_eq!(result.failures[0].attempts, 0);
        assert_eq!(result.failures[0].error.kind, LlmErrorKind::CircuitOpen);
    }

    #[test]
    fn backoff_is_bounded_by_max_delay() {
        let (chain, _) = chain(ResilienceConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 30_000,
            ..fast_config()
        });
        for attempt in 0..10 {
            assert!(chain.backoff_delay(attempt) <= Duration::from_millis(30_000));
        }
    }
}
