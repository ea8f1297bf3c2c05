//! Scriptable Mock Provider
//!
//! Stands in for a vendor adapter in tests and local runs. Outcomes are
//! scripted in FIFO order; an empty script yields a canned success.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{LlmError, LlmErrorKind, LlmProvider, LlmRequest, LlmResponse, Provider};
use crate::models::TokenUsage;

enum MockOutcome {
    Success { content: String, usage: TokenUsage, cost: f64 },
    Failure { kind: LlmErrorKind, retryable: bool },
}

pub struct MockProvider {
    id: Provider,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicU64,
    default_cost: f64,
}

impl MockProvider {
    pub fn new(id: Provider) -> Self {
        Self {
            id,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            default_cost: 0.001,
        }
    }

    /// Cost reported by unscripted (default) successes.
    pub fn with_default_cost(mut self, cost: f64) -> Self {
        self.default_cost = cost;
        self
    }

    pub fn push_success(&self, content: &str, cost: f64) {
        self.script.lock().push_back(MockOutcome::Success {
            content: content.to_string(),
            usage: TokenUsage::new(100, 50),
            cost,
        });
    }

    pub fn push_failure(&self, kind: LlmErrorKind, retryable: bool) {
        self.script
            .lock()
            .push_back(MockOutcome::Failure { kind, retryable });
    }

    /// Number of invocations observed so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn id(&self) -> Provider {
        self.id
    }

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front();
        match outcome {
            Some(MockOutcome::Failure { kind, retryable }) => Err(LlmError::new(
                self.id,
                &request.model,
                kind,
                retryable,
                "scripted failure",
            )),
            Some(MockOutcome::Success { content, usage, cost }) => Ok(LlmResponse {
                content,
                usage,
                latency_ms: 5,
                estimated_cost: cost,
                provider: self.id,
                model: request.model.clone(),
            }),
            None => Ok(LlmResponse {
                content: "mock response".to_string(),
                usage: TokenUsage::new(100, 50),
                latency_ms: 5,
                estimated_cost: self.default_cost,
                provider: self.id,
                model: request.model.clone(),
            }),
        }
    }
}
