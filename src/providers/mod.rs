//! LLM Provider Adapters
//!
//! Each adapter exposes a uniform `invoke` over one vendor API and
//! classifies vendor failures into the canonical [`LlmErrorKind`] set. The
//! classification policy is contractual:
//!
//! - HTTP 429 or a quota message: `rate_limit`, retryable
//! - HTTP 5xx / network / timeout: retryable
//! - other HTTP 4xx and safety blocks: non-retryable
//! - unknown model: `model_unavailable`, non-retryable for the entry

pub mod anthropic;
pub mod google;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::models::TokenUsage;

/// Upstream vendors. Circuit breakers and adapters key on this.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
        }
    }

    /// Infer the provider from a model name prefix. Used by the router's
    /// model override path.
    pub fn infer_from_model(model: &str) -> Option<Provider> {
        if model.starts_with("claude") {
            Some(Provider::Anthropic)
        } else if model.starts_with("gpt") || model.starts_with("o3") || model.starts_with("o4") {
            Some(Provider::OpenAi)
        } else if model.starts_with("gemini") {
            Some(Provider::Google)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical provider error classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    RateLimit,
    ApiError,
    Timeout,
    InvalidRequest,
    InsufficientQuota,
    ModelUnavailable,
    NetworkError,
    BudgetExceeded,
    /// Injected by the circuit breaker, never by an adapter.
    CircuitOpen,
}

impl LlmErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorKind::RateLimit => "rate_limit",
            LlmErrorKind::ApiError => "api_error",
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::InvalidRequest => "invalid_request",
            LlmErrorKind::InsufficientQuota => "insufficient_quota",
            LlmErrorKind::ModelUnavailable => "model_unavailable",
            LlmErrorKind::NetworkError => "network_error",
            LlmErrorKind::BudgetExceeded => "budget_exceeded",
            LlmErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, Error)]
#[error("{provider}/{model}: {} ({message})", .kind.as_str())]
pub struct LlmError {
    pub provider: Provider,
    pub model: String,
    pub kind: LlmErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl LlmError {
    pub fn new(
        provider: Provider,
        model: &str,
        kind: LlmErrorKind,
        retryable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.to_string(),
            kind,
            retryable,
            message: message.into(),
        }
    }

    pub fn circuit_open(provider: Provider, model: &str) -> Self {
        Self::new(
            provider,
            model,
            LlmErrorKind::CircuitOpen,
            false,
            "circuit open",
        )
    }
}

/// Inline image payload for vision requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    pub base64: String,
    pub mime_type: String,
}

/// One provider invocation.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub image: Option<ImageData>,
    pub is_vision: bool,
}

/// A successful provider response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub estimated_cost: f64,
    pub provider: Provider,
    pub model: String,
}

/// Uniform invocation capability over one vendor.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> Provider;

    async fn invoke(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// The adapters available to the router, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderSet {
    adapters: HashMap<Provider, Arc<dyn LlmProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn LlmProvider>) -> Self {
        self.adapters.insert(adapter.id(), adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<&Arc<dyn LlmProvider>> {
        self.adapters.get(&provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = Provider> + '_ {
        self.adapters.keys().copied()
    }
}

/// Map an HTTP failure status to the canonical error classification.
pub(crate) fn classify_http_status(
    provider: Provider,
    model: &str,
    status: u16,
    body: &str,
) -> LlmError {
    let lowered = body.to_ascii_lowercase();
    if status == 429 || lowered.contains("rate limit") || lowered.contains("quota") {
        return LlmError::new(provider, model, LlmErrorKind::RateLimit, true, body);
    }
    if status == 404 || lowered.contains("model not found") || lowered.contains("unknown model") {
        return LlmError::new(provider, model, LlmErrorKind::ModelUnavailable, false, body);
    }
    if (400..500).contains(&status) {
        let kind = if status == 402 || lowered.contains("billing") || lowered.contains("payment") {
            LlmErrorKind::InsufficientQuota
        } else {
            LlmErrorKind::InvalidRequest
        };
        return LlmError::new(provider, model, kind, false, body);
    }
    LlmError::new(provider, model, LlmErrorKind::ApiError, true, body)
}

/// Map a reqwest transport failure to the canonical classification.
pub(crate) fn classify_transport_error(
    provider: Provider,
    model: &str,
    err: &reqwest::Error,
) -> LlmError {
    if err.is_timeout() {
        LlmError::new(provider, model, LlmErrorKind::Timeout, true, err.to_string())
    } else {
        LlmError::new(
            provider,
            model,
            LlmErrorKind::NetworkError,
            true,
            err.to_string(),
        )
    }
}

/// Refuse vision requests on models that cannot accept images.
pub(crate) fn reject_vision_if_unsupported(
    provider: Provider,
    request: &LlmRequest,
    model_supports_vision: bool,
) -> Result<(), LlmError> {
    if request.is_vision && !model_supports_vision {
        return Err(LlmError::new(
            provider,
            &request.model,
            LlmErrorKind::InvalidRequest,
            false,
            format!("model {} does not accept image input", request.model),
        ));
    }
    if request.is_vision && request.image.is_none() {
        return Err(LlmError::new(
            provider,
            &request.model,
            LlmErrorKind::InvalidRequest,
            false,
            "vision request is missing imageData",
        ));
    }
    Ok(())
}
