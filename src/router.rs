//! Request Router
//!
//! Binds the routing tables, provider adapters, fallback chain, budget gate,
//! and cost tracker into the governed call path. Ordering is contractual:
//! budget pre-flight, preference resolution, table selection, fallback
//! traversal, then transactional deduction and usage recording.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::BudgetGate;
use crate::config::TierPolicy;
use crate::error::ApiError;
use crate::models::{
    current_period, period_reset_at, BudgetStatus, CallMetadata, LlmCallRecord,
    RoutingPreference, Tier, TokenUsage,
};
use crate::pricing::PricingTable;
use crate::providers::{ImageData, LlmErrorKind, LlmRequest, LlmResponse, Provider, ProviderSet};
use crate::resilience::FallbackChain;
use crate::routing::{canonicalize_request_type, DegradedTable, ModelRef, Route, RoutingTable};
use crate::tracking::CostTracker;

/// Token counts used for the pre-call cost guard: a representative request
/// of 1000 input and 500 output tokens.
const GUARD_INPUT_TOKENS: u32 = 1000;
const GUARD_OUTPUT_TOKENS: u32 = 500;

/// Caller-supplied routing options.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Overrides the global preference. `Degraded` is not accepted here.
    pub preference_override: Option<RoutingPreference>,
    /// Replaces the selected primary model; provider inferred from the name.
    pub model_override: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// When false, only the primary entry is attempted.
    pub fallback_disabled: bool,
}

/// One governed AI request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub uid: String,
    pub tier: Tier,
    /// Raw request type; legacy aliases are accepted and normalized.
    pub request_type: String,
    pub prompt: String,
    pub image: Option<ImageData>,
    pub feature: Option<String>,
    pub options: RouteOptions,
}

/// The governed response returned to the HTTP layer.
#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub request_id: String,
    pub content: String,
    pub provider: Provider,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub routing_preference: RoutingPreference,
    pub preference_downgraded: bool,
}

pub struct LlmRouter {
    table: Arc<RoutingTable>,
    degraded: Arc<DegradedTable>,
    pricing: Arc<PricingTable>,
    providers: ProviderSet,
    chain: FallbackChain,
    budget: Arc<dyn BudgetGate>,
    tracker: Arc<CostTracker>,
    tiers: TierPolicy,
    global_preference: RoutingPreference,
}

impl LlmRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: Arc<RoutingTable>,
        degraded: Arc<DegradedTable>,
        pricing: Arc<PricingTable>,
        providers: ProviderSet,
        chain: FallbackChain,
        budget: Arc<dyn BudgetGate>,
        tracker: Arc<CostTracker>,
        tiers: TierPolicy,
        global_preference: RoutingPreference,
    ) -> Self {
        Self {
            table,
            degraded,
            pricing,
            providers,
            chain,
            budget,
            tracker,
            tiers,
            global_preference,
        }
    }

    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse, ApiError> {
        let request_type = canonicalize_request_type(&request.request_type).ok_or_else(|| {
            ApiError::InvalidRequest(format!("unknown request type: {}", request.request_type))
        })?;
        let meta = CallMetadata {
            request_id: Uuid::new_v4().to_string(),
            uid: request.uid.clone(),
            request_type,
            feature: request.feature.clone(),
        };

        // 1. Budget pre-flight. Fail-safe inside the gate: errors come back
        //    as blocked.
        let check = self.budget.check(&request.uid).await;
        if !check.allowed {
            return Err(ApiError::AiBudgetExhausted {
                reset_at: Some(period_reset_at(&current_period(Utc::now()))),
            });
        }

        // 2. Resolve the active preference and the route.
        let mut active = request
            .options
            .preference_override
            .unwrap_or(self.global_preference);
        let mut preference_downgraded = false;

        let (route, routing_preference) = if check.status == BudgetStatus::Degraded {
            match self.degraded.get(&meta.request_type) {
                Some(route) => {
                    preference_downgraded = true;
                    (route.clone(), RoutingPreference::Degraded)
                }
                None => {
                    // No degraded row for this task; force cost routing.
                    preference_downgraded = active != RoutingPreference::Cost;
                    active = RoutingPreference::Cost;
                    (self.select_normal(&meta.request_type, active)?, active)
                }
            }
        } else {
            if check.routing == RoutingPreference::Cost && active != RoutingPreference::Cost {
                preference_downgraded = true;
                active = RoutingPreference::Cost;
            }
            (self.select_normal(&meta.request_type, active)?, active)
        };

        // 3. Apply the model override, inferring its provider.
        let mut entries = route.entries();
        if let Some(model) = &request.options.model_override {
            let provider = Provider::infer_from_model(model).ok_or_else(|| {
                ApiError::InvalidRequest(format!("cannot infer provider for model: {model}"))
            })?;
            entries[0] = ModelRef {
                provider,
                model: model.clone(),
            };
        }
        if request.options.fallback_disabled {
            entries.truncate(1);
        }

        // 4. Pre-call cost guard against the tier's per-call cap.
        let cap = self.tiers.limits(request.tier).max_cost_per_call;
        let guarded: Vec<ModelRef> = entries
            .into_iter()
            .filter(|entry| {
                let estimate = self.pricing.estimate(
                    entry.provider,
                    &entry.model,
                    GUARD_INPUT_TOKENS,
                    GUARD_OUTPUT_TOKENS,
                );
                if estimate > cap {
                    debug!(
                        provider = %entry.provider,
                        model = %entry.model,
                        estimate,
                        cap,
                        "skipping entry over per-call cost cap"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        if guarded.is_empty() {
            return Err(ApiError::RequestTooExpensive);
        }

        // 5. Traverse the fallback chain.
        let llm_request = self.build_request(&request, &route);
        let outcome = self
            .chain
            .execute(&guarded, &llm_request, &self.providers)
            .await;

        // Failed entries are audited regardless of the final outcome.
        for failure in &outcome.failures {
            self.tracker
                .record(&failure_record(
                    &meta,
                    &failure.entry,
                    &failure.error,
                    routing_preference,
                    preference_downgraded,
                ))
                .await;
        }

        match outcome.response {
            Some(response) => {
                self.settle(&meta, &response, routing_preference, preference_downgraded)
                    .await;
                info!(
                    request_id = %meta.request_id,
                    uid = %meta.uid,
                    request_type = %meta.request_type,
                    provider = %response.provider,
                    model = %response.model,
                    cost_usd = response.estimated_cost,
                    "ai request completed"
                );
                Ok(RouteResponse {
                    request_id: meta.request_id,
                    content: response.content,
                    provider: response.provider,
                    model: response.model,
                    usage: response.usage,
                    cost_usd: response.estimated_cost,
                    latency_ms: response.latency_ms,
                    routing_preference,
                    preference_downgraded,
                })
            }
            None => {
                let last = outcome.failures.last();
                match last {
                    Some(failure) if failure.error.kind == LlmErrorKind::InvalidRequest => {
                        Err(ApiError::InvalidRequest(failure.error.message.clone()))
                    }
                    Some(failure) => Err(ApiError::ProviderError(failure.error.to_string())),
                    None => Err(ApiError::ProviderError("no routable entries".to_string())),
                }
            }
        }
    }

    fn select_normal(
        &self,
        request_type: &str,
        preference: RoutingPreference,
    ) -> Result<Route, ApiError> {
        self.table
            .get(request_type)
            .map(|set| set.select(preference).clone())
            .ok_or_else(|| {
                ApiError::InvalidRequest(format!("unknown request type: {request_type}"))
            })
    }

    fn build_request(&self, request: &RouteRequest, route: &Route) -> LlmRequest {
        LlmRequest {
            // The chain overwrites the model per entry.
            model: route.primary.model.clone(),
            prompt: request.prompt.clone(),
            system_prompt: Some(route.defaults.system_prompt.clone()),
            max_tokens: request.options.max_tokens.unwrap_or(route.defaults.max_tokens),
            temperature: request
                .options
                .temperature
                .unwrap_or(route.defaults.temperature),
            image: request.image.clone(),
            is_vision: route.defaults.is_vision,
        }
    }

    /// Post-flight settlement: transactional deduction, then the success
    /// record. Runs on a spawned task so a cancelled handler cannot leave a
    /// successful call unbilled; deduction failures are logged, never
    /// surfaced.
    async fn settle(
        &self,
        meta: &CallMetadata,
        response: &LlmResponse,
        routing_preference: RoutingPreference,
        preference_downgraded: bool,
    ) {
        let budget = self.budget.clone();
        let tracker = self.tracker.clone();
        let record = success_record(meta, response, routing_preference, preference_downgraded);
        let uid = meta.uid.clone();
        let request_type = meta.request_type.clone();
        let model = response.model.clone();
        let cost = response.estimated_cost;

        let task = tokio::spawn(async move {
            if let Err(err) = budget.deduct(&uid, cost, &request_type, &model).await {
                warn!(
                    uid,
                    cost_usd = cost,
                    error = %err,
                    "deduction failed after successful call; budget may undercount"
                );
            }
            tracker.record(&record).await;
        });
        // Await completion, but the task finishes even if we are dropped.
        let _ = task.await;
    }
}

fn success_record(
    meta: &CallMetadata,
    response: &LlmResponse,
    routing_preference: RoutingPreference,
    preference_downgraded: bool,
) -> LlmCallRecord {
    LlmCallRecord {
        request_id: meta.request_id.clone(),
        uid: meta.uid.clone(),
        request_type: meta.request_type.clone(),
        provider: response.provider,
        model: response.model.clone(),
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        cost_usd: response.estimated_cost,
        latency_ms: response.latency_ms,
        success: true,
        error: None,
        routing_preference,
        preference_downgraded,
        timestamp: Utc::now(),
    }
}

fn failure_record(
    meta: &CallMetadata,
    entry: &ModelRef,
    error: &crate::providers::LlmError,
    routing_preference: RoutingPreference,
    preference_downgraded: bool,
) -> LlmCallRecord {
    LlmCallRecord {
        request_id: meta.request_id.clone(),
        uid: meta.uid.clone(),
        request_type: meta.request_type.clone(),
        provider: entry.provider,
        model: entry.model.clone(),
        input_tokens: 0,
        output_tokens: 0,
        cost_usd: 0.0,
        latency_ms: 0,
        success: false,
        error: Some(error.kind.as_str().to_string()),
        routing_preference,
        preference_downgraded,
        timestamp: Utc::now(),
    }
}
