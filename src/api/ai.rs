//! Governed AI Endpoint
//!
//! `POST /api/v1/ai` runs the full pipeline: app entitlement, daily AI
//! quota, tier rate limits, budget pre-flight, routed invocation, and
//! post-flight accounting.

use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::models::{Quota, RoutingPreference, TokenUsage};
use crate::providers::ImageData;
use crate::router::{RouteOptions, RouteRequest};
use crate::routing::{app_of_request_type, canonicalize_request_type};

const AI_ENDPOINT: &str = "/api/v1/ai";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiRequestBody {
    pub request_type: String,
    pub prompt: String,
    #[serde(default)]
    pub image_data: Option<ImageData>,
    #[serde(default)]
    pub options: AiOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiOptions {
    /// `quality`, `balanced`, or `cost`.
    pub preference: Option<String>,
    pub model_override: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub fallback_enabled: Option<bool>,
    pub feature: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponseBody {
    pub request_id: String,
    pub content: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub routing_preference: RoutingPreference,
    pub preference_downgraded: bool,
}

pub async fn invoke(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<AiRequestBody>,
) -> Result<Response, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::InvalidRequest("prompt must not be empty".into()));
    }
    let request_type = canonicalize_request_type(&body.request_type).ok_or_else(|| {
        ApiError::InvalidRequest(format!("unknown request type: {}", body.request_type))
    })?;
    let app = app_of_request_type(&request_type)
        .ok_or_else(|| ApiError::InvalidRequest("request type has no app".into()))?;
    ctx.ensure_app(app)?;

    // Per-app daily AI quota.
    let per_day = ctx
        .entitlements
        .apps
        .get(&app)
        .map(|a| a.ai_queries_per_day)
        .unwrap_or(Quota::Limit(0));
    let quota = state.quota.reserve(&ctx.uid, app, per_day).await?;

    // Tier rate buckets. A denial here skips the budget pipeline entirely.
    state
        .limiter
        .check(&ctx.uid, AI_ENDPOINT, ctx.tier, Utc::now())
        .map_err(|denied| ApiError::RateLimitExceeded {
            kind: denied.kind,
            reset_at: denied.reset_at,
        })?;

    let preference_override = match body.options.preference.as_deref() {
        None => None,
        Some("quality") => Some(RoutingPreference::Quality),
        Some("balanced") => Some(RoutingPreference::Balanced),
        Some("cost") => Some(RoutingPreference::Cost),
        Some(other) => {
            return Err(ApiError::InvalidRequest(format!(
                "unknown preference: {other}"
            )))
        }
    };

    let routed = state
        .router
        .route(RouteRequest {
            uid: ctx.uid.clone(),
            tier: ctx.tier,
            request_type: body.request_type,
            prompt: body.prompt,
            image: body.image_data,
            feature: body.options.feature,
            options: RouteOptions {
                preference_override,
                model_override: body.options.model_override,
                max_tokens: body.options.max_tokens,
                temperature: body.options.temperature,
                fallback_disabled: body.options.fallback_enabled == Some(false),
            },
        })
        .await?;

    let body = AiResponseBody {
        request_id: routed.request_id,
        content: routed.content,
        provider: routed.provider.as_str().to_string(),
        model: routed.model,
        usage: routed.usage,
        cost_usd: routed.cost_usd,
        latency_ms: routed.latency_ms,
        routing_preference: routed.routing_preference,
        preference_downgraded: routed.preference_downgraded,
    };

    let mut response = Json(body).into_response();
    if let Some(remaining) = quota.remaining {
        if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
            response.headers_mut().insert("x-ai-remaining", value);
        }
    }
    Ok(response)
}
