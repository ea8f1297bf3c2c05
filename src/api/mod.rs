//! HTTP Surface
//!
//! Axum routes for the governed AI endpoint, budget views, entitlements,
//! sharing, cross-app tokens, and the admin budget surface. Bearer auth is
//! applied as middleware on everything except the health probe.

pub mod account;
pub mod ai;
pub mod budget;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AiQuotaTracker, AuthGate, SsoSigner};
use crate::budget::BudgetEngine;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::identity::UserDirectory;
use crate::limiter::RateLimiter;
use crate::router::LlmRouter;
use crate::sharing::SharingService;
use crate::store::DocumentStore;
use crate::tracking::CostTracker;

/// Shared application state, constructed once at boot.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub gate: Arc<AuthGate>,
    pub limiter: Arc<RateLimiter>,
    pub quota: Arc<AiQuotaTracker>,
    pub router: Arc<LlmRouter>,
    pub engine: Arc<BudgetEngine>,
    pub tracker: Arc<CostTracker>,
    pub directory: Arc<UserDirectory>,
    pub sharing: Arc<SharingService>,
    pub sso: Arc<SsoSigner>,
}

/// Build the full router with auth middleware and HTTP layers.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/ai", post(ai::invoke))
        .route("/api/v1/budget", get(budget::get_budget))
        .route("/api/v1/budget/history", get(budget::get_history))
        .route("/api/v1/budget/usage", get(budget::get_usage))
        .route("/admin/budget/alerts", get(budget::admin_alerts))
        .route("/admin/budget/overview", get(budget::admin_overview))
        .route("/admin/budget/:uid/adjust", post(budget::admin_adjust))
        .route("/auth/entitlements", get(account::get_entitlements))
        .route("/auth/cross-app-token", post(account::mint_cross_app_token))
        .route("/auth/share", get(account::list_shares).post(account::create_share))
        .route(
            "/auth/invitations/:id/accept",
            post(account::accept_invitation),
        )
        .route(
            "/auth/invitations/:id/decline",
            post(account::decline_invitation),
        )
        .route("/auth/shared/:id", delete(account::revoke_share))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Verify the bearer token and attach the caller's [`AuthContext`] to the
/// request.
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let context = state.gate.verify_bearer(bearer).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
