//! Shared test harness: a fully wired gateway over the in-memory store and
//! scripted mock providers.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use llm_governance_gateway::api::{build_router, AppState};
use llm_governance_gateway::auth::{
    AiQuotaTracker, AuthGate, SsoSigner, StaticTokenVerifier, VerifiedToken,
};
use llm_governance_gateway::budget::{BudgetEngine, LoggingAlertSink, StoreAlertSink};
use llm_governance_gateway::config::{default_plan_catalog, GatewayConfig, ResilienceConfig};
use llm_governance_gateway::identity::{UserDirectory, USERS};
use llm_governance_gateway::limiter::RateLimiter;
use llm_governance_gateway::models::{Tier, User};
use llm_governance_gateway::pricing::PricingTable;
use llm_governance_gateway::providers::{MockProvider, Provider, ProviderSet};
use llm_governance_gateway::resilience::{CircuitBreakerRegistry, FallbackChain};
use llm_governance_gateway::router::LlmRouter;
use llm_governance_gateway::routing::default_tables;
use llm_governance_gateway::sharing::SharingService;
use llm_governance_gateway::store::{get_doc, put_doc, MemoryStore};
use llm_governance_gateway::tracking::CostTracker;

pub struct TestEnv {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub verifier: Arc<StaticTokenVerifier>,
    pub anthropic: Arc<MockProvider>,
    pub openai: Arc<MockProvider>,
    pub google: Arc<MockProvider>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub engine: Arc<BudgetEngine>,
    pub directory: Arc<UserDirectory>,
}

pub fn build_env() -> TestEnv {
    let config = Arc::new(GatewayConfig::default());
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(UserDirectory::new(store.clone(), default_plan_catalog()));
    let verifier = Arc::new(StaticTokenVerifier::new());
    let gate = Arc::new(AuthGate::new(
        verifier.clone(),
        directory.clone(),
        Duration::from_secs(300),
    ));

    let engine = Arc::new(BudgetEngine::new(
        store.clone(),
        config.tiers.clone(),
        directory.clone(),
        vec![
            Arc::new(LoggingAlertSink) as Arc<dyn llm_governance_gateway::budget::AlertSink>,
            Arc::new(StoreAlertSink::new(store.clone())),
        ],
    ));
    let tracker = Arc::new(CostTracker::new(store.clone()));

    let pricing = Arc::new(PricingTable::default());
    let anthropic = Arc::new(MockProvider::new(Provider::Anthropic));
    let openai = Arc::new(MockProvider::new(Provider::OpenAi));
    let google = Arc::new(MockProvider::new(Provider::Google));
    let providers = ProviderSet::new()
        .with(anthropic.clone())
        .with(openai.clone())
        .with(google.clone());

    let resilience = ResilienceConfig {
        base_delay_ms: 1,
        max_delay_ms: 2,
        ..ResilienceConfig::default()
    };
    let breakers = Arc::new(CircuitBreakerRegistry::new(&resilience));
    let chain = FallbackChain::new(resilience, breakers.clone());
    let (table, degraded) = default_tables();
    let router = Arc::new(LlmRouter::new(
        Arc::new(table),
        Arc::new(degraded),
        pricing,
        providers,
        chain,
        engine.clone(),
        tracker.clone(),
        config.tiers.clone(),
        config.global_preference,
    ));

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        gate,
        limiter: Arc::new(RateLimiter::new(config.tiers.clone())),
        quota: Arc::new(AiQuotaTracker::new(store.clone())),
        router,
        engine: engine.clone(),
        tracker,
        directory: directory.clone(),
        sharing: Arc::new(SharingService::new(store.clone(), 14)),
        sso: Arc::new(SsoSigner::new(config.sso.clone())),
    };

    TestEnv {
        app: build_router(state.clone()),
        state,
        store,
        verifier,
        anthropic,
        openai,
        google,
        breakers,
        engine,
        directory,
    }
}

/// Register a user and a bearer token for them. Returns the token.
pub async fn register_user(env: &TestEnv, uid: &str, tier: Tier, admin: bool) -> String {
    let email = format!("{uid}@example.com");
    env.directory.get_or_provision(uid, &email).await.unwrap();
    if tier != Tier::Free || admin {
        let mut user: User = get_doc(env.store.as_ref(), USERS, uid)
            .await
            .unwrap()
            .unwrap();
        user.tier = tier;
        user.admin = admin;
        put_doc(env.store.as_ref(), USERS, uid, &user).await.unwrap();
    }
    let token = format!("token-{uid}");
    env.verifier.insert(
        &token,
        VerifiedToken {
            uid: uid.to_string(),
            email,
            provider: "test".to_string(),
            email_verified: true,
        },
    );
    token
}

/// Drive one request through the router and decode the JSON response.
pub async fn call(
    env: &TestEnv,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, value) = call_full(env, method, uri, token, body).await;
    (status, value)
}

/// Like [`call`], but also returns the response headers.
pub async fn call_full(
    env: &TestEnv,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = env.app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, value)
}
