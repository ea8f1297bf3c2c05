//! End-to-End Pipeline Tests
//!
//! Drive the full HTTP surface: auth, quotas, rate limits, budget
//! transitions, degraded routing, fallback traversal, and the admin
//! surface, against scripted mock providers.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{build_env, call, call_full, register_user};
use llm_governance_gateway::budget::BudgetGate;
use llm_governance_gateway::models::{current_period, BudgetStatus, Tier};
use llm_governance_gateway::providers::{LlmErrorKind, Provider};
use llm_governance_gateway::router::{RouteOptions, RouteRequest};
use llm_governance_gateway::store::DocumentStore;

fn ai_body(request_type: &str) -> serde_json::Value {
    json!({ "requestType": request_type, "prompt": "two eggs and toast" })
}

#[tokio::test]
async fn health_needs_no_auth() {
    let env = build_env();
    let (status, body) = call(&env, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let env = build_env();
    let (status, body) = call(&env, "POST", "/api/v1/ai", None, Some(ai_body("meal-text"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn pro_user_completes_a_governed_call() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;

    let (status, headers, body) = call_full(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "anthropic");
    assert_eq!(body["model"], "claude-sonnet-4-20250514");
    assert_eq!(body["routingPreference"], "quality");
    assert_eq!(body["preferenceDowngraded"], false);
    assert!(body["requestId"].as_str().is_some());
    assert_eq!(headers.get("x-ai-remaining").unwrap(), "99");

    let budget = env.engine.current("u1").await.unwrap();
    assert_eq!(budget.call_count, 1);
    assert!(budget.spent_usd > 0.0);
}

#[tokio::test]
async fn legacy_alias_reaches_the_same_route() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "claude-sonnet-4-20250514");
}

#[tokio::test]
async fn unknown_request_type_is_rejected() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("mystery-task")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn free_tier_is_budget_blocked_with_upgrade_hint() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Free, false).await;
    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "ai_budget_exhausted");
    assert!(body["upgradeUrl"].as_str().is_some());
    assert_eq!(env.anthropic.call_count(), 0);
}

#[tokio::test]
async fn soft_downgrade_at_eighty_percent_selects_cost_route() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;

    // Burn 2.41 of the 3.00 budget; remaining 0.59 < 0.60.
    env.anthropic.push_success("seed", 2.41);
    call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;

    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "gemini-2.0-flash-lite");
    assert_eq!(body["routingPreference"], "cost");
    assert_eq!(body["preferenceDowngraded"], true);
}

#[tokio::test]
async fn budget_lifecycle_degrade_block_upgrade() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    let admin_token = register_user(&env, "root", Tier::Pro, true).await;

    // Spend to 2.90, then a 0.15 call crosses the boundary. With 0.10
    // remaining the second call is already soft-downgraded to the cost
    // route, whose primary is the google flash-lite model.
    env.anthropic.push_success("warm", 2.90);
    call(&env, "POST", "/api/v1/ai", Some(&token), Some(ai_body("nutrition:meal-text"))).await;
    env.google.push_success("over", 0.15);
    let (status, _) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let budget = env.engine.current("u1").await.unwrap();
    assert!((budget.spent_usd - 3.0).abs() < 1e-9);
    assert!((budget.degraded_spend_usd - 0.05).abs() < 1e-9);
    assert_eq!(budget.status, BudgetStatus::Degraded);

    // The degraded event was persisted as a dashboard alert.
    let alert_id = format!("u1_{}_degraded", current_period(chrono::Utc::now()));
    assert!(env
        .store
        .get("budget_alerts", &alert_id)
        .await
        .unwrap()
        .is_some());

    // Degraded routing: meal-scan runs on the degraded vision route.
    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(json!({
            "requestType": "nutrition:meal-scan",
            "prompt": "what is on this plate",
            "imageData": { "base64": "aGVsbG8=", "mimeType": "image/jpeg" },
            "options": { "maxTokens": 512 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "gemini-2.0-flash");
    assert_eq!(body["routingPreference"], "degraded");
    assert_eq!(body["preferenceDowngraded"], true);

    // A 4.97 call exhausts the degraded band (0.05 + small scan cost
    // already spent, so cap at 5.00) and blocks. The degraded route for
    // budget:insights runs on the haiku-class model.
    env.anthropic.push_success("big", 4.97);
    call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("budget:insights")),
    )
    .await;
    let budget = env.engine.current("u1").await.unwrap();
    assert_eq!(budget.status, BudgetStatus::Blocked);
    assert!((budget.degraded_spend_usd - 5.0).abs() < 1e-9);

    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "ai_budget_exhausted");

    // Admin upgrade restores premium with no refund.
    let (status, body) = call(
        &env,
        "POST",
        "/admin/budget/u1/adjust",
        Some(&admin_token),
        Some(json!({ "action": "upgrade_tier", "tier": "pro_plus" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "premium");
    assert_eq!(body["budgetUsd"], 10.0);
    assert!((body["spentUsd"].as_f64().unwrap() - 3.0).abs() < 1e-9);
    assert!((body["degradedSpendUsd"].as_f64().unwrap() - 5.0).abs() < 1e-9);

    // Next call is admitted again.
    let (status, _) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn degraded_route_is_gated_by_the_degraded_table_cap() {
    // The degraded vision route caps max tokens at or under 600.
    let (_, degraded) = llm_governance_gateway::routing::default_tables();
    let route = degraded.get("nutrition:meal-scan").unwrap();
    assert!(route.defaults.max_tokens <= 600);
    assert!(route.fallbacks.is_empty());
}

#[tokio::test]
async fn fallback_traversal_with_open_circuit_over_http() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Enterprise, false).await;

    env.breakers.breaker(Provider::Anthropic).trip();
    env.openai.push_failure(LlmErrorKind::RateLimit, true);
    env.openai.push_failure(LlmErrorKind::RateLimit, true);

    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "openai");
    assert_eq!(body["preferenceDowngraded"], false);
    assert_eq!(env.anthropic.call_count(), 0);
    assert_eq!(env.openai.call_count(), 3);
    assert_eq!(env.google.call_count(), 0);
}

#[tokio::test]
async fn store_outage_fails_safe_before_any_provider_call() {
    let env = build_env();
    register_user(&env, "u1", Tier::Pro, false).await;
    env.engine.check("u1").await; // materialize the budget document

    env.store.set_unavailable(true);
    let err = env
        .state
        .router
        .route(RouteRequest {
            uid: "u1".into(),
            tier: Tier::Pro,
            request_type: "nutrition:meal-text".into(),
            prompt: "hello".into(),
            image: None,
            feature: None,
            options: RouteOptions::default(),
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "ai_budget_exhausted");
    assert_eq!(env.anthropic.call_count(), 0);
    assert_eq!(env.openai.call_count(), 0);
    assert_eq!(env.google.call_count(), 0);
}

#[tokio::test]
async fn endpoint_rate_limit_denies_with_reset() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;

    // Pro endpoint cap is 30 per hour.
    for _ in 0..30 {
        let (status, _) = call(
            &env,
            "POST",
            "/api/v1/ai",
            Some(&token),
            Some(ai_body("nutrition:meal-text")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(
        &env,
        "POST",
        "/api/v1/ai",
        Some(&token),
        Some(ai_body("nutrition:meal-text")),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert!(body["resetAt"].as_str().is_some());

    // The denied call performed no deduction.
    let budget = env.engine.current("u1").await.unwrap();
    assert_eq!(budget.call_count, 30);
}

#[tokio::test]
async fn budget_view_reports_projection_and_upgrade_path() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    env.anthropic.push_success("seed", 1.50);
    call(&env, "POST", "/api/v1/ai", Some(&token), Some(ai_body("nutrition:meal-text"))).await;

    let (status, body) = call(&env, "GET", "/api/v1/budget", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "pro");
    assert_eq!(body["budgetUsd"], 3.0);
    assert!((body["percentUsed"].as_f64().unwrap() - 50.0).abs() < 1.0);
    assert_eq!(body["upgradeAvailable"], true);
    assert_eq!(body["upgradeTier"], "pro_plus");
    assert!(body["projectedMonthlySpend"].as_f64().unwrap() >= 1.5);
    assert!(body["daysUntilReset"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn usage_breakdown_counts_successful_calls() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    call(&env, "POST", "/api/v1/ai", Some(&token), Some(ai_body("nutrition:meal-text"))).await;
    call(&env, "POST", "/api/v1/ai", Some(&token), Some(ai_body("fitness:coach-chat"))).await;

    let (status, body) = call(&env, "GET", "/api/v1/budget/usage", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalCalls"], 2);
    assert_eq!(body["byRequestType"]["nutrition:meal-text"]["calls"], 1);
    assert_eq!(body["byRequestType"]["fitness:coach-chat"]["calls"], 1);
    assert_eq!(body["byModel"]["claude-sonnet-4-20250514"]["calls"], 2);
}

#[tokio::test]
async fn history_validates_the_month_range() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    let (status, _) = call(
        &env,
        "GET",
        "/api/v1/budget/history?months=13",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &env,
        "GET",
        "/api/v1/budget/history?months=3",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_surface_requires_privileges() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    let (status, body) = call(&env, "GET", "/admin/budget/overview", Some(&token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "insufficient_privileges");

    let admin_token = register_user(&env, "root", Tier::Enterprise, false).await;
    let (status, body) = call(&env, "GET", "/admin/budget/overview", Some(&admin_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["period"].as_str().is_some());
}

#[tokio::test]
async fn cross_app_token_mints_and_verifies() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::Pro, false).await;
    let (status, body) = call(
        &env,
        "POST",
        "/auth/cross-app-token",
        Some(&token),
        Some(json!({ "targetApp": "budget" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let claims = env.state.sso.verify(body["token"].as_str().unwrap()).unwrap();
    assert_eq!(claims.uid, "u1");
    assert_eq!(claims.exp - claims.iat, 300);
}

#[tokio::test]
async fn sharing_flow_over_http() {
    let env = build_env();
    let owner = register_user(&env, "owner", Tier::Pro, false).await;
    let friend = register_user(&env, "friend", Tier::Free, false).await;

    let (status, invitation) = call(
        &env,
        "POST",
        "/auth/share",
        Some(&owner),
        Some(json!({
            "toEmail": "friend@example.com",
            "resourceType": "meal_plan",
            "resourceId": "plan-1",
            "role": "viewer",
            "appId": "nutrition"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let invitation_id = invitation["id"].as_str().unwrap().to_string();

    let (status, share) = call(
        &env,
        "POST",
        &format!("/auth/invitations/{invitation_id}/accept"),
        Some(&friend),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(share["ownerUid"], "owner");
    assert_eq!(share["sharedWithUid"], "friend");

    // Acceptance is terminal.
    let (status, _) = call(
        &env,
        "POST",
        &format!("/auth/invitations/{invitation_id}/accept"),
        Some(&friend),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, listing) = call(&env, "GET", "/auth/share", Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["shares"].as_array().unwrap().len(), 1);

    let share_id = share["id"].as_str().unwrap();
    let (status, _) = call(
        &env,
        "DELETE",
        &format!("/auth/shared/{share_id}"),
        Some(&owner),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn entitlements_reflect_the_plan() {
    let env = build_env();
    let token = register_user(&env, "u1", Tier::ProPlus, false).await;
    let (status, body) = call(&env, "GET", "/auth/entitlements", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["apps"]["nutrition"]["hasAccess"], true);
    assert_eq!(body["apps"]["nutrition"]["aiQueriesPerDay"], -1);
    assert_eq!(body["globalFeatures"]["ai_assistant"], true);
}
