//! Budget Views and Admin Surface

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::AppState;
use crate::auth::AuthContext;
use crate::budget::BUDGETS;
use crate::error::ApiError;
use crate::models::{
    current_period, BudgetAlert, BudgetStatus, RoutingPreference, Tier, UserAiBudget,
};
use crate::store::DocumentStore;

/// `GET /api/v1/budget` response shape.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetView {
    pub status: BudgetStatus,
    pub spent_usd: f64,
    pub budget_usd: f64,
    pub percent_used: f64,
    pub reset_at: chrono::DateTime<Utc>,
    pub days_until_reset: i64,
    pub call_count: u64,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub upgrade_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_price: Option<f64>,
    pub routing_preference: RoutingPreference,
    pub projected_monthly_spend: f64,
}

pub async fn get_budget(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<BudgetView>, ApiError> {
    let budget = state
        .engine
        .current(&ctx.uid)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(budget_view(&state, budget)))
}

fn budget_view(state: &AppState, budget: UserAiBudget) -> BudgetView {
    let now = Utc::now();
    let days_until_reset = ((budget.reset_at - now).num_seconds() as f64 / 86_400.0).ceil() as i64;

    let day_of_month = now.day().max(1) as f64;
    let days_in_month = budget
        .reset_at
        .date_naive()
        .pred_opt()
        .map(|d| d.day())
        .unwrap_or(30) as f64;
    let total_spend = budget.spent_usd + budget.degraded_spend_usd;
    let projected = total_spend / day_of_month * days_in_month;

    let routing_preference = match budget.status {
        BudgetStatus::Premium
            if budget.budget_usd - budget.spent_usd > 0.2 * budget.budget_usd =>
        {
            RoutingPreference::Quality
        }
        BudgetStatus::Premium => RoutingPreference::Cost,
        BudgetStatus::Degraded | BudgetStatus::Blocked => RoutingPreference::Cost,
    };

    let message = match budget.status {
        BudgetStatus::Premium => None,
        BudgetStatus::Degraded => Some(
            "Your monthly AI budget is used up; requests now run on cost-efficient models."
                .to_string(),
        ),
        BudgetStatus::Blocked => {
            Some("AI features are paused until your budget resets.".to_string())
        }
    };

    let upgrade_tier = budget.tier.upgrade_target();
    let upgrade_price = upgrade_tier
        .and_then(|t| state.directory.plan_for_tier(t))
        .map(|p| p.price_monthly);

    BudgetView {
        status: budget.status,
        spent_usd: budget.spent_usd,
        budget_usd: budget.budget_usd,
        percent_used: budget.percent_used(),
        reset_at: budget.reset_at,
        days_until_reset,
        call_count: budget.call_count,
        tier: budget.tier,
        message,
        upgrade_available: upgrade_tier.is_some(),
        upgrade_tier,
        upgrade_price,
        routing_preference,
        projected_monthly_spend: projected,
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_months")]
    pub months: usize,
}

fn default_months() -> usize {
    6
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub period: String,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub degraded_spend_usd: f64,
    pub total_spend: f64,
    pub call_count: u64,
    pub status: BudgetStatus,
    pub tier: Tier,
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryRow>>, ApiError> {
    if !(1..=12).contains(&query.months) {
        return Err(ApiError::InvalidRequest(
            "months must be between 1 and 12".to_string(),
        ));
    }
    let budgets = state
        .engine
        .history(&ctx.uid, query.months)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(
        budgets
            .into_iter()
            .map(|b| HistoryRow {
                period: b.period,
                budget_usd: b.budget_usd,
                spent_usd: b.spent_usd,
                degraded_spend_usd: b.degraded_spend_usd,
                total_spend: b.spent_usd + b.degraded_spend_usd,
                call_count: b.call_count,
                status: b.status,
                tier: b.tier,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub period: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    pub calls: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageView {
    pub period: String,
    pub total_calls: u64,
    pub total_cost_usd: f64,
    pub by_request_type: BTreeMap<String, UsageBucket>,
    pub by_model: BTreeMap<String, UsageBucket>,
    pub by_day: BTreeMap<String, UsageBucket>,
}

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageView>, ApiError> {
    let period = match query.period {
        Some(period) => {
            if !is_valid_period(&period) {
                return Err(ApiError::InvalidRequest(
                    "period must be YYYY-MM".to_string(),
                ));
            }
            period
        }
        None => current_period(Utc::now()),
    };

    let calls = state.tracker.calls_for_period(&ctx.uid, &period).await?;
    let mut view = UsageView {
        period,
        total_calls: 0,
        total_cost_usd: 0.0,
        by_request_type: BTreeMap::new(),
        by_model: BTreeMap::new(),
        by_day: BTreeMap::new(),
    };
    for call in calls.iter().filter(|c| c.success) {
        view.total_calls += 1;
        view.total_cost_usd += call.cost_usd;
        for (key, map) in [
            (call.request_type.clone(), &mut view.by_request_type),
            (call.model.clone(), &mut view.by_model),
            (
                call.timestamp.date_naive().format("%Y-%m-%d").to_string(),
                &mut view.by_day,
            ),
        ] {
            let bucket = map.entry(key).or_default();
            bucket.calls += 1;
            bucket.cost_usd += call.cost_usd;
        }
    }
    Ok(Json(view))
}

fn is_valid_period(period: &str) -> bool {
    let mut parts = period.splitn(2, '-');
    let year = parts.next().map(|y| y.len() == 4 && y.chars().all(|c| c.is_ascii_digit()));
    let month = parts
        .next()
        .and_then(|m| m.parse::<u32>().ok())
        .map(|m| (1..=12).contains(&m));
    year == Some(true) && month == Some(true)
}

// --- Admin surface ---

pub async fn admin_alerts(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<BudgetAlert>>, ApiError> {
    ctx.ensure_admin()?;
    let mut alerts = Vec::new();
    for doc in state.store.scan(crate::budget::alerts::BUDGET_ALERTS).await? {
        if let Ok(alert) = serde_json::from_value::<BudgetAlert>(doc.data) {
            alerts.push(alert);
        }
    }
    alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(alerts))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminOverview {
    pub period: String,
    pub total_users: usize,
    pub premium: usize,
    pub degraded: usize,
    pub blocked: usize,
    pub total_spend_usd: f64,
    pub top_spenders: Vec<TopSpender>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopSpender {
    pub uid: String,
    pub total_spend_usd: f64,
    pub status: BudgetStatus,
}

pub async fn admin_overview(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<AdminOverview>, ApiError> {
    ctx.ensure_admin()?;
    let period = current_period(Utc::now());
    let mut overview = AdminOverview {
        period: period.clone(),
        total_users: 0,
        premium: 0,
        degraded: 0,
        blocked: 0,
        total_spend_usd: 0.0,
        top_spenders: Vec::new(),
    };
    let mut spenders = Vec::new();
    for doc in state.store.scan(BUDGETS).await? {
        let Ok(budget) = serde_json::from_value::<UserAiBudget>(doc.data) else {
            continue;
        };
        if budget.period != period {
            continue;
        }
        overview.total_users += 1;
        match budget.status {
            BudgetStatus::Premium => overview.premium += 1,
            BudgetStatus::Degraded => overview.degraded += 1,
            BudgetStatus::Blocked => overview.blocked += 1,
        }
        let total = budget.spent_usd + budget.degraded_spend_usd;
        overview.total_spend_usd += total;
        spenders.push(TopSpender {
            uid: budget.uid,
            total_spend_usd: total,
            status: budget.status,
        });
    }
    spenders.sort_by(|a, b| {
        b.total_spend_usd
            .partial_cmp(&a.total_spend_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.uid.cmp(&b.uid))
    });
    spenders.truncate(10);
    overview.top_spenders = spenders;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustAction {
    AddBudget,
    ResetSpend,
    UpgradeTier,
    Unblock,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustBody {
    pub action: AdjustAction,
    pub amount_usd: Option<f64>,
    pub tier: Option<Tier>,
}

pub async fn admin_adjust(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(uid): Path<String>,
    Json(body): Json<AdjustBody>,
) -> Result<Json<UserAiBudget>, ApiError> {
    ctx.ensure_admin()?;
    let budget = match body.action {
        AdjustAction::AddBudget => {
            let amount = body.amount_usd.filter(|a| *a > 0.0).ok_or_else(|| {
                ApiError::InvalidRequest("add_budget requires a positive amountUsd".to_string())
            })?;
            state.engine.add_budget(&uid, amount).await
        }
        AdjustAction::ResetSpend => state.engine.reset_spend(&uid).await,
        AdjustAction::Unblock => state.engine.unblock(&uid).await,
        AdjustAction::UpgradeTier => {
            let tier = body.tier.ok_or_else(|| {
                ApiError::InvalidRequest("upgrade_tier requires a tier".to_string())
            })?;
            state
                .directory
                .set_tier(&uid, tier)
                .await
                .map_err(|e| ApiError::Internal(e.into()))?;
            state.gate.invalidate(&uid);
            state.engine.upgrade_tier(&uid, tier).await
        }
    }
    .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(budget))
}
