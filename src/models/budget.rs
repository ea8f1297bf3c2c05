//! Budget Documents
//!
//! Per-user per-period spend state. The status machine is one-way within a
//! period (premium -> degraded -> blocked); the only backward transition is
//! a tier upgrade restoring premium.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::identity::Tier;
use crate::config::TierBudgetConfig;

/// Budget spend state within a period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    /// Spending within the monthly budget; full routing available.
    Premium,
    /// Budget exhausted; spending from the degradation band on cheap routes.
    Degraded,
    /// Degradation band exhausted; AI calls rejected until reset or upgrade.
    Blocked,
}

/// Per-user per-period budget document. Every field change goes through a
/// single-document transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAiBudget {
    pub uid: String,
    /// Calendar month identifier, `YYYY-MM` in UTC.
    pub period: String,
    pub tier: Tier,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub degraded_spend_usd: f64,
    pub max_degraded_usd: f64,
    pub status: BudgetStatus,
    pub call_count: u64,
    pub call_count_degraded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_call_at: Option<DateTime<Utc>>,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
}

impl UserAiBudget {
    /// A zeroed budget for the given period. Free-tier users (or any tier
    /// with AI disabled) start blocked.
    pub fn fresh(uid: &str, tier: Tier, cfg: &TierBudgetConfig, period: &str) -> Self {
        let status = if cfg.allow_ai {
            BudgetStatus::Premium
        } else {
            BudgetStatus::Blocked
        };
        Self {
            uid: uid.to_string(),
            period: period.to_string(),
            tier,
            budget_usd: cfg.budget_usd,
            spent_usd: 0.0,
            degraded_spend_usd: 0.0,
            max_degraded_usd: cfg.max_degraded_usd,
            status,
            call_count: 0,
            call_count_degraded: 0,
            last_call_at: None,
            reset_at: period_reset_at(period),
            degraded_at: None,
            blocked_at: None,
        }
    }

    pub fn remaining_usd(&self) -> f64 {
        match self.status {
            BudgetStatus::Premium => (self.budget_usd - self.spent_usd).max(0.0),
            BudgetStatus::Degraded => (self.max_degraded_usd - self.degraded_spend_usd).max(0.0),
            BudgetStatus::Blocked => 0.0,
        }
    }

    pub fn percent_used(&self) -> f64 {
        if self.budget_usd <= 0.0 {
            return 100.0;
        }
        (self.spent_usd / self.budget_usd * 100.0).min(100.0)
    }

    /// Check the document against the committed-state invariants. Used by
    /// tests and debug assertions, never by call-path logic.
    pub fn invariants_hold(&self) -> bool {
        let spend_bounds = self.spent_usd >= 0.0 && self.spent_usd <= self.budget_usd + 1e-9;
        let degraded_bounds = self.degraded_spend_usd >= 0.0
            && self.degraded_spend_usd <= self.max_degraded_usd + 1e-9;
        let status_ok = match self.status {
            BudgetStatus::Premium => {
                self.degraded_spend_usd == 0.0 && self.blocked_at.is_none()
            }
            BudgetStatus::Degraded => {
                (self.spent_usd - self.budget_usd).abs() < 1e-9
                    && self.degraded_at.is_some()
                    && self.degraded_spend_usd <= self.max_degraded_usd
            }
            BudgetStatus::Blocked => {
                self.tier == Tier::Free
                    || ((self.degraded_spend_usd - self.max_degraded_usd).abs() < 1e-9
                        && self.blocked_at.is_some())
            }
        };
        spend_bounds && degraded_bounds && status_ok
    }
}

/// Current calendar period identifier, `YYYY-MM` in UTC.
pub fn current_period(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

/// First instant of the month after `period`, in UTC.
pub fn period_reset_at(period: &str) -> DateTime<Utc> {
    let (year, month) = parse_period(period);
    let first = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    first
        .checked_add_months(Months::new(1))
        .unwrap_or(first)
}

fn parse_period(period: &str) -> (i32, u32) {
    let mut parts = period.splitn(2, '-');
    let year = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1970);
    let month = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|m| (1..=12).contains(m))
        .unwrap_or(1);
    (year, month)
}

/// Budget status-change event, fanned out to notification sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetEvent {
    pub uid: String,
    pub period: String,
    pub kind: BudgetEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEventKind {
    Degraded,
    Blocked,
    ApproachingLimit,
}

impl BudgetEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetEventKind::Degraded => "degraded",
            BudgetEventKind::Blocked => "blocked",
            BudgetEventKind::ApproachingLimit => "approaching_limit",
        }
    }
}

/// Persisted dashboard alert. The hourly sweep dedupes on
/// `(uid, period, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub uid: String,
    pub period: String,
    pub kind: BudgetEventKind,
    pub created_at: DateTime<Utc>,
}

impl BudgetAlert {
    pub fn doc_id(&self) -> String {
        format!("{}_{}_{}", self.uid, self.period, self.kind.as_str())
    }
}
