//! Call Records and Usage Rollups

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::providers::Provider;

/// Routing bias. `Degraded` is internal, used when the degraded routing
/// table is active for a budget-degraded user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPreference {
    Quality,
    Balanced,
    Cost,
    Degraded,
}

impl RoutingPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingPreference::Quality => "quality",
            RoutingPreference::Balanced => "balanced",
            RoutingPreference::Cost => "cost",
            RoutingPreference::Degraded => "degraded",
        }
    }
}

/// Token usage reported by a provider for one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Typed request metadata threaded through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub request_id: String,
    pub uid: String,
    pub request_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

/// Append-only audit record of one provider invocation. Immutable once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmCallRecord {
    pub request_id: String,
    pub uid: String,
    pub request_type: String,
    pub provider: Provider,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub routing_preference: RoutingPreference,
    pub preference_downgraded: bool,
    pub timestamp: DateTime<Utc>,
}

/// Per-user per-day usage aggregate, maintained transactionally on
/// successful calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub uid: String,
    /// `YYYY-MM-DD` in UTC.
    pub date: String,
    pub total_cost_usd: f64,
    pub total_calls: u64,
    pub request_types: BTreeMap<String, u64>,
}

impl DailyUsage {
    pub fn empty(uid: &str, date: &str) -> Self {
        Self {
            uid: uid.to_string(),
            date: date.to_string(),
            total_cost_usd: 0.0,
            total_calls: 0,
            request_types: BTreeMap::new(),
        }
    }

    pub fn doc_id(uid: &str, date: &str) -> String {
        format!("{uid}_{date}")
    }
}

/// One user's share of a day's spend, for the rollup leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSpend {
    pub uid: String,
    pub cost_usd: f64,
    pub calls: u64,
}

/// Daily rollup over the call log. Regenerable; overwritten on re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCostSummary {
    pub date: String,
    pub total_cost_usd: f64,
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_request_type: BTreeMap<String, f64>,
    pub by_preference: BTreeMap<String, f64>,
    /// Top 10 users by spend.
    pub top_users: Vec<UserSpend>,
}

impl DailyCostSummary {
    pub fn doc_id(date: NaiveDate) -> String {
        format!("daily_{}", date.format("%Y-%m-%d"))
    }
}
