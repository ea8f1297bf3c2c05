//! Identity, Plans, and Entitlements
//!
//! The gateway never owns identity beyond what governance needs: a user's
//! tier, billing status, and the entitlements derived from their plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Subscription tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    ProPlus,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::ProPlus => "pro_plus",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Next tier up the ladder, if any.
    pub fn upgrade_target(&self) -> Option<Tier> {
        match self {
            Tier::Free => Some(Tier::Pro),
            Tier::Pro => Some(Tier::ProPlus),
            Tier::ProPlus => Some(Tier::Enterprise),
            Tier::Enterprise => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing lifecycle state, relayed from the billing collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Free,
    Trial,
    Active,
    PastDue,
    Cancelled,
}

/// Consumer applications governed by the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppId {
    Fitness,
    Nutrition,
    Budget,
    Meetings,
}

impl AppId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppId::Fitness => "fitness",
            AppId::Nutrition => "nutrition",
            AppId::Budget => "budget",
            AppId::Meetings => "meetings",
        }
    }

    pub fn parse(s: &str) -> Option<AppId> {
        match s {
            "fitness" => Some(AppId::Fitness),
            "nutrition" => Some(AppId::Nutrition),
            "budget" => Some(AppId::Budget),
            "meetings" => Some(AppId::Meetings),
            _ => None,
        }
    }

    pub fn all() -> [AppId; 4] {
        [AppId::Fitness, AppId::Nutrition, AppId::Budget, AppId::Meetings]
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User record. Created by the identity collaborator or auto-provisioned on
/// first verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: String,
    pub email: String,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub timezone: String,
    pub locale: String,
    pub onboarding_completed: bool,
    /// Grants access to the admin budget surface.
    #[serde(default)]
    pub admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    pub billing_status: BillingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_ends_at: Option<DateTime<Utc>>,
}

/// A per-day quota. `Unlimited` serializes as -1 on the wire for
/// compatibility with the legacy surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    Unlimited,
    Limit(u32),
}

impl Quota {
    /// Whether `used` calls leave room for one more.
    pub fn admits(&self, used: u64) -> bool {
        match self {
            Quota::Unlimited => true,
            Quota::Limit(n) => used < *n as u64,
        }
    }

    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            Quota::Unlimited => None,
            Quota::Limit(n) => Some((*n as u64).saturating_sub(used)),
        }
    }
}

impl Serialize for Quota {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Quota::Unlimited => serializer.serialize_i64(-1),
            Quota::Limit(n) => serializer.serialize_i64(*n as i64),
        }
    }
}

impl<'de> Deserialize<'de> for Quota {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        if raw < 0 {
            Ok(Quota::Unlimited)
        } else {
            Ok(Quota::Limit(raw as u32))
        }
    }
}

/// Feature switch or numeric feature limit carried by a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FeatureValue {
    Flag(bool),
    Limit(i64),
}

impl FeatureValue {
    /// A feature counts as present when it is a true flag or a nonzero limit.
    pub fn enabled(&self) -> bool {
        match self {
            FeatureValue::Flag(b) => *b,
            FeatureValue::Limit(n) => *n != 0,
        }
    }
}

/// Commercial plan. Static catalog, loaded at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub tier: Tier,
    pub price_monthly: f64,
    pub price_yearly: f64,
    pub apps: Vec<AppId>,
    pub features: BTreeMap<String, FeatureValue>,
    /// Per-app AI call allowance per day.
    pub ai_queries_per_day: Quota,
    pub storage_gb: u32,
}

/// Per-app capability tier within a plan. Coarser than the billing tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppTier {
    Free,
    Pro,
}

/// Derived per-app capabilities for one app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppEntitlement {
    /// Always true; free users still have (free-tier) access.
    pub has_access: bool,
    pub tier: AppTier,
    pub ai_queries_per_day: Quota,
    pub storage_gb: u32,
    pub features: BTreeMap<String, FeatureValue>,
}

/// Derived entitlements. Regenerable from `(Plan, AppId-set)` alone; never a
/// system of record beyond what the plan encodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub apps: BTreeMap<AppId, AppEntitlement>,
    pub global_features: BTreeMap<String, FeatureValue>,
}

impl Entitlements {
    pub fn has_app_access(&self, app: AppId) -> bool {
        self.apps.get(&app).map(|a| a.has_access).unwrap_or(false)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.global_features
            .get(feature)
            .map(FeatureValue::enabled)
            .unwrap_or(false)
    }
}
