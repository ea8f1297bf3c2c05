//! Gateway Configuration
//!
//! One immutable configuration value constructed at boot and passed down by
//! handle. Environment variables override defaults; nothing here is mutable
//! at runtime.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use crate::models::{AppId, FeatureValue, Plan, Quota, RoutingPreference, Tier};

/// Budget parameters for one tier.
#[derive(Debug, Clone, Copy)]
pub struct TierBudgetConfig {
    /// Monthly spend budget in USD.
    pub budget_usd: f64,
    /// Degradation band beyond the budget, in USD.
    pub max_degraded_usd: f64,
    /// Whether the tier may make AI calls at all.
    pub allow_ai: bool,
}

/// Rate caps for one tier.
#[derive(Debug, Clone, Copy)]
pub struct TierLimitConfig {
    pub max_calls_per_day: u32,
    pub max_calls_per_hour: u32,
    pub max_calls_per_endpoint_per_hour: u32,
    /// Pre-call guard: entries whose estimated cost exceeds this are skipped.
    pub max_cost_per_call: f64,
}

/// Per-tier budget and rate tables.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    budgets: BTreeMap<Tier, TierBudgetConfig>,
    limits: BTreeMap<Tier, TierLimitConfig>,
}

impl TierPolicy {
    /// Replace one tier's budget parameters.
    pub fn with_budget(mut self, tier: Tier, budget: TierBudgetConfig) -> Self {
        self.budgets.insert(tier, budget);
        self
    }

    /// Replace one tier's rate caps.
    pub fn with_limits(mut self, tier: Tier, limits: TierLimitConfig) -> Self {
        self.limits.insert(tier, limits);
        self
    }

    pub fn budget(&self, tier: Tier) -> TierBudgetConfig {
        *self.budgets.get(&tier).unwrap_or(&TierBudgetConfig {
            budget_usd: 0.0,
            max_degraded_usd: 0.0,
            allow_ai: false,
        })
    }

    pub fn limits(&self, tier: Tier) -> TierLimitConfig {
        *self.limits.get(&tier).unwrap_or(&TierLimitConfig {
            max_calls_per_day: 0,
            max_calls_per_hour: 0,
            max_calls_per_endpoint_per_hour: 0,
            max_cost_per_call: 0.0,
        })
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        let mut budgets = BTreeMap::new();
        budgets.insert(
            Tier::Free,
            TierBudgetConfig { budget_usd: 0.0, max_degraded_usd: 0.0, allow_ai: false },
        );
        budgets.insert(
            Tier::Pro,
            TierBudgetConfig { budget_usd: 3.0, max_degraded_usd: 5.0, allow_ai: true },
        );
        budgets.insert(
            Tier::ProPlus,
            TierBudgetConfig { budget_usd: 10.0, max_degraded_usd: 5.0, allow_ai: true },
        );
        budgets.insert(
            Tier::Enterprise,
            TierBudgetConfig { budget_usd: 100.0, max_degraded_usd: 50.0, allow_ai: true },
        );

        let mut limits = BTreeMap::new();
        limits.insert(
            Tier::Free,
            TierLimitConfig {
                max_calls_per_day: 20,
                max_calls_per_hour: 10,
                max_calls_per_endpoint_per_hour: 5,
                max_cost_per_call: 0.05,
            },
        );
        limits.insert(
            Tier::Pro,
            TierLimitConfig {
                max_calls_per_day: 200,
                max_calls_per_hour: 50,
                max_calls_per_endpoint_per_hour: 30,
                max_cost_per_call: 0.50,
            },
        );
        limits.insert(
            Tier::ProPlus,
            TierLimitConfig {
                max_calls_per_day: 500,
                max_calls_per_hour: 100,
                max_calls_per_endpoint_per_hour: 60,
                max_cost_per_call: 1.00,
            },
        );
        limits.insert(
            Tier::Enterprise,
            TierLimitConfig {
                max_calls_per_day: 5000,
                max_calls_per_hour: 1000,
                max_calls_per_endpoint_per_hour: 500,
                max_cost_per_call: 5.00,
            },
        );

        Self { budgets, limits }
    }
}

/// Circuit breaker and fallback chain tunables.
#[derive(Debug, Clone, Copy)]
pub struct ResilienceConfig {
    /// Consecutive failures before a provider's circuit opens.
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before admitting a half-open probe.
    pub reset_timeout_secs: u64,
    /// Attempts per fallback entry (first try included).
    pub max_retries: u32,
    /// Base backoff delay in milliseconds; doubled per attempt.
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// Hard timeout for one provider call.
    pub provider_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 300,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            provider_timeout_secs: 30,
        }
    }
}

/// Cross-app SSO signing parameters.
#[derive(Clone)]
pub struct SsoConfig {
    pub secret: Vec<u8>,
    pub ttl_secs: i64,
}

impl std::fmt::Debug for SsoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsoConfig")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            secret: b"insecure-dev-secret-change-me".to_vec(),
            ttl_secs: 300,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub tiers: TierPolicy,
    pub resilience: ResilienceConfig,
    pub sso: SsoConfig,
    /// Global routing preference when no override is supplied.
    pub global_preference: RoutingPreference,
    /// Entitlement cache TTL in seconds.
    pub entitlement_cache_ttl_secs: u64,
    /// Rate limiter janitor sweep interval in seconds.
    pub janitor_interval_secs: u64,
    /// Invitation validity window in days.
    pub invitation_ttl_days: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            tiers: TierPolicy::default(),
            resilience: ResilienceConfig::default(),
            sso: SsoConfig::default(),
            global_preference: RoutingPreference::Quality,
            entitlement_cache_ttl_secs: 300,
            janitor_interval_secs: 600,
            invitation_ttl_days: 14,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(addr) = std::env::var("GATEWAY_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        if let Ok(secret) = std::env::var("GATEWAY_SSO_SECRET") {
            cfg.sso.secret = secret.into_bytes();
        }
        if let Ok(ttl) = std::env::var("GATEWAY_ENTITLEMENT_TTL_SECS") {
            cfg.entitlement_cache_ttl_secs = ttl
                .parse()
                .context("GATEWAY_ENTITLEMENT_TTL_SECS must be an integer")?;
        }
        if let Ok(pref) = std::env::var("GATEWAY_GLOBAL_PREFERENCE") {
            cfg.global_preference = match pref.as_str() {
                "quality" => RoutingPreference::Quality,
                "balanced" => RoutingPreference::Balanced,
                "cost" => RoutingPreference::Cost,
                other => anyhow::bail!("unknown GATEWAY_GLOBAL_PREFERENCE: {other}"),
            };
        }
        Ok(cfg)
    }
}

/// Static plan catalog, loaded at boot.
pub fn default_plan_catalog() -> Vec<Plan> {
    let all_apps = AppId::all().to_vec();
    let features = |pairs: &[(&str, FeatureValue)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>()
    };

    vec![
        Plan {
            id: "free".into(),
            tier: Tier::Free,
            price_monthly: 0.0,
            price_yearly: 0.0,
            apps: all_apps.clone(),
            features: features(&[("ai_assistant", FeatureValue::Flag(false))]),
            ai_queries_per_day: Quota::Limit(10),
            storage_gb: 1,
        },
        Plan {
            id: "pro".into(),
            tier: Tier::Pro,
            price_monthly: 9.99,
            price_yearly: 99.99,
            apps: all_apps.clone(),
            features: features(&[
                ("ai_assistant", FeatureValue::Flag(true)),
                ("priority_support", FeatureValue::Flag(false)),
            ]),
            ai_queries_per_day: Quota::Limit(100),
            storage_gb: 10,
        },
        Plan {
            id: "pro_plus".into(),
            tier: Tier::ProPlus,
            price_monthly: 19.99,
            price_yearly: 199.99,
            apps: all_apps.clone(),
            features: features(&[
                ("ai_assistant", FeatureValue::Flag(true)),
                ("priority_support", FeatureValue::Flag(true)),
            ]),
            ai_queries_per_day: Quota::Unlimited,
            storage_gb: 50,
        },
        Plan {
            id: "enterprise".into(),
            tier: Tier::Enterprise,
            price_monthly: 99.99,
            price_yearly: 999.99,
            apps: all_apps,
            features: features(&[
                ("ai_assistant", FeatureValue::Flag(true)),
                ("priority_support", FeatureValue::Flag(true)),
                ("sso", FeatureValue::Flag(true)),
                ("seats", FeatureValue::Limit(50)),
            ]),
            ai_queries_per_day: Quota::Unlimited,
            storage_gb: 500,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tier_budgets_match_policy() {
        let tiers = TierPolicy::default();
        assert!(!tiers.budget(Tier::Free).allow_ai);
        assert_eq!(tiers.budget(Tier::Pro).budget_usd, 3.0);
        assert_eq!(tiers.budget(Tier::ProPlus).budget_usd, 10.0);
        assert_eq!(tiers.budget(Tier::Enterprise).max_degraded_usd, 50.0);
    }

    #[test]
    fn plan_catalog_covers_every_tier() {
        let catalog = default_plan_catalog();
        for tier in [Tier::Free, Tier::Pro, Tier::ProPlus, Tier::Enterprise] {
            assert!(catalog.iter().any(|p| p.tier == tier), "missing {tier}");
        }
    }

    #[test]
    fn sso_config_debug_redacts_secret() {
        let dbg = format!("{:?}", SsoConfig::default());
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("insecure-dev-secret"));
    }
}
