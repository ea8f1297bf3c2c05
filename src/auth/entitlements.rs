//! Entitlement Derivation
//!
//! Entitlements are a pure function of the plan. They are regenerable at
//! any time and never a system of record beyond what the plan encodes.

use std::collections::BTreeMap;

use crate::models::{AppEntitlement, AppTier, Entitlements, Plan, Tier};

/// Derive per-app capabilities from a plan. Deterministic: equal plans
/// produce equal entitlements.
pub fn derive_entitlements(plan: &Plan) -> Entitlements {
    let app_tier = if plan.tier == Tier::Free {
        AppTier::Free
    } else {
        AppTier::Pro
    };

    let apps: BTreeMap<_, _> = plan
        .apps
        .iter()
        .map(|app| {
            (
                *app,
                AppEntitlement {
                    // Free users keep access at the free app tier.
                    has_access: true,
                    tier: app_tier,
                    ai_queries_per_day: plan.ai_queries_per_day,
                    storage_gb: plan.storage_gb,
                    features: plan.features.clone(),
                },
            )
        })
        .collect();

    Entitlements {
        apps,
        global_features: plan.features.clone(),
    }
}
