//! Budget State Engine
//!
//! Owns the per-user per-period spend document. Pre-flight `check` is a
//! lock-free read that fails safe to blocked; post-flight `deduct` runs in a
//! single-document transaction and performs at most one status transition
//! per call. Period rolls happen lazily on read and via the monthly job.

pub mod alerts;

pub use alerts::{AlertSink, LoggingAlertSink, StoreAlertSink};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TierPolicy;
use crate::models::{
    current_period, BudgetEvent, BudgetEventKind, BudgetStatus, RoutingPreference, Tier,
    UserAiBudget,
};
use crate::store::{get_doc, put_doc, run_transaction, DocumentStore, StoreError};

/// Active budgets, one document per uid.
pub const BUDGETS: &str = "budgets";
/// Frozen prior-period budgets, `{uid}_{period}`.
pub const BUDGET_HISTORY: &str = "budget_history";

/// Fraction of the budget that must remain for quality routing; below it the
/// pre-flight soft-downgrades to cost routing.
const SOFT_DOWNGRADE_FRACTION: f64 = 0.2;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Deduction reached a blocked budget. Pre-flight should have rejected
    /// the request; this is a programming error, not a user condition.
    #[error("deduction attempted on a blocked budget for uid {0}")]
    DeductWhileBlocked(String),

    #[error("tier lookup failed for uid {0}: {1}")]
    TierLookup(String, String),
}

/// Pre-flight admission decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckResult {
    pub allowed: bool,
    pub status: BudgetStatus,
    /// `Quality` or `Cost`; the router maps this onto the active preference.
    pub routing: RoutingPreference,
    pub remaining_usd: f64,
}

impl CheckResult {
    fn blocked() -> Self {
        Self {
            allowed: false,
            status: BudgetStatus::Blocked,
            routing: RoutingPreference::Cost,
            remaining_usd: 0.0,
        }
    }
}

/// The narrow pre-flight/post-flight surface the router depends on.
#[async_trait]
pub trait BudgetGate: Send + Sync {
    /// Never fails: any internal error defaults to blocked.
    async fn check(&self, uid: &str) -> CheckResult;

    async fn deduct(
        &self,
        uid: &str,
        cost_usd: f64,
        request_type: &str,
        model: &str,
    ) -> Result<UserAiBudget, BudgetError>;
}

/// Tier lookup against the identity collaborator. Re-read on every period
/// roll so upgrades made mid-cycle take effect at the boundary.
#[async_trait]
pub trait TierSource: Send + Sync {
    async fn tier_of(&self, uid: &str) -> anyhow::Result<Tier>;
}

pub struct BudgetEngine {
    store: Arc<dyn DocumentStore>,
    tiers: TierPolicy,
    tier_source: Arc<dyn TierSource>,
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl BudgetEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tiers: TierPolicy,
        tier_source: Arc<dyn TierSource>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Self {
        Self {
            store,
            tiers,
            tier_source,
            sinks,
        }
    }

    /// Load the caller's budget for the current period, creating or rolling
    /// it as needed. The replaced document, if any, is archived as frozen
    /// history.
    pub async fn current(&self, uid: &str) -> Result<UserAiBudget, BudgetError> {
        let period = current_period(Utc::now());

        // Fast path: the stored document is already current.
        if let Some(budget) = get_doc::<UserAiBudget>(self.store.as_ref(), BUDGETS, uid).await? {
            if budget.period == period {
                return Ok(budget);
            }
        }

        // Slow path: first access this period. Tier is re-read because the
        // user may have changed plans since the document was written.
        let tier = self
            .tier_source
            .tier_of(uid)
            .await
            .map_err(|e| BudgetError::TierLookup(uid.to_string(), e.to_string()))?;
        let tier_cfg = self.tiers.budget(tier);

        let mut archived: Option<UserAiBudget> = None;
        let budget = run_transaction::<UserAiBudget, BudgetError, _>(
            self.store.as_ref(),
            BUDGETS,
            uid,
            |existing| {
                archived = None;
                if let Some(value) = existing {
                    let stored: UserAiBudget =
                        serde_json::from_value(value.clone()).map_err(StoreError::from)?;
                    if stored.period == period {
                        return Ok((value, stored));
                    }
                    archived = Some(stored);
                }
                let fresh = UserAiBudget::fresh(uid, tier, &tier_cfg, &period);
                Ok((serde_json::to_value(&fresh).map_err(StoreError::from)?, fresh))
            },
        )
        .await?;

        if let Some(old) = archived {
            let history_id = format!("{}_{}", uid, old.period);
            put_doc(self.store.as_ref(), BUDGET_HISTORY, &history_id, &old).await?;
            info!(uid, from = %old.period, to = %period, "budget period rolled");
        }

        Ok(budget)
    }

    /// Prior periods for the history endpoint, most recent first.
    pub async fn history(&self, uid: &str, months: usize) -> Result<Vec<UserAiBudget>, BudgetError> {
        let prefix = format!("{uid}_");
        let mut periods: Vec<UserAiBudget> = Vec::new();
        for doc in self.store.scan(BUDGET_HISTORY).await? {
            if doc.id.starts_with(&prefix) {
                periods.push(serde_json::from_value(doc.data).map_err(StoreError::from)?);
            }
        }
        periods.push(self.current(uid).await?);
        periods.sort_by(|a, b| b.period.cmp(&a.period));
        periods.truncate(months);
        Ok(periods)
    }

    /// Change tier mid-period. Restores premium for AI-enabled tiers, the
    /// only backward transition permitted within a period. Spend counters
    /// are kept; there is no refund.
    pub async fn upgrade_tier(
        &self,
        uid: &str,
        new_tier: Tier,
    ) -> Result<UserAiBudget, BudgetError> {
        let tier_cfg = self.tiers.budget(new_tier);
        let period = current_period(Utc::now());
        let updated = run_transaction::<UserAiBudget, BudgetError, _>(
            self.store.as_ref(),
            BUDGETS,
            uid,
            |existing| {
                let mut budget = match existing {
                    Some(value) => {
                        serde_json::from_value::<UserAiBudget>(value).map_err(StoreError::from)?
                    }
                    None => UserAiBudget::fresh(uid, new_tier, &tier_cfg, &period),
                };
                budget.tier = new_tier;
                budget.budget_usd = tier_cfg.budget_usd;
                budget.max_degraded_usd = tier_cfg.max_degraded_usd;
                if tier_cfg.allow_ai {
                    budget.status = BudgetStatus::Premium;
                    budget.blocked_at = None;
                } else {
                    budget.status = BudgetStatus::Blocked;
                }
                Ok((
                    serde_json::to_value(&budget).map_err(StoreError::from)?,
                    budget,
                ))
            },
        )
        .await?;
        info!(uid, tier = %new_tier, "budget tier updated");
        Ok(updated)
    }

    /// Admin adjustment: grow the monthly budget. If the combined spend now
    /// fits the new budget the document returns to premium; otherwise the
    /// spend stays capped and the overrun remains in the degraded bucket.
    pub async fn add_budget(&self, uid: &str, amount_usd: f64) -> Result<UserAiBudget, BudgetError> {
        self.adjust(uid, move |budget| {
            let new_budget = budget.budget_usd + amount_usd;
            let combined = budget.spent_usd + budget.degraded_spend_usd;
            budget.budget_usd = new_budget;
            if combined < new_budget {
                budget.spent_usd = combined;
                budget.degraded_spend_usd = 0.0;
                budget.status = BudgetStatus::Premium;
                budget.degraded_at = None;
                budget.blocked_at = None;
            } else {
                budget.spent_usd = new_budget;
                budget.degraded_spend_usd = combined - new_budget;
                if budget.degraded_spend_usd < budget.max_degraded_usd {
                    budget.status = BudgetStatus::Degraded;
                    budget.blocked_at = None;
                    if budget.degraded_at.is_none() {
                        budget.degraded_at = Some(Utc::now());
                    }
                }
            }
        })
        .await
    }

    /// Admin adjustment: zero all spend counters for the period.
    pub async fn reset_spend(&self, uid: &str) -> Result<UserAiBudget, BudgetError> {
        let tiers = self.tiers.clone();
        self.adjust(uid, move |budget| {
            budget.spent_usd = 0.0;
            budget.degraded_spend_usd = 0.0;
            budget.call_count = 0;
            budget.call_count_degraded = 0;
            budget.degraded_at = None;
            budget.blocked_at = None;
            budget.status = if tiers.budget(budget.tier).allow_ai {
                BudgetStatus::Premium
            } else {
                BudgetStatus::Blocked
            };
        })
        .await
    }

    /// Admin adjustment: release a blocked budget back into the degraded
    /// band by clearing the degraded bucket.
    pub async fn unblock(&self, uid: &str) -> Result<UserAiBudget, BudgetError> {
        self.adjust(uid, |budget| {
            if budget.status != BudgetStatus::Blocked {
                return;
            }
            budget.degraded_spend_usd = 0.0;
            budget.status = BudgetStatus::Degraded;
            budget.blocked_at = None;
            if budget.degraded_at.is_none() {
                budget.degraded_at = Some(Utc::now());
            }
        })
        .await
    }

    async fn adjust<F>(&self, uid: &str, mutate: F) -> Result<UserAiBudget, BudgetError>
    where
        F: Fn(&mut UserAiBudget),
    {
        // The document must exist and be current before adjusting.
        self.current(uid).await?;
        run_transaction::<UserAiBudget, BudgetError, _>(
            self.store.as_ref(),
            BUDGETS,
            uid,
            |existing| {
                let value = existing.ok_or(StoreError::Conflict)?;
                let mut budget: UserAiBudget =
                    serde_json::from_value(value).map_err(StoreError::from)?;
                mutate(&mut budget);
                Ok((
                    serde_json::to_value(&budget).map_err(StoreError::from)?,
                    budget,
                ))
            },
        )
        .await
    }

    async fn emit(&self, event: BudgetEvent) {
        for sink in &self.sinks {
            sink.notify(&event).await;
        }
    }

    fn apply_deduction(
        budget: &mut UserAiBudget,
        cost_usd: f64,
    ) -> Result<Option<BudgetEventKind>, BudgetError> {
        let now = Utc::now();
        let mut event = None;

        match budget.status {
            BudgetStatus::Premium => {
                let new_spent = budget.spent_usd + cost_usd;
                if new_spent <= budget.budget_usd {
                    budget.spent_usd = new_spent;
                } else {
                    // Cap at the boundary; the overrun lands in the degraded
                    // bucket. At most one transition per call: even an
                    // oversized overrun stays degraded until the next call.
                    budget.spent_usd = budget.budget_usd;
                    budget.degraded_spend_usd =
                        (new_spent - budget.budget_usd).min(budget.max_degraded_usd);
                    budget.status = BudgetStatus::Degraded;
                    budget.degraded_at = Some(now);
                    budget.call_count_degraded = 1;
                    event = Some(BudgetEventKind::Degraded);
                }
            }
            BudgetStatus::Degraded => {
                let new_degraded = budget.degraded_spend_usd + cost_usd;
                if new_degraded < budget.max_degraded_usd {
                    budget.degraded_spend_usd = new_degraded;
                } else {
                    budget.degraded_spend_usd = budget.max_degraded_usd;
                    budget.status = BudgetStatus::Blocked;
                    budget.blocked_at = Some(now);
                    event = Some(BudgetEventKind::Blocked);
                }
                budget.call_count_degraded += 1;
            }
            BudgetStatus::Blocked => {
                return Err(BudgetError::DeductWhileBlocked(budget.uid.clone()));
            }
        }

        budget.call_count += 1;
        budget.last_call_at = Some(now);
        Ok(event)
    }
}

#[async_trait]
impl BudgetGate for BudgetEngine {
    async fn check(&self, uid: &str) -> CheckResult {
        match self.current(uid).await {
            Ok(budget) => match budget.status {
                BudgetStatus::Blocked => CheckResult::blocked(),
                BudgetStatus::Degraded => {
                    let remaining = budget.max_degraded_usd - budget.degraded_spend_usd;
                    CheckResult {
                        allowed: remaining > 0.0,
                        status: BudgetStatus::Degraded,
                        routing: RoutingPreference::Cost,
                        remaining_usd: remaining.max(0.0),
                    }
                }
                BudgetStatus::Premium => {
                    let remaining = budget.budget_usd - budget.spent_usd;
                    let routing = if remaining > SOFT_DOWNGRADE_FRACTION * budget.budget_usd {
                        RoutingPreference::Quality
                    } else {
                        RoutingPreference::Cost
                    };
                    CheckResult {
                        allowed: true,
                        status: BudgetStatus::Premium,
                        routing,
                        remaining_usd: remaining.max(0.0),
                    }
                }
            },
            Err(err) => {
                // Fail safe: an unreadable budget admits nothing.
                warn!(uid, error = %err, "budget check failed; defaulting to blocked");
                CheckResult::blocked()
            }
        }
    }

    async fn deduct(
        &self,
        uid: &str,
        cost_usd: f64,
        request_type: &str,
        model: &str,
    ) -> Result<UserAiBudget, BudgetError> {
        // Ensure the document exists and is current; deduct then reloads it
        // inside the transaction.
        self.current(uid).await?;

        let mut event_kind: Option<BudgetEventKind> = None;
        let updated = run_transaction::<UserAiBudget, BudgetError, _>(
            self.store.as_ref(),
            BUDGETS,
            uid,
            |existing| {
                let value = existing.ok_or(StoreError::Conflict)?;
                let mut budget: UserAiBudget =
                    serde_json::from_value(value).map_err(StoreError::from)?;
                event_kind = Self::apply_deduction(&mut budget, cost_usd)?;
                Ok((
                    serde_json::to_value(&budget).map_err(StoreError::from)?,
                    budget,
                ))
            },
        )
        .await?;

        debug!(
            uid,
            cost_usd,
            request_type,
            model,
            status = ?updated.status,
            spent = updated.spent_usd,
            "budget deduction committed"
        );

        if let Some(kind) = event_kind {
            self.emit(BudgetEvent {
                uid: uid.to_string(),
                period: updated.period.clone(),
                kind,
                at: Utc::now(),
            })
            .await;
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    struct FixedTier(Tier);

    #[async_trait]
    impl TierSource for FixedTier {
        async fn tier_of(&self, _uid: &str) -> anyhow::Result<Tier> {
            Ok(self.0)
        }
    }

    fn engine(store: Arc<MemoryStore>, tier: Tier) -> BudgetEngine {
        BudgetEngine::new(
            store,
            TierPolicy::default(),
            Arc::new(FixedTier(tier)),
            vec![],
        )
    }

    async fn seed(engine: &BudgetEngine, uid: &str, spent: f64) {
        engine.current(uid).await.unwrap();
        engine.adjust(uid, |b| b.spent_usd = spent).await.unwrap();
    }

    #[tokio::test]
    async fn first_access_creates_a_premium_budget() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        let budget = engine.current("u1").await.unwrap();
        assert_eq!(budget.status, BudgetStatus::Premium);
        assert_eq!(budget.budget_usd, 3.0);
        assert_eq!(budget.max_degraded_usd, 5.0);
        assert!(budget.invariants_hold());
    }

    #[tokio::test]
    async fn free_tier_is_blocked_from_the_start() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Free);
        let result = engine.check("u1").await;
        assert!(!result.allowed);
        assert_eq!(result.status, BudgetStatus::Blocked);
        assert_eq!(result.remaining_usd, 0.0);
    }

    #[tokio::test]
    async fn soft_downgrade_below_twenty_percent_remaining() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.41).await;

        let result = engine.check("u1").await;
        assert!(result.allowed);
        assert_eq!(result.status, BudgetStatus::Premium);
        assert_eq!(result.routing, RoutingPreference::Cost);
    }

    #[tokio::test]
    async fn plenty_of_budget_keeps_quality_routing() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 0.50).await;

        let result = engine.check("u1").await;
        assert_eq!(result.routing, RoutingPreference::Quality);
    }

    #[tokio::test]
    async fn overrun_caps_spend_and_transitions_to_degraded() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.90).await;

        let budget = engine.deduct("u1", 0.15, "nutrition:meal-text", "m").await.unwrap();
        assert!((budget.spent_usd - 3.0).abs() < 1e-9);
        assert!((budget.degraded_spend_usd - 0.05).abs() < 1e-9);
        assert_eq!(budget.status, BudgetStatus::Degraded);
        assert!(budget.degraded_at.is_some());
        assert_eq!(budget.call_count_degraded, 1);
        assert!(budget.invariants_hold());
    }

    #[tokio::test]
    async fn degraded_overrun_caps_and_blocks() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.90).await;
        engine.deduct("u1", 0.15, "rt", "m").await.unwrap();

        let budget = engine.deduct("u1", 4.97, "rt", "m").await.unwrap();
        assert!((budget.degraded_spend_usd - 5.0).abs() < 1e-9);
        assert_eq!(budget.status, BudgetStatus::Blocked);
        assert!(budget.blocked_at.is_some());
        assert!(budget.invariants_hold());

        let result = engine.check("u1").await;
        assert!(!result.allowed);
        assert_eq!(result.status, BudgetStatus::Blocked);
    }

    #[tokio::test]
    async fn deduct_on_blocked_is_a_programming_error() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.90).await;
        engine.deduct("u1", 0.15, "rt", "m").await.unwrap();
        engine.deduct("u1", 4.97, "rt", "m").await.unwrap();

        let err = engine.deduct("u1", 0.01, "rt", "m").await.unwrap_err();
        assert!(matches!(err, BudgetError::DeductWhileBlocked(_)));
    }

    #[tokio::test]
    async fn upgrade_restores_premium_without_refund() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.90).await;
        engine.deduct("u1", 0.15, "rt", "m").await.unwrap();
        engine.deduct("u1", 4.97, "rt", "m").await.unwrap();

        let budget = engine.upgrade_tier("u1", Tier::ProPlus).await.unwrap();
        assert_eq!(budget.budget_usd, 10.0);
        assert_eq!(budget.max_degraded_usd, 5.0);
        assert_eq!(budget.status, BudgetStatus::Premium);
        assert!(budget.blocked_at.is_none());
        assert!((budget.spent_usd - 3.0).abs() < 1e-9);
        assert!((budget.degraded_spend_usd - 5.0).abs() < 1e-9);

        let result = engine.check("u1").await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn check_fails_safe_to_blocked_on_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone(), Tier::Pro);
        engine.current("u1").await.unwrap();

        store.set_unavailable(true);
        let result = engine.check("u1").await;
        assert!(!result.allowed);
        assert_eq!(result.status, BudgetStatus::Blocked);
    }

    #[tokio::test]
    async fn degraded_events_are_emitted_once() {
        struct Capture(parking_lot::Mutex<Vec<BudgetEventKind>>);

        #[async_trait]
        impl AlertSink for Capture {
            async fn notify(&self, event: &BudgetEvent) {
                self.0.lock().push(event.kind);
            }
        }

        let store = Arc::new(MemoryStore::new());
        let capture = Arc::new(Capture(parking_lot::Mutex::new(Vec::new())));
        let engine = BudgetEngine::new(
            store,
            TierPolicy::default(),
            Arc::new(FixedTier(Tier::Pro)),
            vec![capture.clone() as Arc<dyn AlertSink>],
        );
        engine.current("u1").await.unwrap();
        engine.adjust("u1", |b| b.spent_usd = 2.90).await.unwrap();

        engine.deduct("u1", 0.15, "rt", "m").await.unwrap();
        assert_eq!(capture.0.lock().as_slice(), &[BudgetEventKind::Degraded]);

        engine.deduct("u1", 4.97, "rt", "m").await.unwrap();
        assert_eq!(
            capture.0.lock().as_slice(),
            &[BudgetEventKind::Degraded, BudgetEventKind::Blocked]
        );
    }

    #[tokio::test]
    async fn admin_unblock_reopens_the_degraded_band() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.90).await;
        engine.deduct("u1", 0.15, "rt", "m").await.unwrap();
        engine.deduct("u1", 4.97, "rt", "m").await.unwrap();

        let budget = engine.unblock("u1").await.unwrap();
        assert_eq!(budget.status, BudgetStatus::Degraded);
        assert_eq!(budget.degraded_spend_usd, 0.0);
        assert!(budget.blocked_at.is_none());
        assert!(budget.invariants_hold());
    }

    #[tokio::test]
    async fn admin_add_budget_can_restore_premium() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store, Tier::Pro);
        seed(&engine, "u1", 2.90).await;
        engine.deduct("u1", 0.15, "rt", "m").await.unwrap();

        let budget = engine.add_budget("u1", 5.0).await.unwrap();
        assert_eq!(budget.status, BudgetStatus::Premium);
        assert!((budget.spent_usd - 3.05).abs() < 1e-9);
        assert_eq!(budget.degraded_spend_usd, 0.0);
        assert_eq!(budget.budget_usd, 8.0);
    }
}
