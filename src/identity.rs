//! Identity Directory
//!
//! The gateway's read-mostly view of the identity collaborator: user
//! records, the static plan catalog, and tier lookups for the budget
//! engine. Missing users are auto-provisioned on the free plan at first
//! verified token.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::budget::TierSource;
use crate::models::{BillingStatus, Plan, Tier, User};
use crate::store::{get_doc, put_doc, run_transaction, DocumentStore, StoreError};

pub const USERS: &str = "users";

pub struct UserDirectory {
    store: Arc<dyn DocumentStore>,
    plans_by_id: HashMap<String, Plan>,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn DocumentStore>, catalog: Vec<Plan>) -> Self {
        let plans_by_id = catalog
            .into_iter()
            .map(|plan| (plan.id.clone(), plan))
            .collect();
        Self { store, plans_by_id }
    }

    pub fn plan_by_id(&self, id: &str) -> Option<&Plan> {
        self.plans_by_id.get(id)
    }

    pub fn plan_for_tier(&self, tier: Tier) -> Option<&Plan> {
        self.plans_by_id.values().find(|plan| plan.tier == tier)
    }

    pub async fn get(&self, uid: &str) -> Result<Option<User>, StoreError> {
        get_doc(self.store.as_ref(), USERS, uid).await
    }

    /// Fetch the user, creating a free-plan record if none exists yet.
    pub async fn get_or_provision(&self, uid: &str, email: &str) -> Result<User, StoreError> {
        if let Some(user) = self.get(uid).await? {
            return Ok(user);
        }
        let now = Utc::now();
        let user = User {
            uid: uid.to_string(),
            email: email.to_string(),
            tier: Tier::Free,
            display_name: None,
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
            onboarding_completed: false,
            admin: false,
            created_at: now,
            last_login_at: now,
            billing_status: BillingStatus::Free,
            trial_ends_at: None,
        };
        put_doc(self.store.as_ref(), USERS, uid, &user).await?;
        info!(uid, "auto-provisioned user on free plan");
        Ok(user)
    }

    /// Transactional tier change, used by plan changes and admin upgrades.
    pub async fn set_tier(&self, uid: &str, tier: Tier) -> Result<User, StoreError> {
        run_transaction::<User, StoreError, _>(self.store.as_ref(), USERS, uid, |existing| {
            let value = existing.ok_or(StoreError::Conflict)?;
            let mut user: User = serde_json::from_value(value)?;
            user.tier = tier;
            user.billing_status = if tier == Tier::Free {
                BillingStatus::Free
            } else {
                BillingStatus::Active
            };
            Ok((serde_json::to_value(&user)?, user))
        })
        .await
    }

    /// Best-effort last-login bump. Failures are logged at debug and
    /// swallowed.
    pub async fn touch_last_login(&self, uid: &str) {
        let outcome = run_transaction::<(), StoreError, _>(
            self.store.as_ref(),
            USERS,
            uid,
            |existing| {
                let value = existing.ok_or(StoreError::Conflict)?;
                let mut user: User = serde_json::from_value(value)?;
                user.last_login_at = Utc::now();
                Ok((serde_json::to_value(&user)?, ()))
            },
        )
        .await;
        if let Err(err) = outcome {
            debug!(uid, error = %err, "last-login bump skipped");
        }
    }
}

#[async_trait]
impl TierSource for UserDirectory {
    async fn tier_of(&self, uid: &str) -> anyhow::Result<Tier> {
        Ok(self.get(uid).await?.map(|u| u.tier).unwrap_or(Tier::Free))
    }
}
