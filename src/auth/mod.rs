//! Auth and Entitlement Gate
//!
//! Verifies bearer tokens through the identity collaborator, caches derived
//! entitlements with a short TTL, auto-provisions unknown users on the free
//! plan, and tracks per-app daily AI quotas.

pub mod entitlements;
pub mod sso;

pub use entitlements::derive_entitlements;
pub use sso::{SsoError, SsoSigner};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::identity::UserDirectory;
use crate::models::{AppId, Entitlements, Quota, Tier};
use crate::store::{run_transaction, DocumentStore, StoreError};

/// Per-app per-day AI call counters, `{uid}_{app}_{date}`.
pub const APP_USAGE: &str = "app_usage";

/// What the identity provider asserts about a bearer token.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub uid: String,
    pub email: String,
    pub provider: String,
    pub email_verified: bool,
}

/// Opaque token verification, delegated to the identity provider.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> anyhow::Result<VerifiedToken>;
}

/// Token table for tests and local runs.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: DashMap<String, VerifiedToken>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bearer: &str, token: VerifiedToken) {
        self.tokens.insert(bearer.to_string(), token);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, bearer: &str) -> anyhow::Result<VerifiedToken> {
        self.tokens
            .get(bearer)
            .map(|t| t.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown token"))
    }
}

/// The authenticated caller, attached to the request by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub uid: String,
    pub email: String,
    pub tier: Tier,
    pub admin: bool,
    pub entitlements: Entitlements,
    pub identity_provider: String,
    pub email_verified: bool,
}

impl AuthContext {
    pub fn ensure_app(&self, app: AppId) -> Result<(), ApiError> {
        if self.entitlements.has_app_access(app) {
            Ok(())
        } else {
            Err(ApiError::UpgradeRequired(format!(
                "the {app} app requires a higher plan"
            )))
        }
    }

    pub fn ensure_feature(&self, feature: &str) -> Result<(), ApiError> {
        if self.entitlements.has_feature(feature) {
            Ok(())
        } else {
            Err(ApiError::FeatureNotAvailable(feature.to_string()))
        }
    }

    pub fn ensure_admin(&self) -> Result<(), ApiError> {
        if self.admin || self.tier == Tier::Enterprise {
            Ok(())
        } else {
            Err(ApiError::InsufficientPrivileges)
        }
    }
}

struct CachedContext {
    at: Instant,
    context: AuthContext,
}

pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<UserDirectory>,
    cache: DashMap<String, CachedContext>,
    ttl: Duration,
}

impl AuthGate {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<UserDirectory>,
        ttl: Duration,
    ) -> Self {
        Self {
            verifier,
            directory,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Verify a bearer token and resolve the caller's entitlements, from
    /// cache when fresh.
    pub async fn verify_bearer(&self, bearer: &str) -> Result<AuthContext, ApiError> {
        let verified = self.verifier.verify(bearer).await.map_err(|err| {
            debug!(error = %err, "token verification failed");
            ApiError::Unauthorized
        })?;

        if let Some(hit) = self.cache.get(&verified.uid) {
            if hit.at.elapsed() < self.ttl {
                return Ok(hit.context.clone());
            }
        }

        let user = self
            .directory
            .get_or_provision(&verified.uid, &verified.email)
            .await
            .map_err(|err| {
                warn!(uid = %verified.uid, error = %err, "user load failed");
                ApiError::Unauthorized
            })?;

        let plan = self
            .directory
            .plan_for_tier(user.tier)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no plan configured for tier {}", user.tier))?;
        let context = AuthContext {
            uid: user.uid.clone(),
            email: user.email.clone(),
            tier: user.tier,
            admin: user.admin,
            entitlements: derive_entitlements(&plan),
            identity_provider: verified.provider,
            email_verified: verified.email_verified,
        };

        self.cache.insert(
            user.uid.clone(),
            CachedContext {
                at: Instant::now(),
                context: context.clone(),
            },
        );

        // Best-effort login bump; never blocks or fails the request.
        let directory = self.directory.clone();
        let uid = user.uid.clone();
        tokio::spawn(async move {
            directory.touch_last_login(&uid).await;
        });

        Ok(context)
    }

    /// Drop a user's cached entitlements, e.g. after a plan change.
    pub fn invalidate(&self, uid: &str) {
        self.cache.remove(uid);
    }
}

/// Outcome of an AI quota reservation.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    /// Calls left after this one; `None` for unlimited plans.
    pub remaining: Option<u64>,
}

/// Per-app daily AI call counter, checked by the AI endpoint ahead of the
/// budget pipeline.
pub struct AiQuotaTracker {
    store: Arc<dyn DocumentStore>,
}

impl AiQuotaTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn doc_id(uid: &str, app: AppId, date: &str) -> String {
        format!("{uid}_{app}_{date}")
    }

    pub async fn usage_today(&self, uid: &str, app: AppId) -> Result<u64, StoreError> {
        let date = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let doc = self.store.get(APP_USAGE, &Self::doc_id(uid, app, &date)).await?;
        Ok(doc
            .and_then(|d| d.data.get("count").and_then(serde_json::Value::as_u64))
            .unwrap_or(0))
    }

    /// Check the quota and reserve one call. The counter increment is
    /// fire-and-forget; a failed write can at worst under-count one call.
    pub async fn reserve(
        &self,
        uid: &str,
        app: AppId,
        quota: Quota,
    ) -> Result<QuotaDecision, ApiError> {
        let used = self.usage_today(uid, app).await.map_err(|err| {
            warn!(uid, error = %err, "quota read failed");
            ApiError::Internal(err.into())
        })?;
        if !quota.admits(used) {
            return Err(ApiError::AiQuotaExceeded {
                reset_at: next_utc_midnight(),
            });
        }

        let store = self.store.clone();
        let doc_id = Self::doc_id(uid, app, &Utc::now().date_naive().format("%Y-%m-%d").to_string());
        let uid_owned = uid.to_string();
        tokio::spawn(async move {
            let outcome = run_transaction::<(), StoreError, _>(
                store.as_ref(),
                APP_USAGE,
                &doc_id,
                |existing| {
                    let count = existing
                        .as_ref()
                        .and_then(|v| v.get("count").and_then(serde_json::Value::as_u64))
                        .unwrap_or(0);
                    Ok((serde_json::json!({ "count": count + 1 }), ()))
                },
            )
            .await;
            if let Err(err) = outcome {
                warn!(uid = %uid_owned, error = %err, "quota increment failed");
            }
        });

        Ok(QuotaDecision {
            remaining: quota.remaining(used + 1),
        })
    }
}

fn next_utc_midnight() -> chrono::DateTime<Utc> {
    let tomorrow = Utc::now().date_naive() + ChronoDuration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight"))
}
