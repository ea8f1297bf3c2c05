//! Domain Documents
//!
//! Serde-serializable documents and enums shared across the gateway:
//! identity, entitlements, budgets, call records, and sharing grants.
//! Documents persist with camelCase keys to stay wire-compatible with the
//! legacy HTTP surface; enum values are snake_case.

pub mod budget;
pub mod calls;
pub mod identity;
pub mod sharing;

pub use budget::{
    current_period, period_reset_at, BudgetAlert, BudgetEvent, BudgetEventKind, BudgetStatus,
    UserAiBudget,
};
pub use calls::{
    CallMetadata, DailyCostSummary, DailyUsage, LlmCallRecord, RoutingPreference, TokenUsage,
    UserSpend,
};
pub use identity::{
    AppEntitlement, AppId, AppTier, BillingStatus, Entitlements, FeatureValue, Plan, Quota, Tier,
    User,
};
pub use sharing::{Invitation, InvitationStatus, ShareRole, SharedAccess};
