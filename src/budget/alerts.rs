//! Budget Event Sinks
//!
//! Typed status-change events fan out to notification sinks. Delivery is
//! opaque to the engine; the default sinks log and persist dashboard alerts.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{BudgetAlert, BudgetEvent};
use crate::store::{put_doc, DocumentStore};

/// Dashboard alerts collection, `{uid}_{period}_{kind}`.
pub const BUDGET_ALERTS: &str = "budget_alerts";

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: &BudgetEvent);
}

/// Structured-log sink. Always installed.
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn notify(&self, event: &BudgetEvent) {
        info!(
            uid = %event.uid,
            period = %event.period,
            kind = event.kind.as_str(),
            "budget status changed"
        );
    }
}

/// Persists one dashboard alert per `(uid, period, kind)`. Write failures
/// are logged and swallowed; alerting is best-effort.
pub struct StoreAlertSink {
    store: Arc<dyn DocumentStore>,
}

impl StoreAlertSink {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AlertSink for StoreAlertSink {
    async fn notify(&self, event: &BudgetEvent) {
        let alert = BudgetAlert {
            uid: event.uid.clone(),
            period: event.period.clone(),
            kind: event.kind,
            created_at: event.at,
        };
        if let Err(err) = put_doc(self.store.as_ref(), BUDGET_ALERTS, &alert.doc_id(), &alert).await
        {
            warn!(uid = %event.uid, error = %err, "failed to persist budget alert");
        }
    }
}
