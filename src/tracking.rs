//! Cost Tracker
//!
//! Appends immutable call records, maintains per-user daily aggregates on
//! successful calls, and produces the idempotent daily rollup. Tracking is
//! best-effort in the call path: write failures are logged and swallowed;
//! the daily rollup is the authoritative reconciliation.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::models::{DailyCostSummary, DailyUsage, LlmCallRecord, UserSpend};
use crate::store::{put_doc, run_transaction, DocumentStore, StoreError};

/// Append-only call log.
pub const LLM_CALLS: &str = "llm_calls";
/// Per-user per-day aggregates, `{uid}_{date}`.
pub const AI_USAGE: &str = "ai_usage";
/// Daily rollups, `daily_{date}`.
pub const FINOPS_DAILY: &str = "finops_daily";

pub struct CostTracker {
    store: Arc<dyn DocumentStore>,
}

impl CostTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Record one call outcome. On success, additionally bump the caller's
    /// daily aggregate in a single-document transaction. Never fails the
    /// request path.
    pub async fn record(&self, record: &LlmCallRecord) {
        let log_id = Uuid::new_v4().to_string();
        if let Err(err) = put_doc(self.store.as_ref(), LLM_CALLS, &log_id, record).await {
            warn!(uid = %record.uid, error = %err, "failed to append call record");
        }

        if !record.success {
            return;
        }

        let date = record.timestamp.date_naive().format("%Y-%m-%d").to_string();
        let doc_id = DailyUsage::doc_id(&record.uid, &date);
        let outcome = run_transaction::<(), StoreError, _>(
            self.store.as_ref(),
            AI_USAGE,
            &doc_id,
            |existing| {
                let mut usage = match existing {
                    Some(value) => serde_json::from_value::<DailyUsage>(value)?,
                    None => DailyUsage::empty(&record.uid, &date),
                };
                usage.total_cost_usd += record.cost_usd;
                usage.total_calls += 1;
                *usage
                    .request_types
                    .entry(record.request_type.clone())
                    .or_insert(0) += 1;
                Ok((serde_json::to_value(&usage)?, ()))
            },
        )
        .await;
        if let Err(err) = outcome {
            warn!(uid = %record.uid, error = %err, "failed to update daily usage aggregate");
        }
    }

    /// Single pass over one day's call log, producing the `daily_{date}`
    /// summary. Idempotent: re-running replaces the document with identical
    /// content.
    pub async fn aggregate_daily(&self, date: NaiveDate) -> Result<DailyCostSummary, StoreError> {
        let mut summary = DailyCostSummary {
            date: date.format("%Y-%m-%d").to_string(),
            total_cost_usd: 0.0,
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            by_provider: BTreeMap::new(),
            by_request_type: BTreeMap::new(),
            by_preference: BTreeMap::new(),
            top_users: Vec::new(),
        };
        let mut per_user: BTreeMap<String, UserSpend> = BTreeMap::new();

        for doc in self.store.scan(LLM_CALLS).await? {
            let record: LlmCallRecord = match serde_json::from_value(doc.data) {
                Ok(record) => record,
                Err(err) => {
                    warn!(doc_id = %doc.id, error = %err, "skipping malformed call record");
                    continue;
                }
            };
            if record.timestamp.date_naive() != date {
                continue;
            }

            summary.total_calls += 1;
            if record.success {
                summary.success_count += 1;
            } else {
                summary.failure_count += 1;
            }
            summary.total_cost_usd += record.cost_usd;
            *summary
                .by_provider
                .entry(record.provider.as_str().to_string())
                .or_insert(0.0) += record.cost_usd;
            *summary
                .by_request_type
                .entry(record.request_type.clone())
                .or_insert(0.0) += record.cost_usd;
            *summary
                .by_preference
                .entry(record.routing_preference.as_str().to_string())
                .or_insert(0.0) += record.cost_usd;

            let spend = per_user.entry(record.uid.clone()).or_insert(UserSpend {
                uid: record.uid.clone(),
                cost_usd: 0.0,
                calls: 0,
            });
            spend.cost_usd += record.cost_usd;
            spend.calls += 1;
        }

        let mut users: Vec<UserSpend> = per_user.into_values().collect();
        users.sort_by(|a, b| {
            b.cost_usd
                .partial_cmp(&a.cost_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        users.truncate(10);
        summary.top_users = users;

        put_doc(
            self.store.as_ref(),
            FINOPS_DAILY,
            &DailyCostSummary::doc_id(date),
            &summary,
        )
        .await?;
        Ok(summary)
    }

    /// All call records for one uid within one `YYYY-MM` period. Backs the
    /// usage breakdown endpoint.
    pub async fn calls_for_period(
        &self,
        uid: &str,
        period: &str,
    ) -> Result<Vec<LlmCallRecord>, StoreError> {
        let mut calls = Vec::new();
        for doc in self.store.scan(LLM_CALLS).await? {
            let record: LlmCallRecord = match serde_json::from_value(doc.data) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if record.uid == uid && record.timestamp.format("%Y-%m").to_string() == period {
                calls.push(record);
            }
        }
        calls.sort_by_key(|r| r.timestamp);
        Ok(calls)
    }

    /// The caller's daily usage aggregate, if any calls landed today.
    pub async fn daily_usage(
        &self,
        uid: &str,
        date: &str,
    ) -> Result<Option<DailyUsage>, StoreError> {
        match self
            .store
            .get(AI_USAGE, &DailyUsage::doc_id(uid, date))
            .await?
        {
            Some(doc) => Ok(Some(serde_json::from_value::<DailyUsage>(doc.data)?)),
            None => Ok(None),
        }
    }
}
