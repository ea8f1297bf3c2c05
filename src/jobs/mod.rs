//! Scheduled Jobs
//!
//! Monthly budget reset, daily cost rollup, weekly power-user report, and
//! the hourly approaching-limit sweep. Every job is idempotent and writes
//! its own execution log. The scheduler owns explicit start/stop task
//! handles bound to the process lifecycle.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::budget::alerts::BUDGET_ALERTS;
use crate::budget::{BudgetEngine, BUDGETS, BUDGET_HISTORY};
use crate::models::{
    current_period, BudgetAlert, BudgetEventKind, BudgetStatus, Tier, UserAiBudget,
};
use crate::store::{put_doc, DocumentStore};
use crate::tracking::CostTracker;

pub const JOB_LOGS: &str = "job_logs";
pub const BUDGET_REPORTS: &str = "budget_reports";

/// Budgets processed per batch during the monthly reset.
const RESET_BATCH_SIZE: usize = 100;
/// Premium budgets at or past this fraction of spend trigger an alert.
const APPROACHING_LIMIT_FRACTION: f64 = 0.8;

/// Execution log entry, one per job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub job: String,
    pub ran_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: JobOutcome,
    pub details: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Weekly report row: a user degraded or blocked in consecutive periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatUser {
    pub uid: String,
    pub current_status: BudgetStatus,
    pub last_status: BudgetStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerUserReport {
    pub generated_at: DateTime<Utc>,
    pub period: String,
    pub degraded_count: usize,
    pub blocked_count: usize,
    pub repeat_users: Vec<RepeatUser>,
}

pub struct JobRunner {
    store: Arc<dyn DocumentStore>,
    engine: Arc<BudgetEngine>,
    tracker: Arc<CostTracker>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        engine: Arc<BudgetEngine>,
        tracker: Arc<CostTracker>,
    ) -> Self {
        Self {
            store,
            engine,
            tracker,
        }
    }

    /// Monthly reset: roll every stale budget to the current period, in
    /// batches. Lazy rolls on read make this idempotent.
    pub async fn monthly_reset(&self) -> anyhow::Result<String> {
        let period = current_period(Utc::now());
        let mut stale: Vec<String> = Vec::new();
        for doc in self.store.scan(BUDGETS).await? {
            if let Ok(budget) = serde_json::from_value::<UserAiBudget>(doc.data) {
                if budget.period != period {
                    stale.push(budget.uid);
                }
            }
        }

        let total = stale.len();
        for batch in stale.chunks(RESET_BATCH_SIZE) {
            for uid in batch {
                if let Err(err) = self.engine.current(uid).await {
                    warn!(uid, error = %err, "budget roll failed during monthly reset");
                }
            }
            info!(batch = batch.len(), "monthly reset batch processed");
        }
        Ok(format!("rolled {total} budgets to {period}"))
    }

    /// Daily rollup over yesterday's call log. Safe to re-run.
    pub async fn daily_rollup(&self) -> anyhow::Result<String> {
        let yesterday = (Utc::now() - ChronoDuration::days(1)).date_naive();
        let summary = self.tracker.aggregate_daily(yesterday).await?;
        Ok(format!(
            "daily_{}: {} calls, ${:.4}",
            summary.date, summary.total_calls, summary.total_cost_usd
        ))
    }

    /// Weekly report: users degraded or blocked both this period and last.
    pub async fn weekly_power_user_report(&self) -> anyhow::Result<String> {
        let now = Utc::now();
        let period = current_period(now);
        let last_period = current_period(
            Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(now)
                - ChronoDuration::days(1),
        );

        let mut current: HashMap<String, BudgetStatus> = HashMap::new();
        for doc in self.store.scan(BUDGETS).await? {
            if let Ok(budget) = serde_json::from_value::<UserAiBudget>(doc.data) {
                if budget.period == period && budget.status != BudgetStatus::Premium {
                    current.insert(budget.uid, budget.status);
                }
            }
        }

        let mut repeat_users = Vec::new();
        for doc in self.store.scan(BUDGET_HISTORY).await? {
            let Ok(old) = serde_json::from_value::<UserAiBudget>(doc.data) else {
                continue;
            };
            if old.period != last_period || old.status == BudgetStatus::Premium {
                continue;
            }
            if let Some(current_status) = current.get(&old.uid) {
                repeat_users.push(RepeatUser {
                    uid: old.uid,
                    current_status: *current_status,
                    last_status: old.status,
                });
            }
        }
        repeat_users.sort_by(|a, b| a.uid.cmp(&b.uid));

        let report = PowerUserReport {
            generated_at: now,
            period: period.clone(),
            degraded_count: current
                .values()
                .filter(|s| **s == BudgetStatus::Degraded)
                .count(),
            blocked_count: current
                .values()
                .filter(|s| **s == BudgetStatus::Blocked)
                .count(),
            repeat_users,
        };
        let report_id = format!("week_{}", now.date_naive().format("%Y-%m-%d"));
        put_doc(self.store.as_ref(), BUDGET_REPORTS, &report_id, &report).await?;
        Ok(format!(
            "{report_id}: {} repeat users",
            report.repeat_users.len()
        ))
    }

    /// Hourly sweep: alert premium users at 80%+ of budget, once per
    /// period.
    pub async fn approaching_limit_sweep(&self) -> anyhow::Result<String> {
        let period = current_period(Utc::now());
        let mut fired = 0usize;

        for doc in self.store.scan(BUDGETS).await? {
            let Ok(budget) = serde_json::from_value::<UserAiBudget>(doc.data) else {
                continue;
            };
            if budget.period != period
                || budget.status != BudgetStatus::Premium
                || budget.tier == Tier::Free
                || budget.budget_usd <= 0.0
                || budget.spent_usd / budget.budget_usd < APPROACHING_LIMIT_FRACTION
            {
                continue;
            }

            let alert = BudgetAlert {
                uid: budget.uid.clone(),
                period: period.clone(),
                kind: BudgetEventKind::ApproachingLimit,
                created_at: Utc::now(),
            };
            // Dedup on (uid, period, kind).
            if self
                .store
                .get(BUDGET_ALERTS, &alert.doc_id())
                .await?
                .is_some()
            {
                continue;
            }
            put_doc(self.store.as_ref(), BUDGET_ALERTS, &alert.doc_id(), &alert).await?;
            info!(uid = %budget.uid, "approaching-limit alert fired");
            fired += 1;
        }
        Ok(format!("fired {fired} approaching-limit alerts"))
    }

    /// Run one job, timing it and appending the execution log.
    pub async fn run_logged<F, Fut>(&self, job: &str, run: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<String>>,
    {
        let started = Instant::now();
        let ran_at = Utc::now();
        let (outcome, details) = match run().await {
            Ok(details) => (JobOutcome::Succeeded, details),
            Err(err) => {
                error!(job, error = %err, "scheduled job failed");
                (JobOutcome::Failed, err.to_string())
            }
        };
        let log = JobLog {
            job: job.to_string(),
            ran_at,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
            details,
        };
        let log_id = format!("{job}_{}", Uuid::new_v4());
        if let Err(err) = put_doc(self.store.as_ref(), JOB_LOGS, &log_id, &log).await {
            warn!(job, error = %err, "failed to write job log");
        }
    }
}

/// Spawned schedule loops with an explicit stop.
pub struct JobScheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn start(runner: Arc<JobRunner>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            Self::spawn_loop(runner.clone(), shutdown_rx.clone(), "monthly_reset", |now| {
                next_monthly(now)
            }),
            Self::spawn_loop(runner.clone(), shutdown_rx.clone(), "daily_rollup", |now| {
                next_daily(now)
            }),
            Self::spawn_loop(
                runner.clone(),
                shutdown_rx.clone(),
                "weekly_power_user_report",
                next_weekly,
            ),
            Self::spawn_loop(runner, shutdown_rx, "approaching_limit_sweep", next_hourly),
        ];
        Self { shutdown_tx, tasks }
    }

    fn spawn_loop(
        runner: Arc<JobRunner>,
        mut shutdown_rx: watch::Receiver<bool>,
        job: &'static str,
        next_fire: fn(DateTime<Utc>) -> DateTime<Utc>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = (next_fire(Utc::now()) - Utc::now())
                    .to_std()
                    .unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        dispatch(&runner, job).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!(job, "job loop stopping");
                        break;
                    }
                }
            }
        })
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn dispatch(runner: &Arc<JobRunner>, job: &str) {
    match job {
        "monthly_reset" => runner.run_logged(job, || runner.monthly_reset()).await,
        "daily_rollup" => runner.run_logged(job, || runner.daily_rollup()).await,
        "weekly_power_user_report" => {
            runner
                .run_logged(job, || runner.weekly_power_user_report())
                .await
        }
        "approaching_limit_sweep" => {
            runner
                .run_logged(job, || runner.approaching_limit_sweep())
                .await
        }
        _ => unreachable!("unknown job {job}"),
    }
}

/// 1st of next month, 00:00 UTC.
fn next_monthly(now: DateTime<Utc>) -> DateTime<Utc> {
    crate::models::period_reset_at(&current_period(now))
}

/// Next 02:00 UTC.
fn next_daily(now: DateTime<Utc>) -> DateTime<Utc> {
    let today_2am = Utc
        .from_utc_datetime(&now.date_naive().and_hms_opt(2, 0, 0).expect("valid time"));
    if now < today_2am {
        today_2am
    } else {
        today_2am + ChronoDuration::days(1)
    }
}

/// Next Monday 01:00 UTC.
fn next_weekly(now: DateTime<Utc>) -> DateTime<Utc> {
    let mut day = now.date_naive();
    loop {
        day += ChronoDuration::days(1);
        if day.weekday() == Weekday::Mon {
            break;
        }
    }
    let candidate = Utc.from_utc_datetime(&day.and_hms_opt(1, 0, 0).expect("valid time"));
    // Still on Monday before 01:00 counts for today.
    let today_1am = Utc
        .from_utc_datetime(&now.date_naive().and_hms_opt(1, 0, 0).expect("valid time"));
    if now.weekday() == Weekday::Mon && now < today_1am {
        today_1am
    } else {
        candidate
    }
}

/// Top of the next hour.
fn next_hourly(now: DateTime<Utc>) -> DateTime<Utc> {
    let this_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    this_hour + ChronoDuration::hours(1)
}
