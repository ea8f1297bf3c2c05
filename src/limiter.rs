//! Tiered Rate Limiter
//!
//! Sliding windows keyed by `(uid, scope, window start)` in a concurrent
//! map. Reservations are atomic per key; cross-key checks (daily, hourly,
//! per-endpoint) are not mutually atomic, which is acceptable. A janitor
//! task reclaims expired windows.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::TierPolicy;
use crate::models::Tier;

/// Scope key for the all-endpoints daily window.
const SCOPE_DAY: &str = "_day";
/// Scope key for the all-endpoints hourly window.
const SCOPE_HOUR: &str = "_hour";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    uid: String,
    scope: String,
    window_start: i64,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    reset_time: DateTime<Utc>,
}

/// A denied reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub kind: &'static str,
    pub reset_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: Arc<DashMap<WindowKey, WindowEntry>>,
    tiers: TierPolicy,
}

impl RateLimiter {
    pub fn new(tiers: TierPolicy) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            tiers,
        }
    }

    /// Reserve one call across the daily, hourly, and per-endpoint windows.
    /// The first exhausted window denies the request.
    pub fn check(
        &self,
        uid: &str,
        endpoint: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<(), LimitExceeded> {
        let limits = self.tiers.limits(tier);
        let (day_start, day_end) = day_window(now);
        let (hour_start, hour_end) = hour_window(now);

        self.reserve(
            WindowKey {
                uid: uid.to_string(),
                scope: SCOPE_DAY.to_string(),
                window_start: day_start,
            },
            limits.max_calls_per_day,
            day_end,
            now,
        )
        .map_err(|reset_at| LimitExceeded {
            kind: "daily_calls",
            reset_at,
        })?;

        self.reserve(
            WindowKey {
                uid: uid.to_string(),
                scope: SCOPE_HOUR.to_string(),
                window_start: hour_start,
            },
            limits.max_calls_per_hour,
            hour_end,
            now,
        )
        .map_err(|reset_at| LimitExceeded {
            kind: "hourly_calls",
            reset_at,
        })?;

        self.reserve(
            WindowKey {
                uid: uid.to_string(),
                scope: endpoint.to_string(),
                window_start: hour_start,
            },
            limits.max_calls_per_endpoint_per_hour,
            hour_end,
            now,
        )
        .map_err(|reset_at| LimitExceeded {
            kind: "endpoint_calls",
            reset_at,
        })?;

        Ok(())
    }

    /// Single atomic reservation against one window key.
    fn reserve(
        &self,
        key: WindowKey,
        cap: u32,
        window_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DateTime<Utc>> {
        let mut entry = self.windows.entry(key).or_insert(WindowEntry {
            count: 0,
            reset_time: window_end,
        });
        if now > entry.reset_time {
            entry.count = 1;
            entry.reset_time = window_end;
            return if cap == 0 { Err(entry.reset_time) } else { Ok(()) };
        }
        if entry.count >= cap {
            return Err(entry.reset_time);
        }
        entry.count += 1;
        Ok(())
    }

    /// Drop windows whose reset time has passed. Returns how many were
    /// reclaimed. Safe against concurrent reservations: `retain` holds the
    /// same per-entry locks the reservation path uses.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, entry| now <= entry.reset_time);
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed, "rate limiter janitor reclaimed expired windows");
        }
        removed
    }

    /// Spawn the periodic sweep. Returns a handle that stops it.
    pub fn start_janitor(&self, interval: Duration) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let windows = self.windows.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        windows.retain(|_, entry| now <= entry.reset_time);
                    }
                    _ = shutdown_rx.changed() => {
                        info!("rate limiter janitor stopping");
                        break;
                    }
                }
            }
        });
        JanitorHandle { shutdown_tx, task }
    }
}

/// Stop handle for the janitor task, bound to the process lifecycle.
pub struct JanitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

fn day_window(now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
    let start = Utc
        .from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).expect("valid midnight"));
    (start.timestamp(), start + ChronoDuration::days(1))
}

fn hour_window(now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
    let start = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    (start.timestamp(), start + ChronoDuration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierLimitConfig;

    fn limiter(per_day: u32, per_hour: u32, per_endpoint: u32) -> RateLimiter {
        let policy = TierPolicy::default().with_limits(
            Tier::Pro,
            TierLimitConfig {
                max_calls_per_day: per_day,
                max_calls_per_hour: per_hour,
                max_calls_per_endpoint_per_hour: per_endpoint,
                max_cost_per_call: 1.0,
            },
        );
        RateLimiter::new(policy)
    }

    #[test]
    fn admits_up_to_the_endpoint_cap() {
        let limiter = limiter(100, 100, 3);
        let now = Utc::now();
        for _ in 0..3 {
            assert!(limiter.check("u1", "/api/v1/ai", Tier::Pro, now).is_ok());
        }
        let denied = limiter.check("u1", "/api/v1/ai", Tier::Pro, now).unwrap_err();
        assert_eq!(denied.kind, "endpoint_calls");
        assert!(denied.reset_at > now);
    }

    #[test]
    fn hourly_cap_trips_before_daily() {
        let limiter = limiter(100, 2, 50);
        let now = Utc::now();
        assert!(limiter.check("u1", "/a", Tier::Pro, now).is_ok());
        assert!(limiter.check("u1", "/b", Tier::Pro, now).is_ok());
        let denied = limiter.check("u1", "/c", Tier::Pro, now).unwrap_err();
        assert_eq!(denied.kind, "hourly_calls");
    }

    #[test]
    fn daily_cap_denies_with_day_reset() {
        let limiter = limiter(1, 100, 50);
        let now = Utc::now();
        assert!(limiter.check("u1", "/a", Tier::Pro, now).is_ok());
        let denied = limiter.check("u1", "/a", Tier::Pro, now).unwrap_err();
        assert_eq!(denied.kind, "daily_calls");
        assert!(denied.reset_at - now <= ChronoDuration::days(1));
    }

    #[test]
    fn users_do_not_share_windows() {
        let limiter = limiter(1, 1, 1);
        let now = Utc::now();
        assert!(limiter.check("u1", "/a", Tier::Pro, now).is_ok());
        assert!(limiter.check("u2", "/a", Tier::Pro, now).is_ok());
    }

    #[test]
    fn expired_window_restarts_the_count() {
        let limiter = limiter(100, 100, 1);
        let now = Utc::now();
        assert!(limiter.check("u1", "/a", Tier::Pro, now).is_ok());
        assert!(limiter.check("u1", "/a", Tier::Pro, now).is_err());

        // Two hours later the hourly window has lapsed.
        let later = now + ChronoDuration::hours(2);
        assert!(limiter.check("u1", "/a", Tier::Pro, later).is_ok());
    }

    #[test]
    fn sweep_reclaims_only_expired_entries() {
        let limiter = limiter(10, 10, 10);
        let now = Utc::now();
        limiter.check("u1", "/a", Tier::Pro, now).unwrap();

        assert_eq!(limiter.sweep_expired(now), 0);
        let removed = limiter.sweep_expired(now + ChronoDuration::days(2));
        assert!(removed >= 3);
    }

    #[tokio::test]
    async fn concurrent_reservations_admit_exactly_the_cap() {
        let limiter = Arc::new(limiter(1000, 1000, 50));
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("u1", "/api/v1/ai", Tier::Pro, now).is_ok()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn janitor_start_stop_is_clean() {
        let limiter = limiter(10, 10, 10);
        let handle = limiter.start_janitor(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
    }
}
