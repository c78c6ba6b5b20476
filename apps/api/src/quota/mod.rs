//! Quota tracker: the single authority on whether an LLM call may go out now.
//!
//! Three independent ceilings, checked in this order:
//!   1. daily request cap      (hard, resets on a new day)
//!   2. monthly token budget   (hard, resets on a new month)
//!   3. minimum spacing between requests (soft pacing)
//!
//! Hard caps are reported before pacing so callers can tell "come back
//! tomorrow" from "retry in a few milliseconds".
//!
//! Rollover is evaluated when the tracker is loaded, not continuously. A
//! process that stays up past midnight keeps counting against the previous
//! day until the tracker is rebuilt.

pub mod ledger;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::ledger::UsageLedger;

/// Usage above this fraction of a ceiling counts as "near limit".
const NEAR_LIMIT_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub daily_requests: u64,
    pub monthly_tokens: u64,
    pub min_interval: Duration,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            daily_requests: 10_000,
            monthly_tokens: 900_000,
            min_interval: Duration::from_millis(60),
        }
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    DailyLimit,
    MonthlyBudget,
    Pacing { wait: Duration },
}

/// Result of an admission check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: String,
    pub rejection: Option<Rejection>,
}

impl AdmissionDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
            rejection: None,
        }
    }

    fn reject(rejection: Rejection, limits: &QuotaLimits) -> Self {
        let reason = match rejection {
            Rejection::DailyLimit => format!(
                "Daily limit reached ({} requests). Resets at midnight.",
                limits.daily_requests
            ),
            Rejection::MonthlyBudget => format!(
                "Monthly token limit reached ({} tokens).",
                limits.monthly_tokens
            ),
            Rejection::Pacing { wait } => {
                format!("Rate limited. Wait {:.3}s.", wait.as_secs_f64())
            }
        };
        Self {
            allowed: false,
            reason,
            rejection: Some(rejection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub daily_remaining: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub monthly_remaining: u64,
}

struct TrackerState {
    ledger: UsageLedger,
    /// Latest dispatch slot handed out or recorded. May lie in the future
    /// while a paced caller is waiting for its reserved slot.
    last_dispatch: Option<Instant>,
}

/// Persistent quota/rate tracker. Construct one per ledger file and share it
/// behind an `Arc`; every read and mutation goes through one lock.
pub struct QuotaTracker {
    path: PathBuf,
    limits: QuotaLimits,
    state: Mutex<TrackerState>,
}

impl QuotaTracker {
    /// Loads the ledger at `path` (or starts fresh) and applies rollover
    /// against the local calendar date.
    pub fn load(path: impl Into<PathBuf>, limits: QuotaLimits) -> Self {
        Self::load_at(path, limits, Local::now().date_naive())
    }

    pub(crate) fn load_at(path: impl Into<PathBuf>, limits: QuotaLimits, today: NaiveDate) -> Self {
        let path = path.into();

        let ledger = match UsageLedger::read(&path) {
            Ok(Some(mut ledger)) => {
                if ledger.roll_over(today) {
                    info!("Usage ledger rolled over to {today}");
                }
                ledger
            }
            Ok(None) => {
                debug!("No usage ledger at {}, starting fresh", path.display());
                UsageLedger::fresh(today)
            }
            Err(e) => {
                warn!(
                    "Unreadable usage ledger at {} ({e}), starting fresh",
                    path.display()
                );
                UsageLedger::fresh(today)
            }
        };

        info!(
            "Quota tracker loaded: {}/{} requests today, {}/{} tokens this month",
            ledger.daily_request_count,
            limits.daily_requests,
            ledger.monthly_token_count,
            limits.monthly_tokens
        );

        Self {
            path,
            limits,
            state: Mutex::new(TrackerState {
                ledger,
                last_dispatch: None,
            }),
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A panic while holding the lock cannot leave the ledger half-written
        // in memory, so a poisoned guard is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks daily cap, then monthly budget, then pacing.
    pub fn can_proceed(&self) -> AdmissionDecision {
        let state = self.lock();
        let ledger = &state.ledger;

        if ledger.daily_request_count >= self.limits.daily_requests {
            return AdmissionDecision::reject(Rejection::DailyLimit, &self.limits);
        }

        if ledger.monthly_token_count >= self.limits.monthly_tokens {
            return AdmissionDecision::reject(Rejection::MonthlyBudget, &self.limits);
        }

        if let Some(last) = state.last_dispatch {
            let next_allowed = last + self.limits.min_interval;
            let now = Instant::now();
            if next_allowed > now {
                return AdmissionDecision::reject(
                    Rejection::Pacing {
                        wait: next_allowed - now,
                    },
                    &self.limits,
                );
            }
        }

        AdmissionDecision::allow()
    }

    /// Suspends until the caller's dispatch slot arrives.
    ///
    /// The slot is reserved under the lock before sleeping, so two callers
    /// that both passed `can_proceed` are released at least `min_interval`
    /// apart.
    pub async fn block_until_pace_allows(&self) {
        let slot = {
            let mut state = self.lock();
            let now = Instant::now();
            let slot = match state.last_dispatch {
                Some(last) => (last + self.limits.min_interval).max(now),
                None => now,
            };
            state.last_dispatch = Some(slot);
            slot
        };

        if slot > Instant::now() {
            debug!("Pacing gate holding call for {:?}", slot - Instant::now());
        }
        tokio::time::sleep_until(slot).await;
    }

    /// Counts one attempted call and persists the ledger.
    ///
    /// Call exactly once per request that reached the provider, including
    /// provider-side throttling (`tokens = 0`). Write failures are logged
    /// and swallowed; in-memory state stays authoritative.
    pub fn record_usage(&self, tokens: u64) {
        let mut state = self.lock();

        state.ledger.record(Local::now().naive_local(), tokens);

        let now = Instant::now();
        state.last_dispatch = Some(match state.last_dispatch {
            Some(last) if last > now => last,
            _ => now,
        });

        // Persisted while the lock is held so disk order matches record order.
        // The write is a small unsynced temp-file rename and blocks this
        // worker thread for its duration.
        if let Err(e) = state.ledger.persist(&self.path) {
            warn!(
                "Failed to persist usage ledger to {}: {e}",
                self.path.display()
            );
        }
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let state = self.lock();
        let daily_used = state.ledger.daily_request_count;
        let monthly_used = state.ledger.monthly_token_count;

        UsageSnapshot {
            daily_used,
            daily_limit: self.limits.daily_requests,
            daily_remaining: self.limits.daily_requests.saturating_sub(daily_used),
            monthly_used,
            monthly_limit: self.limits.monthly_tokens,
            monthly_remaining: self.limits.monthly_tokens.saturating_sub(monthly_used),
        }
    }

    /// True once either counter passes 80% of its ceiling. Advisory only.
    pub fn is_near_limit(&self) -> bool {
        let state = self.lock();
        fraction(state.ledger.daily_request_count, self.limits.daily_requests) > NEAR_LIMIT_FRACTION
            || fraction(state.ledger.monthly_token_count, self.limits.monthly_tokens)
                > NEAR_LIMIT_FRACTION
    }

    #[cfg(test)]
    pub(crate) fn ledger(&self) -> UsageLedger {
        self.lock().ledger.clone()
    }
}

fn fraction(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 1.0;
    }
    used as f64 / limit as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limits(daily: u64, monthly: u64, interval_ms: u64) -> QuotaLimits {
        QuotaLimits {
            daily_requests: daily,
            monthly_tokens: monthly,
            min_interval: Duration::from_millis(interval_ms),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_counters_track_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(dir.path().join("u.json"), limits(100, 100_000, 0), today());

        let tokens = [12u64, 0, 340, 7, 1000];
        for t in tokens {
            tracker.record_usage(t);
        }

        let ledger = tracker.ledger();
        assert_eq!(ledger.daily_request_count, tokens.len() as u64);
        assert_eq!(ledger.monthly_token_count, tokens.iter().sum::<u64>());
    }

    #[test]
    fn test_daily_cap_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(dir.path().join("u.json"), limits(2, 1000, 0), today());

        tracker.record_usage(400);
        tracker.record_usage(400);

        let decision = tracker.can_proceed();
        assert!(!decision.allowed);
        assert_eq!(decision.rejection, Some(Rejection::DailyLimit));
        assert!(decision.reason.contains("Daily limit"));

        let snapshot = tracker.usage_snapshot();
        assert_eq!(snapshot.daily_remaining, 0);
        assert_eq!(snapshot.monthly_remaining, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_cap_reported_before_budget_and_pacing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(
            dir.path().join("u.json"),
            limits(1, 10, 60_000),
            today(),
        );

        // Exhausts the day, the month and leaves a pacing window open.
        tracker.record_usage(50);

        let decision = tracker.can_proceed();
        assert_eq!(decision.rejection, Some(Rejection::DailyLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_reported_before_pacing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(
            dir.path().join("u.json"),
            limits(10, 10, 60_000),
            today(),
        );

        tracker.record_usage(50);

        assert_eq!(tracker.can_proceed().rejection, Some(Rejection::MonthlyBudget));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_reports_remaining_wait() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(dir.path().join("u.json"), limits(10, 10_000, 500), today());

        tracker.record_usage(1);
        tokio::time::advance(Duration::from_millis(200)).await;

        let decision = tracker.can_proceed();
        assert!(!decision.allowed);
        match decision.rejection {
            Some(Rejection::Pacing { wait }) => assert_eq!(wait, Duration::from_millis(300)),
            other => panic!("expected pacing rejection, got {other:?}"),
        }
        assert!(decision.reason.starts_with("Rate limited"));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(tracker.can_proceed().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_spaced_by_interval() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(QuotaTracker::load_at(
            dir.path().join("u.json"),
            limits(10, 10_000, 250),
            today(),
        ));

        assert!(tracker.can_proceed().allowed);
        assert!(tracker.can_proceed().allowed);

        let a = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.block_until_pace_allows().await;
                let at = Instant::now();
                tracker.record_usage(10);
                at
            })
        };
        let b = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.block_until_pace_allows().await;
                let at = Instant::now();
                tracker.record_usage(10);
                at
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let gap = if a > b { a - b } else { b - a };
        assert!(gap >= Duration::from_millis(250), "gap was {gap:?}");
        assert_eq!(tracker.ledger().daily_request_count, 2);
    }

    #[test]
    fn test_reload_same_day_preserves_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.json");
        {
            let tracker = QuotaTracker::load_at(&path, limits(100, 10_000, 0), today());
            tracker.record_usage(30);
            tracker.record_usage(70);
        }

        let reloaded = QuotaTracker::load_at(&path, limits(100, 10_000, 0), today());
        let ledger = reloaded.ledger();
        assert_eq!(ledger.daily_request_count, 2);
        assert_eq!(ledger.monthly_token_count, 100);
        assert_eq!(ledger.recent_requests.len(), 2);
    }

    #[test]
    fn test_reload_next_day_resets_daily_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.json");
        let yesterday = NaiveDate::from_ymd_opt(2026, 3, 13).unwrap();
        {
            let tracker = QuotaTracker::load_at(&path, limits(100, 10_000, 0), yesterday);
            tracker.record_usage(500);
        }

        let reloaded = QuotaTracker::load_at(&path, limits(100, 10_000, 0), today());
        let ledger = reloaded.ledger();
        assert_eq!(ledger.daily_request_count, 0);
        assert!(ledger.recent_requests.is_empty());
        assert_eq!(ledger.monthly_token_count, 500);
    }

    #[test]
    fn test_log_never_exceeds_cap() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(dir.path().join("u.json"), limits(1000, 1_000_000, 0), today());

        for t in 0..130u64 {
            tracker.record_usage(t);
        }

        let ledger = tracker.ledger();
        assert_eq!(ledger.recent_requests.len(), ledger::MAX_LOG_ENTRIES);
        assert_eq!(ledger.recent_requests.front().unwrap().tokens, 30);
    }

    #[test]
    fn test_corrupt_ledger_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.json");
        std::fs::write(&path, "{ not json").unwrap();

        let tracker = QuotaTracker::load_at(&path, QuotaLimits::default(), today());
        assert_eq!(tracker.usage_snapshot().daily_used, 0);
    }

    #[test]
    fn test_persist_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the ledger's parent directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let tracker = QuotaTracker::load_at(blocker.join("u.json"), limits(10, 1000, 0), today());

        tracker.record_usage(25);

        let snapshot = tracker.usage_snapshot();
        assert_eq!(snapshot.daily_used, 1);
        assert_eq!(snapshot.monthly_used, 25);
    }

    #[test]
    fn test_near_limit_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(dir.path().join("u.json"), limits(10, 1_000_000, 0), today());

        for _ in 0..8 {
            tracker.record_usage(0);
        }
        assert!(!tracker.is_near_limit(), "exactly 80% is not over the threshold");

        tracker.record_usage(0);
        assert!(tracker.is_near_limit());
    }

    #[test]
    fn test_monthly_near_limit() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = QuotaTracker::load_at(dir.path().join("u.json"), limits(1000, 1000, 0), today());

        tracker.record_usage(801);
        assert!(tracker.is_near_limit());
    }
}
