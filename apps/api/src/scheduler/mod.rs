//! Periodic scheduler. Drives an injected run unit on a fixed interval.
//!
//! State machine: Idle → Running → Idle (via `stop`). While running, one
//! background task loops `{ sleep(interval); run once }` until cancelled.
//! A failing (or panicking) run is logged and skipped; the loop keeps going.
//! The interval is not shortened by run duration, so start times drift.
//!
//! `run_once` executes the same per-run logic on demand and shares the
//! statistics accumulator with the background loop.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of one source within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub name: String,
    pub found: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a run unit reports back after one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub total_found: u64,
    pub total_new: u64,
    pub duplicates_removed: u64,
    pub sources: Vec<SourceOutcome>,
}

/// The unit of work the scheduler fires each cycle.
#[async_trait]
pub trait RunUnit: Send + Sync {
    async fn run(&self) -> anyhow::Result<RunReport>;
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Fire the first run immediately instead of after one interval.
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3 * 3600),
            run_on_start: false,
        }
    }
}

/// Cumulative run statistics. In-memory only; reset by process restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub run_count: u64,
    pub last_run: Option<DateTime<Local>>,
    pub total_found: u64,
    pub total_new: u64,
    pub total_duplicates_removed: u64,
    /// Per-source outcomes of the most recent successful run.
    pub last_sources: Vec<SourceOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub interval_secs: f64,
    #[serde(flatten)]
    pub stats: RunStatistics,
}

/// Shared per-run logic, used by both the loop and `run_once`.
#[derive(Clone)]
struct Runner {
    unit: Arc<dyn RunUnit>,
    stats: Arc<Mutex<RunStatistics>>,
}

impl Runner {
    fn stats(&self) -> MutexGuard<'_, RunStatistics> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn execute(&self) -> Option<RunReport> {
        let (run_number, started) = {
            let mut stats = self.stats();
            stats.run_count += 1;
            let now = Local::now();
            stats.last_run = Some(now);
            (stats.run_count, now)
        };

        info!(
            "Scheduler run #{run_number} at {}",
            started.format("%H:%M:%S")
        );

        let outcome = AssertUnwindSafe(self.unit.run()).catch_unwind().await;

        match outcome {
            Ok(Ok(report)) => {
                log_report(run_number, &report);
                let mut stats = self.stats();
                stats.total_found += report.total_found;
                stats.total_new += report.total_new;
                stats.total_duplicates_removed += report.duplicates_removed;
                stats.last_sources = report.sources.clone();
                Some(report)
            }
            Ok(Err(e)) => {
                error!("Scheduler run #{run_number} failed: {e:#}");
                None
            }
            Err(_) => {
                error!("Scheduler run #{run_number} panicked");
                None
            }
        }
    }
}

fn log_report(run_number: u64, report: &RunReport) {
    info!(
        "Run #{run_number} results: found={} new={} duplicates={}",
        report.total_found, report.total_new, report.duplicates_removed
    );
    for source in &report.sources {
        match &source.error {
            None => info!("  ok     {}: {} found", source.name, source.found),
            Some(e) => warn!("  failed {}: {e}", source.name),
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PeriodicScheduler {
    runner: Runner,
    config: SchedulerConfig,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl PeriodicScheduler {
    pub fn new(unit: Arc<dyn RunUnit>, config: SchedulerConfig) -> Self {
        Self {
            runner: Runner {
                unit,
                stats: Arc::new(Mutex::new(RunStatistics::default())),
            },
            config,
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawns the background loop. Returns false (and does nothing) if it is
    /// already running.
    pub async fn start(&self) -> bool {
        let mut worker = self.worker.lock().await;

        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            info!("Scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.runner.clone(),
            self.config,
            cancel.clone(),
        ));
        *worker = Some(Worker { cancel, handle });

        info!(
            "Starting scheduler (interval: {:.2}h)",
            self.config.interval.as_secs_f64() / 3600.0
        );
        true
    }

    /// Cancels the loop, including any in-flight sleep or run, and waits
    /// for it to exit. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let mut worker = self.worker.lock().await;

        let Some(Worker { cancel, handle }) = worker.take() else {
            return false;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            error!("Scheduler loop ended abnormally: {e}");
        }

        info!("Scheduler stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Executes one run now, outside the loop. `None` if the run failed.
    pub async fn run_once(&self) -> Option<RunReport> {
        self.runner.execute().await
    }

    pub fn statistics(&self) -> RunStatistics {
        self.runner.stats().clone()
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running().await,
            interval_secs: self.config.interval.as_secs_f64(),
            stats: self.statistics(),
        }
    }
}

async fn run_loop(runner: Runner, config: SchedulerConfig, cancel: CancellationToken) {
    if config.run_on_start {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = runner.execute() => {}
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = runner.execute() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::Instant;

    /// Succeeds with `found = cycle * 10`, except on the listed cycles.
    struct ScriptedUnit {
        calls: AtomicU64,
        fail_on: Vec<u64>,
        panic_on: Vec<u64>,
        run_time: Duration,
    }

    impl ScriptedUnit {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_on: vec![],
                panic_on: vec![],
                run_time: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RunUnit for ScriptedUnit {
        async fn run(&self) -> anyhow::Result<RunReport> {
            let cycle = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.run_time.is_zero() {
                tokio::time::sleep(self.run_time).await;
            }
            if self.panic_on.contains(&cycle) {
                panic!("scripted panic on cycle {cycle}");
            }
            if self.fail_on.contains(&cycle) {
                anyhow::bail!("scripted failure on cycle {cycle}");
            }
            Ok(RunReport {
                total_found: cycle * 10,
                total_new: cycle,
                duplicates_removed: 1,
                sources: vec![SourceOutcome {
                    name: "feed".to_string(),
                    found: cycle * 10,
                    error: None,
                }],
            })
        }
    }

    fn scheduler(unit: ScriptedUnit, interval: Duration, run_on_start: bool) -> PeriodicScheduler {
        PeriodicScheduler::new(
            Arc::new(unit),
            SchedulerConfig {
                interval,
                run_on_start,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_right_after_start_is_prompt() {
        let sched = scheduler(ScriptedUnit::new(), Duration::from_secs(3 * 3600), false);
        let began = Instant::now();

        assert!(sched.start().await);
        let stopped = tokio::time::timeout(Duration::from_secs(1), sched.stop()).await;

        assert_eq!(stopped, Ok(true));
        assert!(Instant::now() - began < Duration::from_secs(1));
        assert_eq!(sched.statistics().run_count, 0);
        assert!(!sched.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_is_isolated() {
        let unit = ScriptedUnit {
            fail_on: vec![2],
            ..ScriptedUnit::new()
        };
        let sched = scheduler(unit, Duration::from_secs(60), false);

        sched.start().await;
        tokio::time::sleep(Duration::from_secs(210)).await;
        sched.stop().await;

        let stats = sched.statistics();
        assert_eq!(stats.run_count, 3);
        assert_eq!(stats.total_found, 10 + 30);
        assert_eq!(stats.total_new, 1 + 3);
        assert_eq!(stats.total_duplicates_removed, 2);
        assert_eq!(stats.last_sources[0].found, 30);
        assert!(stats.last_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_does_not_end_loop() {
        let unit = ScriptedUnit {
            panic_on: vec![1],
            ..ScriptedUnit::new()
        };
        let sched = scheduler(unit, Duration::from_secs(60), false);

        sched.start().await;
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(sched.is_running().await);
        sched.stop().await;

        let stats = sched.statistics();
        assert_eq!(stats.run_count, 2);
        assert_eq!(stats.total_found, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let sched = scheduler(ScriptedUnit::new(), Duration::from_secs(60), false);

        assert!(sched.start().await);
        assert!(!sched.start().await);
        assert!(sched.stop().await);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let sched = scheduler(ScriptedUnit::new(), Duration::from_secs(60), false);
        assert!(!sched.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_run() {
        let unit = ScriptedUnit {
            run_time: Duration::from_secs(3600),
            ..ScriptedUnit::new()
        };
        let sched = scheduler(unit, Duration::from_secs(60), true);

        sched.start().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let began = Instant::now();
        sched.stop().await;

        assert!(Instant::now() - began < Duration::from_secs(1));
        let stats = sched.statistics();
        assert_eq!(stats.run_count, 1);
        assert_eq!(stats.total_found, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_start_fires_immediately() {
        let sched = scheduler(ScriptedUnit::new(), Duration::from_secs(3600), true);

        sched.start().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        sched.stop().await;

        assert_eq!(sched.statistics().run_count, 1);
    }

    #[tokio::test]
    async fn test_run_once_shares_statistics() {
        let unit = ScriptedUnit {
            fail_on: vec![2],
            ..ScriptedUnit::new()
        };
        let sched = scheduler(unit, Duration::from_secs(3600), false);

        let first = sched.run_once().await;
        let second = sched.run_once().await;

        assert_eq!(first.map(|r| r.total_found), Some(10));
        assert!(second.is_none());

        let stats = sched.stats().await;
        assert!(!stats.running);
        assert_eq!(stats.interval_secs, 3600.0);
        assert_eq!(stats.stats.run_count, 2);
        assert_eq!(stats.stats.total_found, 10);
    }

    #[tokio::test]
    async fn test_stats_report_sub_second_interval() {
        let sched = scheduler(ScriptedUnit::new(), Duration::from_millis(500), false);

        let stats = sched.stats().await;
        assert_eq!(stats.interval_secs, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let sched = scheduler(ScriptedUnit::new(), Duration::from_secs(60), false);

        sched.start().await;
        sched.stop().await;
        assert!(sched.start().await);
        tokio::time::sleep(Duration::from_secs(90)).await;
        sched.stop().await;

        assert_eq!(sched.statistics().run_count, 1);
    }
}
