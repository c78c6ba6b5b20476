//! Axum route handlers for the periodic scheduler.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::scheduler::{RunReport, SchedulerStats};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    /// Whether the call changed state (false for start-while-running etc.).
    pub changed: bool,
    pub stats: SchedulerStats,
}

#[derive(Debug, Serialize)]
pub struct RunOnceResponse {
    /// Null when the run unit failed; the failure is in the server log.
    pub report: Option<RunReport>,
    pub stats: SchedulerStats,
}

/// GET /api/scheduler
pub async fn handle_stats(State(state): State<AppState>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats().await)
}

/// POST /api/scheduler/start
pub async fn handle_start(State(state): State<AppState>) -> Json<ToggleResponse> {
    let changed = state.scheduler.start().await;
    Json(ToggleResponse {
        changed,
        stats: state.scheduler.stats().await,
    })
}

/// POST /api/scheduler/stop
pub async fn handle_stop(State(state): State<AppState>) -> Json<ToggleResponse> {
    let changed = state.scheduler.stop().await;
    Json(ToggleResponse {
        changed,
        stats: state.scheduler.stats().await,
    })
}

/// POST /api/run
pub async fn handle_run_once(State(state): State<AppState>) -> Json<RunOnceResponse> {
    let report = state.scheduler.run_once().await;
    Json(RunOnceResponse {
        report,
        stats: state.scheduler.stats().await,
    })
}
