use std::sync::Arc;

use crate::config::Config;
use crate::llm_client::LlmClient;
use crate::quota::QuotaTracker;
use crate::scheduler::PeriodicScheduler;

/// Shared application state injected into all route handlers via Axum extractors.
/// Everything here is built once in `main`; there are no module-level singletons.
#[derive(Clone)]
pub struct AppState {
    pub quota: Arc<QuotaTracker>,
    pub llm: LlmClient,
    pub scheduler: Arc<PeriodicScheduler>,
    pub config: Config,
}
