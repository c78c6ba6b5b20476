pub mod health;
pub mod llm;
pub mod scheduler;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // LLM usage + interactive generation
        .route("/api/llm-usage", get(llm::handle_usage))
        .route("/api/llm/generate", post(llm::handle_generate))
        .route("/api/llm/answer", post(llm::handle_answer))
        .route("/api/llm/select", post(llm::handle_select))
        // Periodic scraping
        .route("/api/scheduler", get(scheduler::handle_stats))
        .route("/api/scheduler/start", post(scheduler::handle_start))
        .route("/api/scheduler/stop", post(scheduler::handle_stop))
        .route("/api/run", post(scheduler::handle_run_once))
        .with_state(state)
}
