//! Axum route handlers for LLM usage and the interactive generation path.
//!
//! These run concurrently with the scheduler's run unit; both share the one
//! `QuotaTracker` through `AppState`.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::llm_client::{RoleContext, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::quota::UsageSnapshot;
use crate::state::AppState;

const DEFAULT_ANSWER_LENGTH: usize = 500;

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(flatten)]
    pub usage: UsageSnapshot,
    pub near_limit: bool,
    /// Whether this process has already logged its near-limit advisory.
    pub advisory_shown: bool,
    pub available: bool,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    pub job_title: String,
    pub company: String,
    #[serde(default)]
    pub applicant_context: String,
    pub max_length: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub answer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub options: Vec<String>,
    pub field_label: String,
    #[serde(default)]
    pub applicant_context: String,
}

#[derive(Debug, Serialize)]
pub struct SelectResponse {
    pub selected: Option<String>,
}

/// GET /api/llm-usage
pub async fn handle_usage(State(state): State<AppState>) -> Json<UsageResponse> {
    Json(UsageResponse {
        usage: state.llm.usage_stats(),
        near_limit: state.quota.is_near_limit(),
        advisory_shown: state.llm.advisory().fired_at().is_some(),
        available: state.llm.is_available(),
        model: state.config.llm_model.clone(),
    })
}

/// POST /api/llm/generate
/// Unlike the helpers below, failures surface as typed errors (429 for
/// quota/pacing/provider throttling, 502 for provider faults).
pub async fn handle_generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    if req.prompt.trim().is_empty() {
        return Err(AppError::Validation("prompt must not be empty".to_string()));
    }

    let text = state
        .llm
        .generate(
            &req.prompt,
            req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            req.system.as_deref(),
        )
        .await?;

    Ok(Json(GenerateResponse { text }))
}

/// POST /api/llm/answer
/// `answer` is null when the model could not be reached or returned nothing.
pub async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(AppError::Validation("question must not be empty".to_string()));
    }

    let role = RoleContext {
        job_title: &req.job_title,
        company: &req.company,
        applicant_context: &req.applicant_context,
    };
    let answer = state
        .llm
        .answer_freeform_question(
            &req.question,
            &role,
            req.max_length.unwrap_or(DEFAULT_ANSWER_LENGTH),
        )
        .await;

    Ok(Json(AnswerResponse { answer }))
}

/// POST /api/llm/select
/// `selected` is always one of the submitted options, or null.
pub async fn handle_select(
    State(state): State<AppState>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<SelectResponse>, AppError> {
    if req.options.is_empty() {
        return Err(AppError::Validation("options must not be empty".to_string()));
    }

    let selected = state
        .llm
        .select_best_option(&req.options, &req.field_label, &req.applicant_context)
        .await;

    Ok(Json(SelectResponse { selected }))
}
