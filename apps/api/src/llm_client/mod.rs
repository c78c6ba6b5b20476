/// LLM client: the single point of entry for all generation calls in ApplyBot.
///
/// ARCHITECTURAL RULE: No other module may call the provider directly.
/// Every call goes through `LlmClient::generate`, which consults the
/// `QuotaTracker` before dispatch and records usage after it.
///
/// Flow per call:
///   admission (≤ 3 checks, paced rejections retried) → pacing gate →
///   near-limit advisory (once per client) → transport call → record usage.
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::quota::{QuotaTracker, Rejection, UsageSnapshot};

pub mod gemini;
pub mod prompts;

/// Admission checks per call before giving up on local pacing.
const ADMISSION_ATTEMPTS: u32 = 3;
/// Longest single wait between admission checks.
const MAX_ADMISSION_WAIT: Duration = Duration::from_secs(1);
/// Provider-side ceiling on output tokens, regardless of what callers ask for.
pub const OUTPUT_TOKEN_CEILING: u32 = 500;
pub const DEFAULT_MAX_TOKENS: u32 = 300;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Upper bound on tokens requested for a free-form answer.
const ANSWER_TOKEN_CAP: u32 = 300;
const SELECT_MAX_TOKENS: u32 = 50;
const SELECT_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Daily request limit reached: {0}")]
    QuotaExceeded(String),

    #[error("Monthly token budget exhausted: {0}")]
    BudgetExceeded(String),

    #[error("Throttled by request pacing after {attempts} admission attempts")]
    Throttled { attempts: u32 },

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Model or resource unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Provider error: {0}")]
    Unclassified(String),

    #[error("LLM returned empty content")]
    EmptyContent,
}

impl LlmError {
    /// Daily/monthly exhaustion. Retrying before the period resets is pointless.
    pub fn is_hard_cap(&self) -> bool {
        matches!(self, LlmError::QuotaExceeded(_) | LlmError::BudgetExceeded(_))
    }
}

/// Failure reported by a transport, before classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    /// HTTP status when the provider answered; `None` for network failures.
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// The wire boundary. Implementations issue exactly one provider call.
#[async_trait]
pub trait GenerationTransport: Send + Sync {
    async fn issue_call(
        &self,
        prompt: &str,
        max_output_tokens: u32,
        temperature: f32,
    ) -> Result<String, TransportError>;
}

/// One-shot "approaching limits" advisory.
///
/// Holds the usage snapshot observed when it fired; empty until then.
#[derive(Debug, Default)]
pub struct NearLimitAdvisory {
    fired_at: OnceLock<UsageSnapshot>,
}

impl NearLimitAdvisory {
    /// Latches the advisory. Returns true only for the call that fired it.
    fn fire(&self, snapshot: UsageSnapshot) -> bool {
        self.fired_at.set(snapshot).is_ok()
    }

    pub fn fired_at(&self) -> Option<&UsageSnapshot> {
        self.fired_at.get()
    }
}

/// Applicant/role framing for free-form answers.
#[derive(Debug, Clone, Copy)]
pub struct RoleContext<'a> {
    pub job_title: &'a str,
    pub company: &'a str,
    pub applicant_context: &'a str,
}

/// The single LLM client used by all services in ApplyBot.
/// Cheap to clone; clones share the tracker, transport and advisory latch.
#[derive(Clone)]
pub struct LlmClient {
    quota: Arc<QuotaTracker>,
    transport: Arc<dyn GenerationTransport>,
    advisory: Arc<NearLimitAdvisory>,
}

impl LlmClient {
    pub fn new(quota: Arc<QuotaTracker>, transport: Arc<dyn GenerationTransport>) -> Self {
        Self {
            quota,
            transport,
            advisory: Arc::new(NearLimitAdvisory::default()),
        }
    }

    pub fn usage_stats(&self) -> UsageSnapshot {
        self.quota.usage_snapshot()
    }

    /// Whether a call would be admitted right now (no side effects).
    pub fn is_available(&self) -> bool {
        self.quota.can_proceed().allowed
    }

    pub fn advisory(&self) -> &NearLimitAdvisory {
        &self.advisory
    }

    /// Issues one generation request under quota control.
    ///
    /// `system` is prepended to the prompt when present. Every failure comes
    /// back as an `LlmError`; callers should treat it as "skip this item".
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        system: Option<&str>,
    ) -> Result<String, LlmError> {
        self.admit().await?;

        // Second look at pacing: another caller may have been admitted
        // between our check and now.
        self.quota.block_until_pace_allows().await;

        if self.quota.is_near_limit() {
            let stats = self.quota.usage_snapshot();
            if self.advisory.fire(stats.clone()) {
                warn!(
                    "Approaching LLM limits: {}/{} daily requests, {}/{} monthly tokens",
                    stats.daily_used, stats.daily_limit, stats.monthly_used, stats.monthly_limit
                );
            }
        }

        let full_prompt = match system {
            Some(preamble) if !preamble.is_empty() => format!("{preamble}\n\n{prompt}"),
            _ => prompt.to_string(),
        };
        let max_output = max_tokens.min(OUTPUT_TOKEN_CEILING);

        match self
            .transport
            .issue_call(&full_prompt, max_output, temperature)
            .await
        {
            Ok(text) => {
                let tokens = estimate_tokens(&full_prompt) + estimate_tokens(&text);
                self.quota.record_usage(tokens);

                let text = text.trim();
                if text.is_empty() {
                    debug!("LLM call returned an empty payload");
                    return Err(LlmError::EmptyContent);
                }

                debug!("LLM call succeeded: ~{tokens} tokens");
                Ok(text.to_string())
            }
            Err(e) => {
                let classified = classify(&e);

                // Anything the provider answered (or explicitly throttled)
                // consumed a request slot.
                if e.status.is_some() || matches!(classified, LlmError::RateLimited(_)) {
                    self.quota.record_usage(0);
                }

                match &classified {
                    LlmError::RateLimited(_) => warn!("Rate limit exceeded: {e}"),
                    LlmError::Unauthorized(_) => error!("Invalid LLM API key: {e}"),
                    LlmError::ServiceUnavailable(_) => error!("Model/resource error: {e}"),
                    _ => error!("LLM error: {e}"),
                }

                Err(classified)
            }
        }
    }

    /// Runs the admission loop. Hard caps abort immediately; pacing
    /// rejections wait briefly and re-check.
    async fn admit(&self) -> Result<(), LlmError> {
        for attempt in 1..=ADMISSION_ATTEMPTS {
            let decision = self.quota.can_proceed();

            match decision.rejection {
                None => return Ok(()),
                Some(Rejection::DailyLimit) => {
                    warn!("LLM request blocked: {}", decision.reason);
                    return Err(LlmError::QuotaExceeded(decision.reason));
                }
                Some(Rejection::MonthlyBudget) => {
                    warn!("LLM request blocked: {}", decision.reason);
                    return Err(LlmError::BudgetExceeded(decision.reason));
                }
                Some(Rejection::Pacing { wait }) => {
                    if attempt == 1 {
                        info!("Rate limited, waiting briefly...");
                    }
                    if attempt < ADMISSION_ATTEMPTS {
                        tokio::time::sleep(wait.min(MAX_ADMISSION_WAIT)).await;
                    }
                }
            }
        }

        warn!("LLM request dropped: still paced after {ADMISSION_ATTEMPTS} admission attempts");
        Err(LlmError::Throttled {
            attempts: ADMISSION_ATTEMPTS,
        })
    }

    /// Writes a short answer to an application question.
    ///
    /// Requests at most `min(max_length / 3, 300)` output tokens.
    pub async fn answer_freeform_question(
        &self,
        question: &str,
        role: &RoleContext<'_>,
        max_length: usize,
    ) -> Option<String> {
        let prompt = prompts::ANSWER_PROMPT_TEMPLATE
            .replace("{job_title}", role.job_title)
            .replace("{company}", role.company)
            .replace("{max_length}", &max_length.to_string())
            .replace("{applicant_context}", role.applicant_context)
            .replace("{question}", question);

        let max_tokens = u32::try_from(max_length / 3)
            .unwrap_or(u32::MAX)
            .min(ANSWER_TOKEN_CAP);

        self.generate(&prompt, max_tokens, DEFAULT_TEMPERATURE, None)
            .await
            .ok()
    }

    /// Asks the model to pick one of `options` for a form field.
    ///
    /// Only ever returns an element of `options` (matched exactly, then
    /// case-insensitively); anything else yields `None`.
    pub async fn select_best_option(
        &self,
        options: &[String],
        field_label: &str,
        applicant_context: &str,
    ) -> Option<String> {
        if options.is_empty() {
            return None;
        }

        let options_list = options
            .iter()
            .map(|o| format!("- {o}"))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompts::SELECT_OPTION_PROMPT_TEMPLATE
            .replace("{field_label}", field_label)
            .replace("{applicant_context}", applicant_context)
            .replace("{options}", &options_list);

        let response = self
            .generate(&prompt, SELECT_MAX_TOKENS, SELECT_TEMPERATURE, None)
            .await
            .ok()?;

        let selected = match_option(options, &response);
        if selected.is_none() {
            debug!("Model picked {response:?} for '{field_label}', which is not an offered option");
        }
        selected
    }
}

/// Coarse token estimate: one token per four characters.
///
/// Quota arithmetic is calibrated against this approximation, not against
/// provider-billed counts.
pub fn estimate_tokens(text: &str) -> u64 {
    text.chars().count() as u64 / 4
}

fn match_option(options: &[String], response: &str) -> Option<String> {
    let response = response.trim();
    if response.eq_ignore_ascii_case("none") {
        return None;
    }
    if let Some(exact) = options.iter().find(|o| o.as_str() == response) {
        return Some(exact.clone());
    }
    let lowered = response.to_lowercase();
    options
        .iter()
        .find(|o| o.to_lowercase() == lowered)
        .cloned()
}

/// Maps a transport failure into the client taxonomy.
///
/// HTTP status is authoritative when present; message keywords are the
/// fallback for transports that only surface text.
pub fn classify(err: &TransportError) -> LlmError {
    let message = err.message.clone();

    match err.status {
        Some(429) => return LlmError::RateLimited(message),
        Some(401) | Some(403) => return LlmError::Unauthorized(message),
        Some(404) => return LlmError::ServiceUnavailable(message),
        _ => {}
    }

    let lowered = err.message.to_lowercase();
    if ["429", "quota", "resource exhausted", "resource_exhausted"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        LlmError::RateLimited(message)
    } else if lowered.contains("api key") {
        LlmError::Unauthorized(message)
    } else if lowered.contains("404") || lowered.contains("not found") {
        LlmError::ServiceUnavailable(message)
    } else {
        warn!(
            status = ?err.status,
            "Unrecognized provider error shape: {}",
            err.message
        );
        LlmError::Unclassified(message)
    }
}
