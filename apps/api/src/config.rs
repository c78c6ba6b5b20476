use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::quota::QuotaLimits;
use crate::scheduler::SchedulerConfig;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub gemini_api_key: String,
    pub llm_model: String,
    pub usage_file: PathBuf,
    pub daily_request_limit: u64,
    pub monthly_token_limit: u64,
    pub min_request_interval: Duration,
    pub scrape_interval: Duration,
    pub scrape_limit_per_source: usize,
    pub scrape_autostart: bool,
    /// Raw `name=url,...` list; see `aggregation::feed::parse_feed_spec`.
    pub job_feed_urls: String,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let scrape_interval = interval_from_hours(parse_env("SCRAPE_INTERVAL_HOURS", "3.0")?)?;

        Ok(Config {
            gemini_api_key: require_env("GEMINI_API_KEY")?,
            llm_model: env_or("LLM_MODEL", "gemini-1.5-flash"),
            usage_file: PathBuf::from(env_or("LLM_USAGE_FILE", "data/llm_usage.json")),
            daily_request_limit: parse_env("LLM_DAILY_REQUEST_LIMIT", "10000")?,
            monthly_token_limit: parse_env("LLM_MONTHLY_TOKEN_LIMIT", "900000")?,
            min_request_interval: Duration::from_millis(parse_env(
                "LLM_MIN_REQUEST_INTERVAL_MS",
                "60",
            )?),
            scrape_interval,
            scrape_limit_per_source: parse_env("SCRAPE_LIMIT_PER_SOURCE", "100")?,
            scrape_autostart: parse_env("SCRAPE_AUTOSTART", "true")?,
            job_feed_urls: env_or("JOB_FEED_URLS", ""),
            port: parse_env("PORT", "8080")?,
            rust_log: env_or("RUST_LOG", "info"),
        })
    }

    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            daily_requests: self.daily_request_limit,
            monthly_tokens: self.monthly_token_limit,
            min_interval: self.min_request_interval,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.scrape_interval,
            ..SchedulerConfig::default()
        }
    }
}

fn interval_from_hours(hours: f64) -> Result<Duration> {
    if !hours.is_finite() || hours <= 0.0 {
        anyhow::bail!("SCRAPE_INTERVAL_HOURS must be a positive number of hours");
    }
    Duration::try_from_secs_f64(hours * 3600.0).context("SCRAPE_INTERVAL_HOURS is out of range")
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(key, default)
        .trim()
        .parse::<T>()
        .with_context(|| format!("{key} has an invalid value"))
}
