//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::recovery::{RetryPolicy, StepPolicy};
use crate::autonomous::suggestions::SuggestionConfig;
use crate::autonomous::thinking::ThinkingConfig;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing the persistence port
    pub db_path: PathBuf,

    /// Ollama URL for the planner/executor
    pub ollama_url: String,

    /// Ollama model name
    pub model: String,

    pub thinking_interval: Duration,
    pub thinking_enabled: bool,

    /// Let the thinking loop start pending goals once independent
    pub autonomous_execution: bool,

    pub max_suggestions: usize,
    pub suggestion_ttl_hours: i64,

    pub step_max_retries: usize,
    pub step_retry_delay: Duration,
    pub step_timeout: Option<Duration>,

    /// Emit JSON log lines on stderr
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ollama_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            thinking_interval: Duration::from_secs(30),
            thinking_enabled: true,
            autonomous_execution: true,
            max_suggestions: 10,
            suggestion_ttl_hours: 24,
            step_max_retries: 0,
            step_retry_delay: Duration::from_millis(500),
            step_timeout: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let db_path = std::env::var("AUTONOMY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let ollama_url = std::env::var("OLLAMA_URL").unwrap_or(defaults.ollama_url);
        let model = std::env::var("LLAMA_MODEL").unwrap_or(defaults.model);

        let thinking_interval = match parse_var::<u64>("AUTONOMY_THINKING_INTERVAL_SECS")? {
            Some(0) => anyhow::bail!("AUTONOMY_THINKING_INTERVAL_SECS must be positive"),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.thinking_interval,
        };

        let thinking_enabled = flag("AUTONOMY_THINKING_ENABLED").unwrap_or(defaults.thinking_enabled);
        let autonomous_execution = flag("AUTONOMY_AUTONOMOUS_EXECUTION").unwrap_or(defaults.autonomous_execution);

        let max_suggestions = parse_var("AUTONOMY_MAX_SUGGESTIONS")?.unwrap_or(defaults.max_suggestions);
        let suggestion_ttl_hours =
            parse_var("AUTONOMY_SUGGESTION_TTL_HOURS")?.unwrap_or(defaults.suggestion_ttl_hours);

        let step_max_retries = parse_var("AUTONOMY_STEP_MAX_RETRIES")?.unwrap_or(defaults.step_max_retries);
        let step_retry_delay = parse_var::<u64>("AUTONOMY_STEP_RETRY_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.step_retry_delay);
        let step_timeout = parse_var::<u64>("AUTONOMY_STEP_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let log_json = flag("AUTONOMY_LOG_JSON").unwrap_or(defaults.log_json);

        Ok(Self {
            db_path,
            ollama_url,
            model,
            thinking_interval,
            thinking_enabled,
            autonomous_execution,
            max_suggestions,
            suggestion_ttl_hours,
            step_max_retries,
            step_retry_delay,
            step_timeout,
            log_json,
        })
    }

    pub fn thinking(&self) -> ThinkingConfig {
        ThinkingConfig {
            interval: self.thinking_interval,
            enabled: self.thinking_enabled,
            autonomous_execution: self.autonomous_execution,
        }
    }

    pub fn suggestions(&self) -> SuggestionConfig {
        SuggestionConfig {
            max_per_user: self.max_suggestions,
            ttl: chrono::Duration::hours(self.suggestion_ttl_hours),
        }
    }

    pub fn step_policy(&self) -> StepPolicy {
        StepPolicy {
            retry: RetryPolicy::with_retries(self.step_max_retries, self.step_retry_delay),
            step_timeout: self.step_timeout,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autonomy-core")
        .join("state.db")
}

fn flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}
