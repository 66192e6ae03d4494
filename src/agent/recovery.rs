//! Step Retry and Timeout Policy
//!
//! A failing step is retried only when its error looks transient:
//! - Error classification from the error message
//! - Exponential backoff with jitter and a delay cap
//! - Optional per-attempt timeout
//!
//! The default policy makes no retries and sets no timeout, so the first
//! error fails the step.

use rand::Rng;
use std::time::Duration;

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure, retry likely to succeed
    Transient,
    /// Rate limiting, need backoff
    RateLimited,
    /// Resource unavailable, may recover
    ResourceUnavailable,
    /// Invalid input, retry won't help
    ValidationError,
    /// Authorization failed, needs intervention
    AuthError,
    /// Bug or crash in the tool itself
    SystemError,
    Unknown,
}

impl ErrorClass {
    /// Classify an error from its message
    pub fn from_error(error: &str) -> Self {
        let lower = error.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            Self::RateLimited
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("temporary")
        {
            Self::Transient
        } else if lower.contains("unavailable") || lower.contains("503") {
            Self::ResourceUnavailable
        } else if lower.contains("invalid")
            || lower.contains("validation")
            || lower.contains("missing required")
            || lower.contains("wrong type")
            || lower.contains("400")
        {
            Self::ValidationError
        } else if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("approval")
            || lower.contains("401")
            || lower.contains("403")
        {
            Self::AuthError
        } else if lower.contains("internal") || lower.contains("500") || lower.contains("panic") {
            Self::SystemError
        } else {
            Self::Unknown
        }
    }

    /// Only failures that can clear up on their own are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::ResourceUnavailable)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0); zero disables jitter
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: usize, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter_factor > 0.0 {
            let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
            (capped + capped * self.jitter_factor * spread).clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Whether another attempt should follow failure number `attempt`
    pub fn should_retry(&self, attempt: usize, error: &str) -> bool {
        attempt < self.max_retries && ErrorClass::from_error(error).is_retryable()
    }
}

/// Per-step execution policy
#[derive(Debug, Clone, Default)]
pub struct StepPolicy {
    pub retry: RetryPolicy,
    /// Limit on a single attempt
    pub step_timeout: Option<Duration>,
}
