//! Configuration types.
//!
//! Every tunable has a `Default` and an `INBOX_ASSIST_*` environment override.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Thresholds and limits for preference learning.
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Evidence count at which a style preference becomes active.
    pub confidence_threshold: u32,
    /// Evidence count at which a triage override becomes an advisory hint.
    pub triage_hint_threshold: u32,
    /// Final/draft word ratio at or below which an edit counts as "brief".
    pub brief_ratio: f64,
    /// Absolute word count a final text must stay under to count as "brief".
    pub short_message_words: usize,
    /// Allowed relative length change for a same-length casual rewrite.
    pub casual_length_tolerance: f64,
    /// Fraction of changed words above which lexical signals are skipped.
    pub rewrite_threshold: f64,
    /// Maximum avoid/prefer word signals per direction per edit.
    pub max_lexical_signals: usize,
    /// Evidence removed by one contradicting observation.
    pub contradiction_penalty: u32,
    /// Number of recent feedback events attached as few-shot examples.
    pub recent_examples: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 3,
            triage_hint_threshold: 2,
            brief_ratio: 0.5,
            short_message_words: 40,
            casual_length_tolerance: 0.25,
            rewrite_threshold: 0.7,
            max_lexical_signals: 5,
            contradiction_penalty: 2,
            recent_examples: 3,
        }
    }
}

impl LearningConfig {
    /// Defaults overridden by `INBOX_ASSIST_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            confidence_threshold: env_or("INBOX_ASSIST_CONFIDENCE_THRESHOLD", d.confidence_threshold)?,
            triage_hint_threshold: env_or("INBOX_ASSIST_TRIAGE_HINT_THRESHOLD", d.triage_hint_threshold)?,
            brief_ratio: env_or("INBOX_ASSIST_BRIEF_RATIO", d.brief_ratio)?,
            short_message_words: env_or("INBOX_ASSIST_SHORT_MESSAGE_WORDS", d.short_message_words)?,
            casual_length_tolerance: env_or(
                "INBOX_ASSIST_CASUAL_LENGTH_TOLERANCE",
                d.casual_length_tolerance,
            )?,
            rewrite_threshold: env_or("INBOX_ASSIST_REWRITE_THRESHOLD", d.rewrite_threshold)?,
            max_lexical_signals: env_or("INBOX_ASSIST_MAX_LEXICAL_SIGNALS", d.max_lexical_signals)?,
            contradiction_penalty: env_or(
                "INBOX_ASSIST_CONTRADICTION_PENALTY",
                d.contradiction_penalty,
            )?,
            recent_examples: env_or("INBOX_ASSIST_RECENT_EXAMPLES", d.recent_examples)?,
        })
    }
}

/// Bounded exponential backoff for oracle retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Random 0..jitter_fraction of the delay is added.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_attempts: env_or("INBOX_ASSIST_DRAFT_MAX_ATTEMPTS", d.max_attempts)?.max(1),
            base_delay: Duration::from_millis(env_or(
                "INBOX_ASSIST_RETRY_BASE_MS",
                d.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(env_or(
                "INBOX_ASSIST_RETRY_MAX_MS",
                d.max_delay.as_millis() as u64,
            )?),
            jitter_fraction: d.jitter_fraction,
        })
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub learning: LearningConfig,
    pub retry: RetryConfig,
    /// Upper bound on any single classifier or drafter call.
    pub oracle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            learning: LearningConfig::default(),
            retry: RetryConfig::default(),
            oracle_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            learning: LearningConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            oracle_timeout: Duration::from_secs(env_or("INBOX_ASSIST_ORACLE_TIMEOUT_SECS", 30u64)?),
        })
    }
}

/// Read and parse an env var, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
