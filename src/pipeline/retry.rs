//! Bounded exponential backoff for oracle calls.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::OracleError;

/// Whether an oracle failure is worth another attempt.
///
/// Classifier failures are never retried: triage fails open to
/// `notify_human` instead.
pub fn is_retryable(err: &OracleError) -> bool {
    match err {
        OracleError::DraftGenerationFailed(_) | OracleError::Timeout { .. } => true,
        OracleError::ClassifierUnavailable(_) => false,
    }
}

/// Delay before retry `attempt` (0-indexed).
///
/// `min(base_delay * 2^attempt, max_delay)` plus a random jitter of
/// `0..=jitter_fraction * delay`.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let base_ms = config.base_delay.as_millis() as u64;
    let capped_ms = base_ms
        .saturating_mul(exp)
        .min(config.max_delay.as_millis() as u64);

    let jitter_max_ms = (capped_ms as f64 * config.jitter_fraction) as u64;
    let jitter_ms = if jitter_max_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_max_ms)
    } else {
        0
    };

    Duration::from_millis(capped_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let config = no_jitter();
        assert_eq!(compute_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_delay(&config, 3), Duration::from_millis(800));
        assert_eq!(compute_delay(&config, 4), Duration::from_millis(1000));
        assert_eq!(compute_delay(&config, 60), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let config = RetryConfig {
            jitter_fraction: 0.5,
            ..no_jitter()
        };
        for _ in 0..50 {
            let d = compute_delay(&config, 1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn only_drafting_failures_retry() {
        assert!(is_retryable(&OracleError::DraftGenerationFailed("boom".into())));
        assert!(is_retryable(&OracleError::Timeout {
            oracle: "drafter".into(),
            timeout: Duration::from_secs(1),
        }));
        assert!(!is_retryable(&OracleError::ClassifierUnavailable("down".into())));
    }
}
