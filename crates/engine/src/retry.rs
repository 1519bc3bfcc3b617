use std::time::Duration;

use skyvault_transfer::TransferError;

/// Retry schedule for transient I/O failures inside a chunk step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that fails on the first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether a failure on retry number `attempt` (1-based) should be retried.
    pub fn should_retry(&self, err: &TransferError, attempt: u32) -> bool {
        err.is_transient() && attempt <= self.max_retries
    }

    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter so parallel tasks do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }

    fn within_jitter(actual: Duration, base_ms: f64) {
        let ms = actual.as_secs_f64() * 1000.0;
        assert!(
            ms >= base_ms * 0.75 - 0.001 && ms <= base_ms * 1.25 + 0.001,
            "{ms} ms not within 25% of {base_ms} ms"
        );
    }

    #[test]
    fn delay_grows_exponentially() {
        let p = policy();
        within_jitter(p.delay_for_attempt(1), 100.0);
        within_jitter(p.delay_for_attempt(2), 200.0);
        within_jitter(p.delay_for_attempt(3), 400.0);
    }

    #[test]
    fn delay_is_capped() {
        within_jitter(policy().delay_for_attempt(30), 1000.0);
        within_jitter(policy().delay_for_attempt(u32::MAX), 1000.0);
    }

    #[test]
    fn only_transient_errors_retry() {
        let p = policy();
        let transient = TransferError::from(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(p.should_retry(&transient, 1));
        assert!(p.should_retry(&transient, 3));
        assert!(!p.should_retry(&transient, 4));

        let integrity = TransferError::Integrity {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(!p.should_retry(&integrity, 1));
        assert!(!p.should_retry(&TransferError::Cancelled, 1));
    }

    #[test]
    fn none_never_retries() {
        let transient = TransferError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(!RetryPolicy::none().should_retry(&transient, 1));
    }
}
