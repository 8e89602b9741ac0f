use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per task, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> CoreResult<Self> {
        if max_attempts == 0 {
            return Err(CoreError::validation(
                "retry policy must allow at least one attempt",
            ));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        })
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn should_retry(&self, error: &CoreError, attempts_made: u32) -> bool {
        error.is_retryable() && attempts_made < self.max_attempts
    }

    /// Delay before the attempt following `attempts_made` failed attempts.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let shift = attempts_made.saturating_sub(1).min(20);
        let backoff_ms = base_ms.saturating_mul(1u128 << shift).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;
    use crate::models::CoreError;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350)).unwrap();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn validation_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&CoreError::transient("429"), 1));
        assert!(!policy.should_retry(&CoreError::transient("429"), 3));
        assert!(!policy.should_retry(&CoreError::validation("bad id"), 1));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).is_err());
    }
}
