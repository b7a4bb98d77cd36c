//! Exponential backoff shared by token refresh and Graph retries.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Retry schedule. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// No waiting between attempts. Used by tests and for already-throttled paths.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        let factor = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).min(self.max.as_secs_f64()))
    }
}

/// Sleep for `duration`. Returns false if `cancel` fired first.
pub async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff {
            jitter: false,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_immediate_never_waits() {
        let backoff = Backoff::immediate(4);
        assert_eq!(backoff.delay(3), Duration::ZERO);
        assert_eq!(backoff.max_attempts, 4);
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_unless_cancelled(Duration::from_secs(60), &cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let cancel = CancellationToken::new();
        assert!(sleep_unless_cancelled(Duration::from_secs(5), &cancel).await);
    }
}
