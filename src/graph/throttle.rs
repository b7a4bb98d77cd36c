//! Throttling policy and `Retry-After` parsing.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::retry::Backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    /// Total attempts of one request while it keeps being throttled.
    pub max_attempts: u32,
    /// Upper bound on any single wait, including server hints.
    pub max_wait: Duration,
    /// Used when a 429 carries no `Retry-After`.
    pub fallback: Backoff,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_wait: Duration::from_secs(60),
            fallback: Backoff {
                max: Duration::from_secs(60),
                ..Backoff::default()
            },
        }
    }
}

impl ThrottlePolicy {
    /// How long to wait before attempt `attempt + 1`.
    pub fn wait(&self, hint: Option<Duration>, attempt: u32) -> Duration {
        hint.unwrap_or_else(|| self.fallback.delay(attempt))
            .min(self.max_wait)
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            // Hints beyond Duration's range still mean "wait as long as allowed".
            return Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX));
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("2", now), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0 ", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("1.5", now), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        // A date in the past means retry now.
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_out_of_range_hint_saturates() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("1e20", now), Some(Duration::MAX));
        assert_eq!(parse_retry_after("99999999999999999999", now), Some(Duration::MAX));
        assert_eq!(
            ThrottlePolicy::default().wait(parse_retry_after("1e20", now), 1),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_garbage() {
        let now = Utc::now();
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-3", now), None);
    }

    #[test]
    fn test_wait_is_capped() {
        let policy = ThrottlePolicy::default();
        assert_eq!(
            policy.wait(Some(Duration::from_secs(3600)), 1),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.wait(Some(Duration::from_secs(2)), 1),
            Duration::from_secs(2)
        );
        assert!(policy.wait(None, 10) <= Duration::from_secs(60));
    }
}
