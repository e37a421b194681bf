use exponential_backoff::Backoff;
use std::collections::BTreeSet;
use std::time::Duration;

/// Retry schedule for requests which fail retryably: exponential backoff with
/// jitter, plus the set of HTTP statuses that are worth retrying at all.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff before the first retry.
    pub initial: Duration,
    /// Ceiling on any single backoff, including server-provided Retry-After.
    pub max: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Growth factor between consecutive backoffs.
    pub multiplier: u32,
    /// Jitter fraction applied to each backoff.
    pub jitter: f32,
    /// HTTP statuses worth retrying at all.
    pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            max_attempts: 5,
            multiplier: 2,
            jitter: 0.2,
            retryable_statuses: [408, 425, 429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// Replace the set of HTTP statuses considered retryable.
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Build the backoff schedule for one logical request.
    /// `schedule.next(attempt)` yields the wait before retry `attempt`,
    /// or None once attempts are exhausted.
    pub fn schedule(&self) -> Backoff {
        let mut backoff = Backoff::new(self.max_attempts, self.initial, Some(self.max));
        backoff.set_factor(self.multiplier);
        backoff.set_jitter(self.jitter);
        backoff
    }

    /// The wait before retry number `attempt` (1-based), preferring a
    /// server-provided Retry-After when present. Either source is capped at
    /// `self.max`. None means attempts are exhausted.
    pub fn next_backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let computed = self.schedule().next(attempt).unwrap_or(self.max);
        Some(match retry_after {
            Some(hinted) => hinted.min(self.max),
            None => computed,
        })
    }
}

/// Parse a Retry-After header value: either delay-seconds or an HTTP-date.
/// Unparseable values are ignored rather than failing the request.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.signed_duration_since(chrono::Utc::now());
    delta.to_std().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_retryable_statuses() {
        let policy = RetryPolicy::default();
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(policy.is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 422, 501] {
            assert!(!policy.is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn retryable_statuses_are_configurable() {
        let policy = RetryPolicy::default().with_retryable_statuses([503]);
        assert!(policy.is_retryable_status(503));
        assert!(!policy.is_retryable_status(429));
    }

    #[test]
    fn retry_after_wins_but_is_capped() {
        let policy = RetryPolicy {
            max: Duration::from_secs(10),
            ..Default::default()
        };
        let wait = policy
            .next_backoff(1, Some(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(wait, Duration::from_secs(3));

        let wait = policy
            .next_backoff(1, Some(Duration::from_secs(600)))
            .unwrap();
        assert_eq!(wait, Duration::from_secs(10));
    }

    #[test]
    fn backoff_exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.next_backoff(1, None).is_some());
        assert!(policy.next_backoff(2, None).is_some());
        assert!(policy.next_backoff(3, None).is_none());
    }

    #[test]
    fn parse_retry_after_seconds_and_garbage() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn parse_retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let parsed = parse_retry_after(&future.to_rfc2822()).expect("parses");
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(80));
    }
}
