use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Token-bucket rate limiter with one bucket per host. Hosts without a
/// configured bucket are not limited. Acquisition suspends the calling task
/// until a token is available; it never blocks an OS thread.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: tokio::sync::Mutex<HashMap<String, Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    burst: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
    }
}

impl RateLimiter {
    /// Install or replace the bucket for `host`. A fresh bucket starts full.
    pub async fn set_limit(&self, host: &str, tokens_per_second: f64, burst: u32) {
        let mut buckets = self.buckets.lock().await;
        buckets.insert(
            host.to_string(),
            Bucket {
                tokens: burst as f64,
                rate: tokens_per_second,
                burst: burst as f64,
                refilled_at: Instant::now(),
            },
        );
    }

    /// Take one token for `host`, suspending until one is available.
    /// Returns how long the caller waited, for telemetry.
    pub async fn acquire(&self, host: &str) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let Some(bucket) = buckets.get_mut(host) else {
                    return Duration::ZERO;
                };
                bucket.refill(Instant::now());

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return started.elapsed();
                }
                // Sleep long enough for one token to accrue, outside the lock.
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_hosts_pass_through() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.acquire("example.org").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_paced() {
        let limiter = RateLimiter::default();
        limiter.set_limit("api.example.org", 10.0, 2).await;

        // The first two tokens are the burst and cost nothing.
        assert_eq!(limiter.acquire("api.example.org").await, Duration::ZERO);
        assert_eq!(limiter.acquire("api.example.org").await, Duration::ZERO);

        // The third must wait for refill at 10/s.
        let waited = limiter.acquire("api.example.org").await;
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(150), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_per_host() {
        let limiter = RateLimiter::default();
        limiter.set_limit("slow.example.org", 0.001, 1).await;

        assert_eq!(limiter.acquire("slow.example.org").await, Duration::ZERO);
        // A different host is not throttled by slow.example.org's empty bucket.
        assert_eq!(limiter.acquire("fast.example.org").await, Duration::ZERO);
    }
}
