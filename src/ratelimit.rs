//! Dual-axis (per-IP and per-API-key) token-bucket rate limiting.
//!
//! Grounded in the teacher's `dashflow-streaming::rate_limiter::TokenBucket`
//! (lazy refill on access, `tokens.clamp(0.0, capacity)`), generalized from
//! one per-tenant axis to the two independent axes spec.md §4.6 requires: a
//! request is only admitted if *both* buckets have capacity.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;

/// Requests/sec and burst capacity for one axis.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst_capacity: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { requests_per_second: 50.0, burst_capacity: 100 }
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: u64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            capacity: limit.burst_capacity,
            tokens: limit.burst_capacity as f64,
            refill_rate: limit.requests_per_second.max(0.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).clamp(0.0, self.capacity as f64);
        self.last_refill = now;
    }

    /// Returns `true` and consumes one token if available.
    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn seconds_until_token(&mut self) -> u64 {
        self.refill();
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            0
        } else {
            (((1.0 - self.tokens) / self.refill_rate).ceil() as u64).max(1)
        }
    }
}

/// Per-IP and per-API-key bucket maps, each with its own configured limit.
/// A request is admitted only if both axes have a token available.
pub struct RateLimiter {
    per_ip: RwLock<HashMap<String, TokenBucket>>,
    per_key: RwLock<HashMap<String, TokenBucket>>,
    ip_limit: RateLimit,
    key_limit: RateLimit,
}

impl RateLimiter {
    pub fn new(ip_limit: RateLimit, key_limit: RateLimit) -> Self {
        Self {
            per_ip: RwLock::new(HashMap::new()),
            per_key: RwLock::new(HashMap::new()),
            ip_limit,
            key_limit,
        }
    }

    /// Admit a request from `ip` authenticated as `api_key` (if any).
    /// Returns `Ok(())` if admitted, or `Err(retry_after_secs)` naming the
    /// longer of the two axes' wait times.
    pub async fn check(&self, ip: &str, api_key: Option<&str>) -> Result<(), u64> {
        let mut per_ip = self.per_ip.write().await;
        let ip_bucket = per_ip.entry(ip.to_string()).or_insert_with(|| TokenBucket::new(self.ip_limit));
        let ip_ok = ip_bucket.try_consume();
        let ip_wait = if ip_ok { 0 } else { ip_bucket.seconds_until_token() };

        let key_result = if let Some(key) = api_key {
            let mut per_key = self.per_key.write().await;
            let key_bucket = per_key.entry(key.to_string()).or_insert_with(|| TokenBucket::new(self.key_limit));
            let key_ok = key_bucket.try_consume();
            (key_ok, if key_ok { 0 } else { key_bucket.seconds_until_token() })
        } else {
            (true, 0)
        };

        if ip_ok && key_result.0 {
            Ok(())
        } else {
            // Refund whichever axis passed, since the overall request is denied.
            if ip_ok {
                if let Some(bucket) = per_ip.get_mut(ip) {
                    bucket.tokens = (bucket.tokens + 1.0).min(bucket.capacity as f64);
                }
            }
            drop(per_ip);
            if key_result.0 {
                if let Some(key) = api_key {
                    let mut per_key = self.per_key.write().await;
                    if let Some(bucket) = per_key.get_mut(key) {
                        bucket.tokens = (bucket.tokens + 1.0).min(bucket.capacity as f64);
                    }
                }
            }
            Err(ip_wait.max(key_result.1))
        }
    }

    /// Remove buckets idle for longer than `max_idle_secs`, to bound memory
    /// growth across many distinct IPs/keys.
    pub async fn prune(&self, max_idle_secs: u64) {
        let cutoff = std::time::Duration::from_secs(max_idle_secs);
        let now = Instant::now();
        self.per_ip.write().await.retain(|_, b| now.duration_since(b.last_refill) < cutoff);
        self.per_key.write().await.retain(|_, b| now.duration_since(b.last_refill) < cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_within_burst_capacity() {
        let limiter = RateLimiter::new(
            RateLimit { requests_per_second: 1.0, burst_capacity: 2 },
            RateLimit { requests_per_second: 1.0, burst_capacity: 2 },
        );
        assert!(limiter.check("1.2.3.4", None).await.is_ok());
        assert!(limiter.check("1.2.3.4", None).await.is_ok());
        assert!(limiter.check("1.2.3.4", None).await.is_err());
    }

    #[tokio::test]
    async fn key_axis_independent_of_ip_axis() {
        let limiter = RateLimiter::new(
            RateLimit { requests_per_second: 10.0, burst_capacity: 10 },
            RateLimit { requests_per_second: 1.0, burst_capacity: 1 },
        );
        assert!(limiter.check("1.2.3.4", Some("key-a")).await.is_ok());
        // Same key, different IP: key axis still exhausted.
        assert!(limiter.check("5.6.7.8", Some("key-a")).await.is_err());
    }

    #[tokio::test]
    async fn refund_on_denial_keeps_passing_axis_usable() {
        let limiter = RateLimiter::new(
            RateLimit { requests_per_second: 100.0, burst_capacity: 100 },
            RateLimit { requests_per_second: 1.0, burst_capacity: 1 },
        );
        assert!(limiter.check("1.2.3.4", Some("key-a")).await.is_ok());
        assert!(limiter.check("1.2.3.4", Some("key-a")).await.is_err());
        // The IP axis token should have been refunded, not burned by the
        // denied request above.
        assert!(limiter.check("1.2.3.4", None).await.is_ok());
    }
}
