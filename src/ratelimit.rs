//! Hand-rolled per-identity token bucket, guarded the same way the rest of
//! the service crate guards its shared tables: `ahash` map behind
//! `parking_lot`. Deliberately not pulled from a crate (e.g. `governor`) —
//! data-path-critical pieces stay hand-rolled here.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use service::Table;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-identity token bucket rate limiter.
///
/// # Test
///
/// ```
/// use tunnel_relay::ratelimit::RateLimiter;
///
/// let limiter = RateLimiter::new(2, std::time::Duration::from_secs(60));
/// assert!(limiter.check("tok"));
/// assert!(limiter.check("tok"));
/// assert!(!limiter.check("tok"));
/// ```
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<Table<String, Bucket>>,
}

impl RateLimiter {
    /// `requests_per_window` refills linearly over `window`.
    pub fn new(requests_per_window: u64, window: Duration) -> Self {
        Self {
            capacity: requests_per_window as f64,
            refill_per_sec: requests_per_window as f64 / window.as_secs_f64(),
            buckets: Mutex::new(Table::default()),
        }
    }

    /// Attempt to consume one token for `identity`. Returns `false` (and
    /// consumes nothing) when the bucket is empty.
    pub fn check(&self, identity: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();

        let bucket = buckets.entry(identity.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until at least one token is available again, for the
    /// `Retry-After` header.
    pub fn retry_after_secs(&self) -> u64 {
        (1.0 / self.refill_per_sec).ceil().max(1.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_identities_have_independent_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        assert!(limiter.check("a"));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check("a"));
    }
}
