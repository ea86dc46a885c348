//! Per-IP handshake rate limiting: token buckets with bounded tracking.
//!
//! Memory is capped at `max_buckets` tracked IPs; on pressure, idle
//! buckets are swept before new IPs are admitted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Buckets idle this long are eligible for eviction on pressure.
const IDLE_EVICT: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct HandshakeLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    rps: f64,
    burst: f64,
    max_buckets: usize,
}

impl HandshakeLimiter {
    pub fn new(rps: u32, burst: u32, max_buckets: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rps: f64::from(rps.max(1)),
            burst: f64::from(burst.max(1)),
            max_buckets: max_buckets.max(1),
        }
    }

    /// Returns `true` when the handshake should be allowed.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        if !buckets.contains_key(&ip) && buckets.len() >= self.max_buckets {
            buckets.retain(|_, b| now.duration_since(b.last) < IDLE_EVICT);
            if buckets.len() >= self.max_buckets {
                // Still saturated with active IPs — refuse to track more.
                return false;
            }
        }

        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            last: now,
        });
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = HandshakeLimiter::new(10, 3, 16);
        let now = Instant::now();
        assert!(limiter.allow_at(ip(1), now));
        assert!(limiter.allow_at(ip(1), now));
        assert!(limiter.allow_at(ip(1), now));
        assert!(!limiter.allow_at(ip(1), now));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = HandshakeLimiter::new(10, 1, 16);
        let now = Instant::now();
        assert!(limiter.allow_at(ip(1), now));
        assert!(!limiter.allow_at(ip(1), now));
        // 100ms at 10 rps refills one token.
        assert!(limiter.allow_at(ip(1), now + Duration::from_millis(100)));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = HandshakeLimiter::new(10, 1, 16);
        let now = Instant::now();
        assert!(limiter.allow_at(ip(1), now));
        assert!(limiter.allow_at(ip(2), now));
        assert!(!limiter.allow_at(ip(1), now));
    }

    #[test]
    fn test_bucket_cap_rejects_new_ips_when_saturated() {
        let limiter = HandshakeLimiter::new(10, 5, 2);
        let now = Instant::now();
        assert!(limiter.allow_at(ip(1), now));
        assert!(limiter.allow_at(ip(2), now));
        // Both tracked IPs are fresh; a third cannot be admitted.
        assert!(!limiter.allow_at(ip(3), now));
        // After the idle window, stale buckets are swept and the new IP fits.
        assert!(limiter.allow_at(ip(3), now + IDLE_EVICT + Duration::from_secs(1)));
    }
}
