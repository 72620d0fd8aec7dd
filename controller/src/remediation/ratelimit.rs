//! Token-bucket admission control, keyed by action name
//!
//! Buckets refill continuously at `refill_rate` tokens per second, clamped
//! to capacity. A zero refill rate disables refill (the initial capacity is
//! the total budget); a zero capacity denies everything. Buckets are created
//! lazily on first use and never evicted; cardinality is bounded by the
//! closed set of action names.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Instant;

struct TokenBucket {
    tokens: u64,
    capacity: u64,
    refill_rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        self.refill();

        if self.tokens > 0 {
            self.tokens -= 1;
            return true;
        }
        false
    }

    // last_refill only advances when whole tokens were added, so fractional
    // progress keeps accumulating instead of being rounded away.
    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;

        if to_add > 0 {
            self.tokens = (self.tokens + to_add).min(self.capacity);
            self.last_refill = Instant::now();
        }
    }
}

/// Rate limiter table keyed by action name.
pub struct ActionRateLimiter {
    buckets: RwLock<HashMap<String, Mutex<TokenBucket>>>,
    default_rate: u64,
    default_capacity: u64,
}

impl ActionRateLimiter {
    #[must_use]
    pub fn new(default_rate: u64, default_capacity: u64) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_rate,
            default_capacity,
        }
    }

    /// Whether `action` may run now. Consumes a token when admitted.
    pub fn allow(&self, action: &str) -> bool {
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(action) {
                return bucket.lock().allow();
            }
        }

        // double-checked creation under the write lock
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(action.to_string()).or_insert_with(|| {
            Mutex::new(TokenBucket::new(self.default_capacity, self.default_rate))
        });
        let allowed = bucket.lock().allow();
        allowed
    }

    /// Replace the bucket for `action` with a custom rate and capacity.
    pub fn set_rate(&self, action: &str, rate: u64, capacity: u64) {
        let mut buckets = self.buckets.write();
        buckets.insert(action.to_string(), Mutex::new(TokenBucket::new(capacity, rate)));
    }

    /// Current `(tokens, capacity)` for an action; defaults when the bucket
    /// has not been created yet.
    pub fn stats(&self, action: &str) -> (u64, u64) {
        let buckets = self.buckets.read();
        match buckets.get(action) {
            Some(bucket) => {
                let bucket = bucket.lock();
                (bucket.tokens, bucket.capacity)
            }
            None => (self.default_capacity, self.default_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn consumes_down_to_zero_then_denies() {
        let limiter = ActionRateLimiter::new(0, 3);

        assert!(limiter.allow("restart-pod"));
        assert!(limiter.allow("restart-pod"));
        assert!(limiter.allow("restart-pod"));
        assert!(!limiter.allow("restart-pod"));

        let (tokens, capacity) = limiter.stats("restart-pod");
        assert_eq!(tokens, 0);
        assert_eq!(capacity, 3);
    }

    #[test]
    fn refills_over_time_clamped_to_capacity() {
        let limiter = ActionRateLimiter::new(10, 2);

        assert!(limiter.allow("scale-replicas"));
        assert!(limiter.allow("scale-replicas"));
        assert!(!limiter.allow("scale-replicas"));

        std::thread::sleep(Duration::from_millis(150));
        // ~1.5 tokens accrued -> 1 whole token
        assert!(limiter.allow("scale-replicas"));
        assert!(!limiter.allow("scale-replicas"));

        std::thread::sleep(Duration::from_millis(500));
        // well past capacity's worth of refill; clamp applies
        let (tokens, _) = limiter.stats("scale-replicas");
        assert!(tokens <= 2);
    }

    #[test]
    fn zero_refill_rate_means_fixed_budget() {
        let limiter = ActionRateLimiter::new(0, 1);

        assert!(limiter.allow("rollback-deployment"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!limiter.allow("rollback-deployment"));
    }

    #[test]
    fn zero_capacity_denies_everything() {
        let limiter = ActionRateLimiter::new(100, 0);
        assert!(!limiter.allow("restart-pod"));
    }

    #[test]
    fn buckets_are_independent_per_action() {
        let limiter = ActionRateLimiter::new(0, 1);

        assert!(limiter.allow("restart-pod"));
        assert!(!limiter.allow("restart-pod"));
        // a different action name still has its own budget
        assert!(limiter.allow("scale-replicas"));
    }

    #[test]
    fn set_rate_overrides_a_bucket() {
        let limiter = ActionRateLimiter::new(0, 1);
        assert!(limiter.allow("restart-pod"));
        assert!(!limiter.allow("restart-pod"));

        limiter.set_rate("restart-pod", 0, 5);
        for _ in 0..5 {
            assert!(limiter.allow("restart-pod"));
        }
        assert!(!limiter.allow("restart-pod"));
    }

    #[test]
    fn admission_bound_over_window() {
        // capacity + floor(window * rate) is the hard ceiling
        let limiter = ActionRateLimiter::new(10, 5);
        let mut admitted = 0;
        let started = Instant::now();

        while started.elapsed() < Duration::from_millis(300) {
            if limiter.allow("restart-pod") {
                admitted += 1;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let window_secs = started.elapsed().as_secs_f64();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ceiling = 5 + (window_secs * 10.0) as u64;
        assert!(admitted <= ceiling, "admitted {admitted} > ceiling {ceiling}");
    }
}
