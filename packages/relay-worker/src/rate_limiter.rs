//! Lock-free token bucket rate limiter (spec §4.1).
//!
//! Refill happens opportunistically on every `allow()` call using CAS:
//! compute how many whole intervals have elapsed since the last refill, try
//! to advance the refill clock via CAS, and if that succeeds add
//! `intervals * refill_rate` tokens (capped at `max`) via a CAS loop. A
//! single token is then consumed via its own CAS loop.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

pub struct RateLimiter {
    tokens: AtomicI64,
    max_tokens: AtomicI64,
    refill_rate: AtomicI64,
    refill_interval_ns: AtomicU64,
    last_refill_ns: AtomicU64,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl RateLimiter {
    /// Create a rate limiter starting with a full bucket.
    pub fn new(max_tokens: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self::with_clock(max_tokens, refill_rate, refill_interval, default_clock)
    }

    /// Create a rate limiter with an injectable clock, for deterministic tests.
    pub fn with_clock(
        max_tokens: u64,
        refill_rate: u64,
        refill_interval: Duration,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        let now = clock();
        Self {
            tokens: AtomicI64::new(max_tokens as i64),
            max_tokens: AtomicI64::new(max_tokens as i64),
            refill_rate: AtomicI64::new(refill_rate as i64),
            refill_interval_ns: AtomicU64::new(refill_interval.as_nanos() as u64),
            last_refill_ns: AtomicU64::new(now),
            clock: Box::new(clock),
        }
    }

    /// Returns true iff a token was consumed.
    pub fn allow(&self) -> bool {
        self.refill();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current <= 0 {
                    None
                } else {
                    Some(current - 1)
                }
            })
            .is_ok()
    }

    /// Opportunistic refill: advance the refill clock by whole intervals and
    /// add tokens for each one that has elapsed. Idempotent under concurrent
    /// callers — only the CAS winner's intervals get credited.
    fn refill(&self) {
        let interval_ns = self.refill_interval_ns.load(Ordering::Acquire);
        if interval_ns == 0 {
            return;
        }
        let now = (self.clock)();
        let last = self.last_refill_ns.load(Ordering::Acquire);
        if now <= last {
            return;
        }
        let elapsed = now - last;
        let intervals = elapsed / interval_ns;
        if intervals == 0 {
            return;
        }
        let new_last = last + intervals * interval_ns;
        if self
            .last_refill_ns
            .compare_exchange(last, new_last, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread already advanced the clock; it will have added tokens.
            return;
        }

        let refill_rate = self.refill_rate.load(Ordering::Acquire);
        let max = self.max_tokens.load(Ordering::Acquire);
        let added = intervals as i64 * refill_rate;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + added).min(max))
            });
    }

    /// Rewrite max tokens and refill rate atomically with respect to each
    /// other individually; in-flight `allow()` calls may briefly observe a
    /// mixed old/new pair but converge on the next refill (spec §4.1).
    pub fn set_rate(&self, max_tokens: u64, refill_rate: u64) {
        self.max_tokens.store(max_tokens as i64, Ordering::Release);
        self.refill_rate.store(refill_rate as i64, Ordering::Release);
    }

    pub fn available_tokens(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }
}

fn default_clock() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::Arc;

    fn fake_clock() -> (Arc<StdAtomicU64>, impl Fn() -> u64) {
        let now = Arc::new(StdAtomicU64::new(0));
        let reader = now.clone();
        (now, move || reader.load(Ordering::SeqCst))
    }

    #[test]
    fn consumption_never_goes_negative() {
        let (_clock, read) = fake_clock();
        let limiter = RateLimiter::with_clock(2, 2, Duration::from_secs(1), read);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[test]
    fn refill_is_capped_at_max() {
        let (clock, read) = fake_clock();
        let limiter = RateLimiter::with_clock(2, 2, Duration::from_secs(1), read);
        assert!(limiter.allow());
        assert!(limiter.allow());
        clock.store(Duration::from_secs(10).as_nanos() as u64, Ordering::SeqCst);
        assert!(limiter.allow());
        assert_eq!(limiter.available_tokens(), 1);
    }

    #[test]
    fn scenario_s3_rate_limit_drop() {
        // spec S3: max=2, refill=2/s, 5 submits within 10ms -> first two true, rest false.
        let (_clock, read) = fake_clock();
        let limiter = RateLimiter::with_clock(2, 2, Duration::from_secs(1), read);
        let results: Vec<bool> = (0..5).map(|_| limiter.allow()).collect();
        assert_eq!(results, vec![true, true, false, false, false]);
    }

    #[test]
    fn set_rate_updates_future_refills() {
        let (clock, read) = fake_clock();
        let limiter = RateLimiter::with_clock(1, 1, Duration::from_secs(1), read);
        assert!(limiter.allow());
        limiter.set_rate(5, 5);
        clock.store(Duration::from_secs(1).as_nanos() as u64, Ordering::SeqCst);
        assert!(limiter.allow());
        assert_eq!(limiter.available_tokens(), 4);
    }
}
