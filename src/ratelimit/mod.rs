//! Per-key token-bucket rate limiting.
//!
//! Each quota identity gets one bucket in a concurrent map. Bucket state is
//! a single packed `AtomicU64` (milli-tokens in the high half, the
//! last-refill instant in milliseconds since the bucket's creation in the
//! low half), updated with a bounded compare-and-swap loop, so the per-request
//! critical section is O(1) and lock-free.
//!
//! Buckets are evicted after sitting idle for ten refill periods, which
//! bounds memory across a churning key population. The limiter never
//! queues: a request either takes a token now or is rejected with a
//! `retry_after` hint.

use std::{
    hint,
    sync::{Arc, atomic::AtomicU64, atomic::Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::{
    config::{ApiKeyConfig, LimitsConfig, RateConfig},
    error::GatewayError,
    observability::metrics,
};

/// Bound on compare-and-swap attempts per acquisition, so pathological
/// contention on one key degrades to a rejection instead of a spin.
const MAX_CAS_RETRIES: usize = 100;

/// Tokens are tracked in thousandths so fractional refill accumulates
/// without floats in the hot word.
const MILLI: u64 = 1000;

/// One token bucket. `now_ms` is relative to the bucket's own epoch; the
/// sweeper recycles buckets long before the 32-bit millisecond range
/// (~49 days) can wrap.
pub(crate) struct Bucket {
    /// Packed state: `(tokens_milli << 32) | last_refill_ms`.
    state: AtomicU64,
    epoch: Instant,
    capacity_milli: u64,
    refill_milli_per_ms: f64,
    refill_per_second: f64,
}

impl Bucket {
    fn new(rate: RateConfig) -> Self {
        let capacity_milli = (rate.capacity * MILLI as f64) as u64;
        Self {
            // Full at creation.
            state: AtomicU64::new(capacity_milli << 32),
            epoch: Instant::now(),
            capacity_milli,
            // tokens/s == milli-tokens/ms
            refill_milli_per_ms: rate.refill_per_second,
            refill_per_second: rate.refill_per_second,
        }
    }

    fn now_ms(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64).min(u64::from(u32::MAX))
    }

    fn last_refill_ms(&self) -> u64 {
        self.state.load(Ordering::Relaxed) & 0xffff_ffff
    }

    /// Refill proportionally to elapsed time, then take one token.
    /// On rejection returns the seconds until a full token is available.
    pub(crate) fn try_acquire(&self, now_ms: u64) -> Result<(), u64> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.state.load(Ordering::SeqCst);
            let tokens_milli = current >> 32;
            let last_ms = current & 0xffff_ffff;

            let elapsed_ms = now_ms.saturating_sub(last_ms);
            let refilled = (elapsed_ms as f64 * self.refill_milli_per_ms) as u64;
            let available = (tokens_milli + refilled).min(self.capacity_milli);

            if available < MILLI {
                let deficit_milli = MILLI - available;
                let retry_after_secs =
                    (deficit_milli as f64 / (self.refill_per_second * MILLI as f64)).ceil() as u64;
                return Err(retry_after_secs.max(1));
            }

            let next = ((available - MILLI) << 32) | (now_ms & 0xffff_ffff);
            match self
                .state
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(_) => hint::spin_loop(),
            }
        }

        // Contention this extreme on one key means the caller loses its slot.
        Err(1)
    }

    fn idle_period(&self) -> Duration {
        let refill_period_secs =
            self.capacity_milli as f64 / (self.refill_per_second * MILLI as f64);
        Duration::from_secs_f64((refill_period_secs * 10.0).max(60.0))
    }

    fn is_idle(&self) -> bool {
        let idle_ms = self.now_ms().saturating_sub(self.last_refill_ms());
        Duration::from_millis(idle_ms) > self.idle_period()
    }

    /// Buckets older than this are recycled by the sweeper so the
    /// epoch-relative millisecond counter can never reach the 32-bit wrap.
    fn is_stale_epoch(&self) -> bool {
        self.epoch.elapsed() > Duration::from_secs(30 * 24 * 3600)
    }
}

/// Per-key rate limiter.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    rates: DashMap<String, RateConfig>,
    default_rate: RateConfig,
}

impl RateLimiter {
    pub fn new(limits: &LimitsConfig, api_keys: &[ApiKeyConfig]) -> Self {
        let rates = DashMap::new();
        for key in api_keys {
            if key.capacity.is_some() || key.refill_per_second.is_some() {
                rates.insert(
                    key.name.clone(),
                    RateConfig {
                        capacity: key.capacity.unwrap_or(limits.default_rate.capacity),
                        refill_per_second: key
                            .refill_per_second
                            .unwrap_or(limits.default_rate.refill_per_second),
                    },
                );
            }
        }

        Self {
            buckets: DashMap::new(),
            rates,
            default_rate: limits.default_rate,
        }
    }

    fn rate_for(&self, identity: &str) -> RateConfig {
        self.rates
            .get(identity)
            .map(|r| *r)
            .unwrap_or(self.default_rate)
    }

    /// Admit or reject one request for the given quota identity.
    pub fn check(&self, identity: &str) -> Result<(), GatewayError> {
        let bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Bucket::new(self.rate_for(identity))))
            .clone();

        let now_ms = bucket.now_ms();
        match bucket.try_acquire(now_ms) {
            Ok(()) => Ok(()),
            Err(retry_after_secs) => {
                metrics::record_rate_limited(identity);
                tracing::debug!(
                    identity = %identity,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(GatewayError::RateLimited { retry_after_secs })
            }
        }
    }

    /// Drop idle and stale buckets. Run periodically from a background task.
    pub fn sweep(&self) {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| !bucket.is_idle() && !bucket.is_stale_epoch());
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "Swept idle rate-limit buckets");
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(capacity: f64, refill: f64) -> LimitsConfig {
        LimitsConfig {
            default_rate: RateConfig {
                capacity,
                refill_per_second: refill,
            },
            ..Default::default()
        }
    }

    #[test]
    fn burst_admits_up_to_capacity() {
        let bucket = Bucket::new(RateConfig {
            capacity: 5.0,
            refill_per_second: 1.0,
        });

        // 10 requests inside 100ms: exactly 5 admitted.
        let mut admitted = 0;
        let mut rejected = 0;
        for i in 0..10u64 {
            match bucket.try_acquire(i * 10) {
                Ok(()) => admitted += 1,
                Err(retry_after) => {
                    rejected += 1;
                    assert!(retry_after <= 5, "retry_after {retry_after} too large");
                }
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(rejected, 5);
    }

    #[test]
    fn refill_restores_tokens_after_idle() {
        let bucket = Bucket::new(RateConfig {
            capacity: 5.0,
            refill_per_second: 1.0,
        });

        for _ in 0..5 {
            bucket.try_acquire(0).unwrap();
        }
        assert!(bucket.try_acquire(0).is_err());

        // 5 seconds idle refills the bucket.
        assert!(bucket.try_acquire(5_000).is_ok());
    }

    #[test]
    fn refill_caps_at_capacity() {
        let bucket = Bucket::new(RateConfig {
            capacity: 2.0,
            refill_per_second: 10.0,
        });

        // A long idle period must not bank more than capacity.
        bucket.try_acquire(60_000).unwrap();
        bucket.try_acquire(60_000).unwrap();
        assert!(bucket.try_acquire(60_000).is_err());
    }

    #[test]
    fn steady_state_rate_converges_to_refill() {
        let bucket = Bucket::new(RateConfig {
            capacity: 5.0,
            refill_per_second: 10.0,
        });

        // Offer 40 req/s for 10 simulated seconds; acceptance must converge
        // to the 10/s refill rate (plus the initial burst capacity).
        let mut admitted = 0;
        for i in 0..400u64 {
            if bucket.try_acquire(i * 25).is_ok() {
                admitted += 1;
            }
        }
        let expected = 10.0 * 10.0 + 5.0;
        let deviation = (admitted as f64 - expected).abs() / expected;
        assert!(
            deviation < 0.05,
            "admitted {admitted}, expected ~{expected}"
        );
    }

    #[test]
    fn fractional_refill_accumulates() {
        let bucket = Bucket::new(RateConfig {
            capacity: 1.0,
            refill_per_second: 0.5,
        });

        bucket.try_acquire(0).unwrap();
        // 1 second at 0.5/s is half a token: still rejected.
        let retry_after = bucket.try_acquire(1_000).unwrap_err();
        assert_eq!(retry_after, 1);
        // 2 seconds is a whole token.
        assert!(bucket.try_acquire(2_000).is_ok());
    }

    #[test]
    fn limiter_separates_identities() {
        let limiter = RateLimiter::new(&limits(1.0, 0.001), &[]);

        assert!(limiter.check("alpha").is_ok());
        assert!(limiter.check("beta").is_ok());
        assert!(matches!(
            limiter.check("alpha"),
            Err(GatewayError::RateLimited { .. })
        ));
    }

    #[test]
    fn per_key_override_applies() {
        let keys = vec![ApiKeyConfig {
            name: "heavy".to_string(),
            key: "k".to_string(),
            capacity: Some(3.0),
            refill_per_second: None,
        }];
        let limiter = RateLimiter::new(&limits(1.0, 0.001), &keys);

        assert!(limiter.check("heavy").is_ok());
        assert!(limiter.check("heavy").is_ok());
        assert!(limiter.check("heavy").is_ok());
        assert!(limiter.check("heavy").is_err());

        // Unknown keys still get the default capacity of 1.
        assert!(limiter.check("light").is_ok());
        assert!(limiter.check("light").is_err());
    }

    #[test]
    fn rejection_carries_retry_after_from_refill_rate() {
        let limiter = RateLimiter::new(&limits(1.0, 0.25), &[]);

        limiter.check("k").unwrap();
        match limiter.check("k") {
            Err(GatewayError::RateLimited { retry_after_secs }) => {
                // One token at 0.25/s is four seconds away.
                assert_eq!(retry_after_secs, 4);
            }
            other => panic!("expected rate_limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_checks_admit_exactly_capacity() {
        let limiter = Arc::new(RateLimiter::new(&limits(100.0, 0.001), &[]));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check("shared").is_ok() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 100, "exactly capacity admitted under contention");
    }

    #[test]
    fn sweep_drops_only_idle_buckets() {
        let limiter = RateLimiter::new(&limits(10.0, 2.0), &[]);
        limiter.check("active").unwrap();
        assert_eq!(limiter.bucket_count(), 1);

        // A freshly used bucket is not idle.
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
