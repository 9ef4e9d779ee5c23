// crates/pdsno-security/src/rate_limit.rs
// ============================================================================
// Module: Rate Limiting
// Description: Token-bucket throttling with authentication lockout.
// Purpose: Bound request rates per client and brake brute-force attempts.
// Dependencies: pdsno-core, tracing
// ============================================================================

//! ## Overview
//! Each client gets a token bucket refilled continuously at `rpm / 60`
//! tokens per second with capacity equal to the burst size. A request
//! consumes one token (or a caller-specified cost); an empty bucket denies
//! with a retry-after hint. The [`AuthRateLimiter`] specialization tracks
//! consecutive denials and locks a client out for a fixed duration once the
//! threshold is crossed; the lockout check runs before bucket evaluation.
//!
//! Time flows through the injected [`Clock`], so tests advance it manually
//! instead of sleeping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use pdsno_core::Clock;
use pdsno_core::UtcTimestamp;
use tracing::debug;
use tracing::warn;

// ============================================================================
// SECTION: Token Bucket
// ============================================================================

/// Single-client token bucket with continuous refill.
///
/// # Invariants
/// - `tokens` never exceeds `capacity`.
/// - Refill is computed from elapsed time at each consume.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Refill rate in tokens per second.
    rate: f64,
    /// Maximum token count.
    capacity: f64,
    /// Current token count.
    tokens: f64,
    /// Instant of the last refill computation.
    last_refill: UtcTimestamp,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(rate: f64, capacity: u32, now: UtcTimestamp) -> Self {
        Self {
            rate,
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Attempts to consume `cost` tokens at `now`.
    #[must_use]
    pub fn consume(&mut self, cost: u32, now: UtcTimestamp) -> bool {
        self.refill(now);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Returns the current token count after refill.
    #[must_use]
    pub fn available(&mut self, now: UtcTimestamp) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Returns the instant of the last refill computation.
    #[must_use]
    pub const fn last_activity(&self) -> UtcTimestamp {
        self.last_refill
    }

    /// Adds tokens for the time elapsed since the last refill.
    fn refill(&mut self, now: UtcTimestamp) {
        let elapsed = now.seconds_since(&self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

// ============================================================================
// SECTION: Rate Limiter
// ============================================================================

/// Denial detail returned alongside a refused request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// Human-readable refusal reason.
    pub reason: String,
    /// Seconds until a retry could succeed, when computable.
    pub retry_after_seconds: Option<u64>,
}

/// Multi-client rate limiter with per-client buckets.
///
/// # Invariants
/// - A denial increments the client's violation count; a grant clears it.
pub struct RateLimiter {
    /// Sustained request rate in tokens per second.
    rate: f64,
    /// Burst size (bucket capacity).
    burst: u32,
    /// Per-client buckets.
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Consecutive violations per client.
    violations: Mutex<HashMap<String, u32>>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter allowing `requests_per_minute` sustained with the
    /// given burst.
    #[must_use]
    pub fn new(requests_per_minute: u32, burst: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate: f64::from(requests_per_minute) / 60.0,
            burst,
            buckets: Mutex::new(HashMap::new()),
            violations: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Decides whether a request of the given cost is allowed.
    pub fn allow_request(&self, client_id: &str, cost: u32) -> Result<(), Denial> {
        let now = self.clock.now();
        let (granted, available) = {
            let Some(mut buckets) = guard(&self.buckets) else {
                return Err(Denial {
                    reason: "rate limiter unavailable".to_string(),
                    retry_after_seconds: None,
                });
            };
            let bucket = buckets
                .entry(client_id.to_string())
                .or_insert_with(|| TokenBucket::new(self.rate, self.burst, now));
            let granted = bucket.consume(cost, now);
            (granted, bucket.available(now))
        };

        if granted {
            if let Some(mut violations) = guard(&self.violations) {
                violations.remove(client_id);
            }
            return Ok(());
        }

        let count = guard(&self.violations).map_or(1, |mut violations| {
            let entry = violations.entry(client_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        });
        warn!(client_id, violations = count, "rate limit exceeded");

        let deficit = (f64::from(cost) - available).max(0.0);
        let retry_after = if self.rate > 0.0 {
            Some((deficit / self.rate).ceil() as u64)
        } else {
            None
        };
        Err(Denial {
            reason: "rate limit exceeded".to_string(),
            retry_after_seconds: retry_after,
        })
    }

    /// Returns the whole tokens remaining for a client.
    #[must_use]
    pub fn remaining(&self, client_id: &str) -> u32 {
        let now = self.clock.now();
        guard(&self.buckets).map_or(self.burst, |mut buckets| {
            buckets.get_mut(client_id).map_or(self.burst, |bucket| {
                let available = bucket.available(now).max(0.0).min(f64::from(u32::MAX));
                available as u32
            })
        })
    }

    /// Returns the consecutive violation count for a client.
    #[must_use]
    pub fn violations(&self, client_id: &str) -> u32 {
        guard(&self.violations)
            .and_then(|violations| violations.get(client_id).copied())
            .unwrap_or(0)
    }

    /// Clears a client's bucket and violations.
    pub fn reset_client(&self, client_id: &str) {
        if let Some(mut buckets) = guard(&self.buckets) {
            buckets.remove(client_id);
        }
        if let Some(mut violations) = guard(&self.violations) {
            violations.remove(client_id);
        }
        debug!(client_id, "reset rate limit state");
    }

    /// Drops buckets idle for longer than `max_idle_seconds`.
    pub fn cleanup_idle(&self, max_idle_seconds: i64) {
        let now = self.clock.now();
        if let Some(mut buckets) = guard(&self.buckets) {
            buckets.retain(|_, bucket| {
                now.seconds_since(&bucket.last_activity()) <= max_idle_seconds as f64
            });
        }
    }
}

/// Locks a mutex-held map, returning `None` on poisoning.
fn guard<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    mutex.lock().ok()
}

// ============================================================================
// SECTION: Authentication Limiter
// ============================================================================

/// Rate limiter for authentication attempts with lockout.
///
/// # Invariants
/// - The lockout check precedes bucket evaluation.
/// - Lockout triggers after `lockout_threshold` consecutive denials.
pub struct AuthRateLimiter {
    /// Underlying per-client limiter.
    limiter: RateLimiter,
    /// Consecutive denials before lockout.
    lockout_threshold: u32,
    /// Lockout duration in seconds.
    lockout_seconds: i64,
    /// Active lockouts by client.
    lockouts: Mutex<HashMap<String, UtcTimestamp>>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl AuthRateLimiter {
    /// Creates an authentication limiter.
    #[must_use]
    pub fn new(
        attempts_per_minute: u32,
        lockout_threshold: u32,
        lockout_seconds: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(attempts_per_minute, attempts_per_minute, clock.clone()),
            lockout_threshold,
            lockout_seconds,
            lockouts: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Decides whether an authentication attempt is allowed.
    pub fn allow_attempt(&self, client_id: &str) -> Result<(), Denial> {
        let now = self.clock.now();

        if let Some(mut lockouts) = guard(&self.lockouts) {
            if let Some(until) = lockouts.get(client_id).copied() {
                if until.is_after(&now) {
                    let remaining = until.seconds_since(&now).max(0.0);
                    return Err(Denial {
                        reason: "client locked out".to_string(),
                        retry_after_seconds: Some(remaining.ceil() as u64),
                    });
                }
                lockouts.remove(client_id);
                self.limiter.reset_client(client_id);
            }
        }

        let verdict = self.limiter.allow_request(client_id, 1);
        if verdict.is_err() && self.limiter.violations(client_id) >= self.lockout_threshold {
            let until = now.plus_seconds(self.lockout_seconds);
            if let Some(mut lockouts) = guard(&self.lockouts) {
                lockouts.insert(client_id.to_string(), until);
            }
            warn!(client_id, "client locked out after repeated denials");
            return Err(Denial {
                reason: "locked out after repeated failures".to_string(),
                retry_after_seconds: Some(self.lockout_seconds.max(0) as u64),
            });
        }
        verdict
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pdsno_core::ManualClock;
    use pdsno_core::UtcTimestamp;

    use super::AuthRateLimiter;
    use super::RateLimiter;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(UtcTimestamp::from_unix_seconds(1_700_000_000).unwrap()))
    }

    #[test]
    fn burst_then_deny_then_refill() {
        let clock = clock();
        let limiter = RateLimiter::new(60, 3, clock.clone());

        for _ in 0..3 {
            assert!(limiter.allow_request("client-1", 1).is_ok());
        }
        let denial = limiter.allow_request("client-1", 1).unwrap_err();
        assert!(denial.retry_after_seconds.is_some());

        clock.advance_seconds(2);
        assert!(limiter.allow_request("client-1", 1).is_ok());
    }

    #[test]
    fn clients_are_isolated() {
        let clock = clock();
        let limiter = RateLimiter::new(60, 1, clock);
        assert!(limiter.allow_request("client-1", 1).is_ok());
        assert!(limiter.allow_request("client-1", 1).is_err());
        assert!(limiter.allow_request("client-2", 1).is_ok());
    }

    #[test]
    fn violations_clear_on_grant() {
        let clock = clock();
        let limiter = RateLimiter::new(60, 1, clock.clone());
        assert!(limiter.allow_request("client-1", 1).is_ok());
        assert!(limiter.allow_request("client-1", 1).is_err());
        assert_eq!(limiter.violations("client-1"), 1);

        clock.advance_seconds(2);
        assert!(limiter.allow_request("client-1", 1).is_ok());
        assert_eq!(limiter.violations("client-1"), 0);
    }

    #[test]
    fn lockout_engages_and_expires() {
        let clock = clock();
        let limiter = AuthRateLimiter::new(2, 3, 900, clock.clone());

        assert!(limiter.allow_attempt("alice").is_ok());
        assert!(limiter.allow_attempt("alice").is_ok());
        assert!(limiter.allow_attempt("alice").is_err());
        assert!(limiter.allow_attempt("alice").is_err());
        // Third consecutive denial crosses the threshold and locks out.
        let denial = limiter.allow_attempt("alice").unwrap_err();
        assert_eq!(denial.reason, "locked out after repeated failures");

        // Still locked out even after the bucket would have refilled.
        clock.advance_seconds(120);
        assert_eq!(limiter.allow_attempt("alice").unwrap_err().reason, "client locked out");

        clock.advance_seconds(900);
        assert!(limiter.allow_attempt("alice").is_ok());
    }

    #[test]
    fn idle_buckets_are_swept() {
        let clock = clock();
        let limiter = RateLimiter::new(60, 5, clock.clone());
        assert!(limiter.allow_request("client-1", 1).is_ok());
        clock.advance_seconds(7_200);
        limiter.cleanup_idle(3_600);
        assert_eq!(limiter.remaining("client-1"), 5);
    }
}
