//! Resilience utilities: retry backoff, rate limiting, bulkheads.
//!
//! - [`Backoff`]: exponential retry gating for failed registry rows
//! - [`RateLimiter`]: token bucket pacing adapter fetches against the primary
//! - [`Bulkhead`]: semaphore enforcing per-site concurrency capacities
//!
//! The backoff here does not sleep anybody: a failed row gets a `retry_at`
//! timestamp and scheduling scans skip rows whose retry time is not yet due.

use crate::config::{ReplicationSettings, VerificationSettings};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff schedule for failed rows.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Delay ceiling.
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Backoff for the replication axis, from settings.
    pub fn for_sync(settings: &ReplicationSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.backoff_base_sec),
            Duration::from_secs(settings.backoff_max_sec),
        )
    }

    /// Backoff for the verification axis, from settings.
    pub fn for_verification(settings: &VerificationSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.backoff_base_sec),
            Duration::from_secs(settings.backoff_max_sec),
        )
    }

    /// Delay before retry number `retry_count` (1-indexed: the first failure
    /// has `retry_count == 1`). Doubles per failure, capped at `max`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count <= 1 {
            return self.base.min(self.max);
        }
        let exponent = (retry_count - 1).min(16); // 2^16 * base already dwarfs any sane cap
        let factor = 1u64 << exponent;
        self.base
            .checked_mul(factor as u32)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// The wall-clock time before which a row with `retry_count` failures
    /// should not be retried.
    pub fn next_retry_time(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count);
        now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::hours(1))
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for fetch pacing.
///
/// Token bucket: tokens refill at `refill_rate` per second up to `burst_size`.
/// Each adapter fetch consumes one token, bounding pressure on the primary
/// when a large backlog drains.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 100 fetches/sec with burst of 25.
    fn default() -> Self {
        Self {
            burst_size: 25,
            refill_rate: 100,
        }
    }
}

impl RateLimitConfig {
    /// No pacing (tests, single-resource deployments).
    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket rate limiter for adapter fetches.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Acquire a permit, waiting until one is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

// =============================================================================
// Bulkhead (per-site concurrency capacity)
// =============================================================================

/// Semaphore bounding concurrent operations against one site.
///
/// Sized from the site's `sync_max_capacity` / `verification_max_capacity`.
/// A permit is held for the duration of one `process` call; dropping it
/// releases the slot.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Acquire a slot, waiting if the site is at capacity.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed while the bulkhead is alive.
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("bulkhead semaphore closed")
    }

    /// Try to acquire a slot without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
