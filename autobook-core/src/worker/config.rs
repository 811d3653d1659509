use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ActionError;
use crate::item::FailureDisposition;
use crate::lock::{LockKeys, LockRetryPolicy};

/// Tunables for a reconciliation run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub global_lock_ttl_secs: u64,
    pub item_lock_ttl_secs: u64,
    pub key_prefix: String,
    /// Upper bound on items fetched per run.
    pub max_items_per_run: usize,
    pub item_timeout_ms: u64,
    /// Items processed at once. 1 keeps the loop sequential.
    pub concurrency: usize,
    pub item_lock_retry: LockRetryPolicy,
    /// Fraction of the global TTL after which the lease is extended.
    pub renew_at_fraction: f32,
    /// Claims older than this are returned to `PENDING` by housekeeping.
    pub stale_claim_after_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            global_lock_ttl_secs: 600,
            item_lock_ttl_secs: 300,
            key_prefix: LockKeys::DEFAULT_PREFIX.to_string(),
            max_items_per_run: 50,
            item_timeout_ms: 120_000,
            concurrency: 1,
            item_lock_retry: LockRetryPolicy::default(),
            renew_at_fraction: 0.5,
            stale_claim_after_secs: 900,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn global_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.global_lock_ttl_secs)
    }

    pub fn item_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.item_lock_ttl_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_after_secs)
    }

    /// How often the global lease is extended while a run is in flight.
    pub fn renew_interval(&self) -> Duration {
        let fraction = self.renew_at_fraction.clamp(0.05, 0.95);
        self.global_lock_ttl().mul_f32(fraction)
    }

    pub fn lock_keys(&self) -> LockKeys {
        LockKeys::new(self.key_prefix.clone())
    }
}

/// Bounded retries with capped exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total execution attempts before an item is marked `FAILED`.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ratio: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 60_000,
            backoff_max_ms: 60 * 60 * 1_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before attempt number `attempt` (1-based retry
    /// count). Doubles per attempt up to `backoff_max_ms`.
    pub fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = i32::from(attempt.saturating_sub(1));
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    pub fn jittered_delay_ms(&self, attempt: u16, rng: &mut impl Rng) -> u64 {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return 0;
        }

        let upper_cap = self.backoff_max_ms.max(1);
        let capped = base.min(upper_cap);
        let ratio = f64::from(self.jitter_ratio.max(0.0));
        let spread = capped as f64 * ratio;
        if spread < 1.0 {
            return capped;
        }
        let lower = (capped as f64 - spread).max(1.0);
        let upper = (capped as f64 + spread).min(upper_cap as f64);

        rng.random_range(lower..=upper).round() as u64
    }

    /// Decide what happens to an item whose execution just failed.
    /// `attempts_before` is the counter prior to this failure.
    pub fn disposition(
        &self,
        attempts_before: u16,
        error: &ActionError,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        let attempt = attempts_before.saturating_add(1);
        if !error.is_retryable() || attempt >= self.max_attempts {
            return FailureDisposition::Fail;
        }

        let delay_ms = self.jittered_delay_ms(attempt, &mut rand::rng());
        let delay = chrono::Duration::milliseconds(
            i64::try_from(delay_ms).unwrap_or(i64::MAX),
        );
        FailureDisposition::Retry {
            next_eligible_at: now + delay,
        }
    }
}
