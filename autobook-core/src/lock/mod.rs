//! Distributed mutual exclusion for monitor runs and individual work items.
//!
//! A lock is a key holding an opaque holder token with a TTL. Acquisition is a
//! single atomic set-if-absent; release and extension only touch the key when
//! it still carries the caller's token, so a run never deletes a lock that
//! expired underneath it and was taken by someone else.

pub mod memory;
#[cfg(feature = "database")]
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::LockError;
use crate::item::WorkItemId;

pub use memory::InMemoryLockManager;
#[cfg(feature = "database")]
pub use self::redis::RedisLockManager;

/// A held lock: key, holder token and the TTL it was taken with.
#[derive(Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
    ttl: Duration,
}

impl LockLease {
    pub fn new(
        key: impl Into<String>,
        token: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
            ttl,
        }
    }

    /// Fresh lease with a random holder token.
    pub fn generate(key: impl Into<String>, ttl: Duration) -> Self {
        Self::new(key, Uuid::new_v4().to_string(), ttl)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl fmt::Debug for LockLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("ttl_ms", &self.ttl.as_millis())
            .finish()
    }
}

/// Atomic lock store contract consumed by the worker.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Set `key` only if absent, expiring after `ttl`. `Ok(None)` means another
    /// holder is active. Errors must never be read as "acquired".
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError>;

    /// Delete the key if it still carries this lease's token. Releasing an
    /// expired, already released or never acquired lease is not an error.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;

    /// Reset the TTL of a lease still owned by the caller. `Ok(false)` means
    /// ownership was lost.
    async fn extend(
        &self,
        lease: &LockLease,
        ttl: Duration,
    ) -> Result<bool, LockError>;
}

/// Retry policy for contended acquisitions. Store errors are never retried
/// here; they fail closed straight away.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockRetryPolicy {
    /// Extra attempts after the first one.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl LockRetryPolicy {
    pub const NONE: LockRetryPolicy = LockRetryPolicy {
        attempts: 0,
        delay_ms: 0,
    };

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay_ms: 500,
        }
    }
}

pub async fn acquire_with_retry(
    locks: &dyn LockManager,
    key: &str,
    ttl: Duration,
    policy: LockRetryPolicy,
) -> Result<Option<LockLease>, LockError> {
    let mut attempt = 0u32;
    loop {
        if let Some(lease) = locks.try_acquire(key, ttl).await? {
            return Ok(Some(lease));
        }
        if attempt >= policy.attempts {
            return Ok(None);
        }
        attempt += 1;
        debug!(
            lock.key = key,
            attempt,
            max_attempts = policy.attempts + 1,
            "lock busy, retrying"
        );
        tokio::time::sleep(policy.delay()).await;
    }
}

/// Key layout for monitor and per-item locks.
#[derive(Clone, Debug)]
pub struct LockKeys {
    prefix: String,
}

impl LockKeys {
    pub const DEFAULT_PREFIX: &'static str = "locks:auto_book";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn global(&self) -> String {
        format!("{}_monitor", self.prefix)
    }

    pub fn item(&self, id: &WorkItemId) -> String {
        format!("{}:item:{id}", self.prefix)
    }
}

impl Default for LockKeys {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}
