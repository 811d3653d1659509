use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LockLease, LockManager};
use crate::error::LockError;

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

fn expiry(now: Instant, ttl: Duration) -> Result<Instant, LockError> {
    now.checked_add(ttl).ok_or(LockError::InvalidTtl(ttl))
}

/// Single-process lock store with the same set-if-absent, owner-checked
/// contract as the Redis implementation. Expired entries behave as absent.
#[derive(Default)]
pub struct InMemoryLockManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl fmt::Debug for InMemoryLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryLockManager")
            .field("entries", &held)
            .finish()
    }
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently has a live holder.
    pub async fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Keys with a live holder, sorted.
    pub async fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(None);
        }

        let expires_at = expiry(now, ttl)?;
        let lease = LockLease::generate(key, ttl);
        entries.insert(
            key.to_string(),
            Entry {
                token: lease.token().to_string(),
                expires_at,
            },
        );
        Ok(Some(lease))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut entries = self.entries.lock().await;
        if entries
            .get(lease.key())
            .is_some_and(|entry| entry.token == lease.token())
        {
            entries.remove(lease.key());
        }
        Ok(())
    }

    async fn extend(
        &self,
        lease: &LockLease,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(lease.key()) {
            Some(entry) if entry.token == lease.token() && entry.is_live(now) => {
                entry.expires_at = expiry(now, ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
