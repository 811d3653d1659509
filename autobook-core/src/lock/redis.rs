use std::fmt;
use std::time::Duration;

use ::redis::Script;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{LockLease, LockManager};
use crate::error::LockError;

/// Redis scripts for owner-checked lock maintenance
mod scripts {
    use ::redis::Script;

    /// Delete the key only when it still holds the caller's token
    pub fn compare_and_delete() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        )
    }

    /// Reset the expiry only when the key still holds the caller's token
    pub fn compare_and_expire() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            else
                return 0
            end
            "#,
        )
    }
}

/// Redis-backed lock store using `SET key token NX PX ttl`.
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
    release_script: Script,
    extend_script: Script,
}

impl fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisLockManager {
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        info!("Connecting to Redis lock store");

        let client = ::redis::Client::open(redis_url).map_err(|e| {
            LockError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Unavailable(format!("Failed to connect to Redis: {e}"))
        })?;

        info!("Successfully connected to Redis lock store");

        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: scripts::compare_and_delete(),
            extend_script: scripts::compare_and_expire(),
        }
    }

    /// Remaining TTL of `key`, `None` when it does not exist.
    pub async fn remaining_ttl(
        &self,
        key: &str,
    ) -> Result<Option<Duration>, LockError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        // -2: missing key, -1: no expiry (never set by this manager)
        Ok(match pttl {
            ms if ms >= 0 => Some(Duration::from_millis(ms as u64)),
            -1 => Some(Duration::MAX),
            _ => None,
        })
    }
}

/// TTL as a `PX` argument. Redis rejects 0 and anything past `i64`.
fn ttl_millis(ttl: Duration) -> Result<i64, LockError> {
    i64::try_from(ttl.as_millis())
        .map(|ms| ms.max(1))
        .map_err(|_| LockError::InvalidTtl(ttl))
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        let ttl_ms = ttl_millis(ttl)?;
        let lease = LockLease::generate(key, ttl);
        let mut conn = self.conn.clone();

        // Replies "OK" when set, nil when the key already exists
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(lease.token())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        match reply.as_deref() {
            Some("OK") => {
                debug!(lock.key = key, ttl_ms, "lock acquired");
                Ok(Some(lease))
            }
            None => {
                debug!(lock.key = key, "lock held elsewhere");
                Ok(None)
            }
            Some(other) => Err(LockError::Protocol(format!(
                "SET NX replied {other:?} for {key}"
            ))),
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(lease.key())
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            debug!(lock.key = lease.key(), "lock released");
        } else {
            warn!(
                lock.key = lease.key(),
                "lock already expired or owned by another holder"
            );
        }
        Ok(())
    }

    async fn extend(
        &self,
        lease: &LockLease,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(lease.key())
            .arg(lease.token())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }
}
