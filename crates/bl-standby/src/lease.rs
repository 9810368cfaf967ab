//! Lease backends for leader election.
//!
//! A lease is a key holding the holder's id with a TTL. Acquire succeeds only
//! when the key is absent; extend and release succeed only for the holder.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use crate::error::{Result, StandbyError};

#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Take the lease if nobody holds it.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Push the expiry to `now + ttl` if `holder` still owns the lease.
    async fn extend(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lease if `holder` still owns it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool>;
}

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis lease: `SET NX PX` to acquire, Lua check-and-set to extend and release.
#[derive(Clone)]
pub struct RedisLease {
    conn: ConnectionManager,
}

impl RedisLease {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LeaseBackend for RedisLease {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn extend(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(holder)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;

        Ok(result == 1)
    }
}

/// In-process lease for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryLease {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder of `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone())
    }
}

#[async_trait]
impl LeaseBackend for MemoryLease {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some((_, expires)) = leases.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        leases.insert(key.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn extend(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some((current, expires)) if current == holder && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|(current, _)| current == holder) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
