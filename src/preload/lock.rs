// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster-wide single-writer lock for the durable-store scan.
//!
//! A lock is a named lease: the holder's owner id plus an expiry. A node
//! that dies while holding it blocks nobody past the lease.

use async_trait::async_trait;
use crate::error::{ChangelogError, Result};
use crate::resilience::retry::RetryConfig;
use crate::storage::StorageError;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{cmd, Script};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Take `lock` for `owner` unless someone else holds an unexpired lease.
    /// Re-acquiring a lock already held by `owner` extends the lease.
    async fn try_acquire(&self, lock: &str, owner: &str, lease: Duration) -> std::result::Result<bool, StorageError>;

    /// Returns false if `owner` did not hold the lock.
    async fn release(&self, lock: &str, owner: &str) -> std::result::Result<bool, StorageError>;
}

/// Poll `try_acquire` with backoff until `wait` runs out.
pub async fn acquire_with_timeout(
    locks: &dyn ClusterLock,
    lock: &str,
    owner: &str,
    lease: Duration,
    wait: Duration,
) -> Result<()> {
    let poll = RetryConfig::lock_poll();
    let started = Instant::now();
    let mut delay = poll.initial_delay;

    loop {
        match locks.try_acquire(lock, owner, lease).await {
            Ok(true) => {
                info!(lock, owner, waited = ?started.elapsed(), "Cluster lock acquired");
                crate::metrics::record_lock_attempt(lock, "acquired");
                return Ok(());
            }
            Ok(false) => debug!(lock, "Cluster lock busy"),
            Err(e) => warn!(lock, error = %e, "Cluster lock backend error"),
        }

        let waited = started.elapsed();
        if waited >= wait {
            crate::metrics::record_lock_attempt(lock, "timeout");
            return Err(ChangelogError::LockTimeout {
                lock: lock.to_string(),
                waited,
            });
        }
        tokio::time::sleep(delay.min(wait - waited)).await;
        delay = poll.next_delay(delay);
    }
}

/// Single-process lock, for one-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, lock: &str) -> Option<String> {
        let leases = self.leases.lock();
        leases
            .get(lock)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl ClusterLock for InMemoryLock {
    async fn try_acquire(&self, lock: &str, owner: &str, lease: Duration) -> std::result::Result<bool, StorageError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some((holder, expires)) = leases.get(lock) {
            if *expires > now && holder != owner {
                return Ok(false);
            }
        }
        leases.insert(lock.to_string(), (owner.to_string(), now + lease));
        Ok(true)
    }

    async fn release(&self, lock: &str, owner: &str) -> std::result::Result<bool, StorageError> {
        let mut leases = self.leases.lock();
        match leases.get(lock) {
            Some((holder, _)) if holder == owner => {
                leases.remove(lock);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Lease in Redis: `SET NX PX` to take it, owner-checked scripts to extend or drop it.
pub struct RedisLock {
    connection: ConnectionManager,
    prefix: String,
    release_script: Script,
    extend_script: Script,
}

impl RedisLock {
    pub fn new(connection: ConnectionManager) -> Self {
        Self::with_prefix(connection, "lock:")
    }

    pub fn with_prefix(connection: ConnectionManager, prefix: &str) -> Self {
        Self {
            connection,
            prefix: prefix.to_string(),
            release_script: Script::new(RELEASE_IF_OWNER),
            extend_script: Script::new(EXTEND_IF_OWNER),
        }
    }

    fn key(&self, lock: &str) -> String {
        format!("{}{}", self.prefix, lock)
    }
}

#[async_trait]
impl ClusterLock for RedisLock {
    async fn try_acquire(&self, lock: &str, owner: &str, lease: Duration) -> std::result::Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let key = self.key(lock);
        let lease_ms = lease.as_millis().max(1) as u64;

        let taken: Option<String> = cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;
        if taken.is_some() {
            return Ok(true);
        }

        let extended: i32 = self
            .extend_script
            .key(&key)
            .arg(owner)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;
        Ok(extended == 1)
    }

    async fn release(&self, lock: &str, owner: &str) -> std::result::Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let released: i32 = self
            .release_script
            .key(self.key(lock))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;
        Ok(released == 1)
    }
}
