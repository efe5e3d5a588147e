// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis session store, the shared clustered cache.
//!
//! Each entry is one STRING key holding the JSON-encoded wrapper:
//!
//! ```json
//! {"entity": {"id": "s1", "realm_id": "r", ...}, "version": 3}
//! ```
//!
//! Conditional writes map onto Redis primitives:
//! - `put_if_absent` is `SET NX`
//! - `replace` is a Lua script comparing the stored `version` before `SET`
//!
//! Redis has no idle expiry, so an entry gets a `PX` of whichever of
//! lifespan and max-idle is shorter. Every write refreshes it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};
use crate::entity::EntityWrapper;
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{BulkDeleteFilter, Expiry, SessionStore, StorageError};
use tracing::debug;

/// Replace only if the stored version matches ARGV[1].
const REPLACE_IF_VERSION: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local ok, doc = pcall(cjson.decode, current)
if not ok or tonumber(doc['version']) ~= tonumber(ARGV[1]) then
    return 0
end
if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

const SCAN_BATCH: usize = 500;

pub struct RedisStore {
    name: String,
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "sessions:" → "sessions:abc123")
    prefix: String,
    replace_script: Script,
}

impl RedisStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect, prepending `prefix` to every key.
    ///
    /// Online and offline sessions sharing one Redis need distinct prefixes.
    ///
    /// ```rust,no_run
    /// # use session_changelog::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let online = RedisStore::with_prefix("redis://localhost", Some("sessions:")).await?;
    /// let offline = RedisStore::with_prefix("redis://localhost", Some("offline:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Use startup config: fast-fail, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        let prefix = prefix.unwrap_or("").to_string();
        Ok(Self {
            name: if prefix.is_empty() { "redis".to_string() } else { format!("redis:{}", prefix) },
            connection,
            prefix,
            replace_script: Script::new(REPLACE_IF_VERSION),
        })
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix).unwrap_or(key)
    }

    /// Shared with the preload lock.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn ttl_arg(expiry: Expiry) -> u64 {
        expiry.ttl_ms().unwrap_or(0)
    }

    async fn scan_page(&self, cursor: u64) -> Result<(u64, Vec<String>), StorageError> {
        let pattern = format!("{}*", self.prefix);
        let conn = self.connection.clone();
        retry("redis_scan", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let pattern = pattern.clone();
            async move {
                let page: (u64, Vec<String>) = cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                Ok(page)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<EntityWrapper>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let data: Option<Vec<u8>> = retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        data.map(|bytes| EntityWrapper::decode(&bytes)).transpose()
    }

    async fn put_if_absent(
        &self,
        key: &str,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let data = wrapper.encode()?;
        let ttl = Self::ttl_arg(expiry);

        let reply: Option<String> = retry("redis_set_nx", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let data = data.clone();
            async move {
                let mut set = cmd("SET");
                set.arg(&key).arg(&data).arg("NX");
                if ttl > 0 {
                    set.arg("PX").arg(ttl);
                }
                let reply: Option<String> = set.query_async(&mut conn).await?;
                Ok(reply)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(reply.is_some())
    }

    async fn replace(
        &self,
        key: &str,
        expected_version: u64,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let data = wrapper.encode()?;
        let ttl = Self::ttl_arg(expiry);

        let replaced: i32 = retry("redis_replace", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let mut invocation = self.replace_script.key(&prefixed);
            invocation.arg(expected_version).arg(&data).arg(ttl);
            async move { invocation.invoke_async(&mut conn).await }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(replaced == 1)
    }

    async fn put(&self, key: &str, wrapper: &EntityWrapper, expiry: Expiry) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);
        let data = wrapper.encode()?;
        let ttl = Self::ttl_arg(expiry);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let data = data.clone();
            async move {
                if ttl > 0 {
                    let _: () = conn.pset_ex(&key, &data, ttl).await?;
                } else {
                    let _: () = conn.set(&key, &data).await?;
                }
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let removed: u64 = retry("redis_del", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let n: u64 = conn.del(&key).await?;
                Ok(n)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(removed > 0)
    }

    /// SCAN the prefix and evaluate the filter on each decoded entry.
    async fn remove_matching(&self, filter: &BulkDeleteFilter) -> Result<u64, StorageError> {
        let mut cursor = 0u64;
        let mut removed = 0u64;
        loop {
            let (next, keys) = self.scan_page(cursor).await?;
            for prefixed in keys {
                let key = self.strip_prefix(&prefixed).to_string();
                let Some(wrapper) = self.get(&key).await? else {
                    continue;
                };
                if filter.matches(&key, &wrapper.entity) && self.remove(&key).await? {
                    removed += 1;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(store = %self.name, removed, ?filter, "Bulk delete by scan");
        Ok(removed)
    }
}
