// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use crate::entity::{EntityWrapper, SessionEntity};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Loader result meaning "never expires".
pub const IMMORTAL: i64 = -1;
/// Loader result meaning "already expired, remove it".
pub const ENTRY_EXPIRED: i64 = -2;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Operation not supported by {0}")]
    Unsupported(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Lifespan and max-idle for a write, in milliseconds.
///
/// Negative values mean "no limit" for that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub lifespan_ms: i64,
    pub max_idle_ms: i64,
}

impl Expiry {
    pub const NONE: Expiry = Expiry { lifespan_ms: IMMORTAL, max_idle_ms: IMMORTAL };

    pub fn new(lifespan_ms: i64, max_idle_ms: i64) -> Self {
        Self { lifespan_ms, max_idle_ms }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.lifespan_ms == ENTRY_EXPIRED || self.max_idle_ms == ENTRY_EXPIRED
    }

    /// Single TTL for backends that only know one expiry (Redis PX, SQL column).
    /// The shorter of the two positive limits wins.
    #[must_use]
    pub fn ttl_ms(&self) -> Option<u64> {
        [self.lifespan_ms, self.max_idle_ms]
            .into_iter()
            .filter(|ms| *ms > 0)
            .min()
            .map(|ms| ms as u64)
    }
}

type EntityPredicate = Arc<dyn Fn(&str, &SessionEntity) -> bool + Send + Sync>;

/// Predicate selecting entities for a bulk delete.
///
/// The structured fields can be pushed down to a backend (SQL `WHERE`);
/// the optional closure is always evaluated in process.
#[derive(Clone, Default)]
pub struct BulkDeleteFilter {
    pub realm_id: Option<String>,
    pub user_id: Option<String>,
    pub offline: Option<bool>,
    custom: Option<EntityPredicate>,
}

impl BulkDeleteFilter {
    /// Every session of a realm.
    pub fn realm(realm_id: impl Into<String>) -> Self {
        Self {
            realm_id: Some(realm_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn and_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn and_offline(mut self, offline: bool) -> Self {
        self.offline = Some(offline);
        self
    }

    #[must_use]
    pub fn and_matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &SessionEntity) -> bool + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(predicate));
        self
    }

    /// True if only structured fields are set.
    #[must_use]
    pub fn is_structured(&self) -> bool {
        self.custom.is_none()
    }

    pub fn matches(&self, key: &str, entity: &SessionEntity) -> bool {
        if let Some(realm) = &self.realm_id {
            if &entity.realm_id != realm {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if entity.user_id.as_ref() != Some(user) {
                return false;
            }
        }
        if let Some(offline) = self.offline {
            if entity.offline != offline {
                return false;
            }
        }
        self.custom.as_ref().map_or(true, |f| f(key, entity))
    }
}

impl fmt::Debug for BulkDeleteFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkDeleteFilter")
            .field("realm_id", &self.realm_id)
            .field("user_id", &self.user_id)
            .field("offline", &self.offline)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// Mutation published by a store that exposes a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Upserted { key: String, wrapper: EntityWrapper },
    Removed { key: String },
}

/// Backend contract every session store implements.
///
/// Writes are conditional where the changelog needs them to be:
/// `put_if_absent` is the create race, `replace` carries the version read
/// at fetch time and fails instead of overwriting a newer value.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Short name used in logs, metrics and errors.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<EntityWrapper>, StorageError>;

    /// Returns false if the key already exists.
    async fn put_if_absent(
        &self,
        key: &str,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError>;

    /// Returns false if the key is missing or its version is not `expected_version`.
    async fn replace(
        &self,
        key: &str,
        expected_version: u64,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError>;

    /// Unconditional write.
    async fn put(&self, key: &str, wrapper: &EntityWrapper, expiry: Expiry) -> Result<(), StorageError>;

    /// Returns false if nothing was there.
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove every entry matching `filter`, returning how many went.
    async fn remove_matching(&self, filter: &BulkDeleteFilter) -> Result<u64, StorageError>;
}

/// Stores that publish their mutations.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
