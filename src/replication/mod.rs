// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-datacenter replication.
//!
//! Every merged update carries a [`CrossDcStatus`]. The [`ReplicationPolicy`]
//! looks the target cache up in a [`ReplicaRegistry`] (built once, shared by
//! reference) and writes the value:
//!
//! - `Sync`: awaited before the commit returns
//! - `Async`: spawned, the commit does not wait
//! - `NotNeeded`: skipped
//!
//! Failures are logged and counted, never returned: the local commit has
//! already succeeded and the replica is eventually consistent.

pub mod listener;
pub mod watermark;

pub use listener::ReplicaListener;
pub use watermark::LastRefreshTracker;

use crate::error::ChangelogError;
use crate::merge::MergedUpdate;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::storage::{BulkDeleteFilter, Expiry, SessionStore, StorageError};
use crate::task::CacheOperation;
use crate::entity::EntityWrapper;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// How urgently a change must reach the replica. Ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CrossDcStatus {
    NotNeeded,
    Async,
    Sync,
}

impl CrossDcStatus {
    /// The more urgent of the two.
    #[must_use]
    pub fn merge(self, other: CrossDcStatus) -> CrossDcStatus {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotNeeded => "not_needed",
            Self::Async => "async",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for CrossDcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `realm -> max idle ms` for entries written to a replica.
pub type MaxIdleLoader = Arc<dyn Fn(&str) -> i64 + Send + Sync>;

/// One registered replica cache.
pub struct RemoteCache {
    name: String,
    store: Arc<dyn SessionStore>,
    max_idle: MaxIdleLoader,
    circuit: CircuitBreaker,
}

impl RemoteCache {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }
}

/// `cache name -> replica handle`. Built at startup, then read-only.
///
/// Also owns the refresh watermarks for its replicas, so every policy
/// built from one registry and every refresh task staged against it see
/// the same [`LastRefreshTracker`].
#[derive(Default)]
pub struct ReplicaRegistry {
    caches: HashMap<String, Arc<RemoteCache>>,
    tracker: Arc<LastRefreshTracker>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register<F>(self, name: impl Into<String>, store: Arc<dyn SessionStore>, max_idle: F) -> Self
    where
        F: Fn(&str) -> i64 + Send + Sync + 'static,
    {
        self.register_with_circuit(name, store, max_idle, CircuitConfig::replica())
    }

    #[must_use]
    pub fn register_with_circuit<F>(
        mut self,
        name: impl Into<String>,
        store: Arc<dyn SessionStore>,
        max_idle: F,
        circuit: CircuitConfig,
    ) -> Self
    where
        F: Fn(&str) -> i64 + Send + Sync + 'static,
    {
        let max_idle: MaxIdleLoader = Arc::new(max_idle);
        let name = name.into();
        let cache = RemoteCache {
            circuit: CircuitBreaker::new(name.clone(), circuit),
            name: name.clone(),
            store,
            max_idle,
        };
        self.caches.insert(name, Arc::new(cache));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<RemoteCache>> {
        self.caches.get(name).cloned()
    }

    pub fn tracker(&self) -> &Arc<LastRefreshTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

/// What happened to one replication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Sync write completed
    Written,
    /// Async write spawned
    Dispatched,
    /// Not needed, or no replica registered under that name
    Skipped,
    /// Sync write failed (already logged)
    Failed,
}

#[derive(Clone)]
pub struct ReplicationPolicy {
    registry: Arc<ReplicaRegistry>,
    tracker: Arc<LastRefreshTracker>,
    idle_pad_ms: i64,
    replace_attempts: u32,
}

impl ReplicationPolicy {
    /// Records propagated refreshes in the registry's tracker.
    pub fn new(registry: Arc<ReplicaRegistry>) -> Self {
        Self {
            tracker: Arc::clone(registry.tracker()),
            registry,
            idle_pad_ms: 1_800_000,
            replace_attempts: 10,
        }
    }

    /// Record propagated refreshes somewhere other than the registry's tracker.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<LastRefreshTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    #[must_use]
    pub fn with_idle_pad_ms(mut self, pad: i64) -> Self {
        self.idle_pad_ms = pad;
        self
    }

    #[must_use]
    pub fn with_replace_attempts(mut self, attempts: u32) -> Self {
        self.replace_attempts = attempts.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<LastRefreshTracker> {
        &self.tracker
    }

    /// Send `update` to the replica registered as `cache_name`, stored
    /// under `key`.
    #[tracing::instrument(skip(self, update), fields(status = %update.cross_dc))]
    pub async fn replicate(&self, cache_name: &str, key: &str, update: &MergedUpdate) -> ReplicationOutcome {
        let Some(remote) = self.registry.get(cache_name) else {
            debug!(cache = cache_name, "No replica registered");
            return ReplicationOutcome::Skipped;
        };

        match update.cross_dc {
            CrossDcStatus::NotNeeded => {
                crate::metrics::record_replication(cache_name, "not_needed", "skipped");
                ReplicationOutcome::Skipped
            }
            CrossDcStatus::Sync => {
                if self.write_logged(&remote, key, update).await {
                    ReplicationOutcome::Written
                } else {
                    ReplicationOutcome::Failed
                }
            }
            CrossDcStatus::Async => {
                let policy = self.clone();
                let key = key.to_string();
                let update = update.clone();
                tokio::spawn(async move {
                    policy.write_logged(&remote, &key, &update).await;
                });
                ReplicationOutcome::Dispatched
            }
        }
    }

    /// Apply a bulk delete to the replica, best-effort and in the background.
    pub fn replicate_bulk_delete(&self, cache_name: &str, filter: &BulkDeleteFilter) {
        let Some(remote) = self.registry.get(cache_name) else {
            return;
        };
        let filter = filter.clone();
        tokio::spawn(async move {
            let result = remote
                .circuit
                .call(|| remote.store.remove_matching(&filter))
                .await;
            match result {
                Ok(n) => debug!(cache = %remote.name, removed = n, "Replica bulk delete applied"),
                Err(e) => warn!(cache = %remote.name, error = %e, "Replica bulk delete failed"),
            }
        });
    }

    async fn write_logged(&self, remote: &RemoteCache, key: &str, update: &MergedUpdate) -> bool {
        let status = update.cross_dc.as_str();
        match self.write(remote, key, update).await {
            Ok(()) => {
                crate::metrics::record_replication(&remote.name, status, "written");
                let id = &update.value.entity.id;
                match update.operation {
                    CacheOperation::Remove => self.tracker.forget(id),
                    _ => self.tracker.record_propagated(id, update.value.entity.last_session_refresh),
                }
                true
            }
            Err(e) => {
                crate::metrics::record_replication(&remote.name, status, "failed");
                warn!(
                    cache = %remote.name,
                    key,
                    error = %e,
                    "Replica write failed; local commit stands"
                );
                false
            }
        }
    }

    async fn write(&self, remote: &RemoteCache, key: &str, update: &MergedUpdate) -> Result<(), ChangelogError> {
        let loaded_idle = (remote.max_idle)(&update.realm);
        // Padded so postponed refreshes don't let the replica expire first
        let max_idle = if loaded_idle > 0 { loaded_idle + self.idle_pad_ms } else { loaded_idle };
        let expiry = Expiry::new(update.expiry.lifespan_ms, max_idle);

        remote
            .circuit
            .call(|| self.write_op(remote, key, update, expiry))
            .await
            .map_err(|e| match e {
                CircuitError::Rejected => ChangelogError::ReplicationFailed {
                    cache: remote.name.clone(),
                    message: "circuit open".to_string(),
                },
                CircuitError::Inner(e) => e,
            })
    }

    async fn write_op(
        &self,
        remote: &RemoteCache,
        key: &str,
        update: &MergedUpdate,
        expiry: Expiry,
    ) -> Result<(), ChangelogError> {
        let store = &remote.store;
        let failed = |e: StorageError| ChangelogError::ReplicationFailed {
            cache: remote.name.clone(),
            message: e.to_string(),
        };

        match update.operation {
            CacheOperation::None => Ok(()),
            CacheOperation::Remove => {
                store.remove(key).await.map_err(failed)?;
                Ok(())
            }
            CacheOperation::Add => {
                if !store.put_if_absent(key, &update.value, expiry).await.map_err(failed)? {
                    debug!(cache = %remote.name, key, "Entry already existed on replica");
                }
                Ok(())
            }
            CacheOperation::Replace => {
                // Replica versions are independent of ours: rebase on whatever it holds
                for attempt in 1..=self.replace_attempts {
                    match store.get(key).await.map_err(failed)? {
                        None => {
                            if store.put_if_absent(key, &update.value, expiry).await.map_err(failed)? {
                                return Ok(());
                            }
                        }
                        Some(current) => {
                            let next = EntityWrapper::with_version(
                                update.value.entity.clone(),
                                current.version + 1,
                            );
                            if store.replace(key, current.version, &next, expiry).await.map_err(failed)? {
                                return Ok(());
                            }
                        }
                    }
                    debug!(cache = %remote.name, key, attempt, "Replica replace raced, retrying");
                }
                Err(ChangelogError::ReplicationFailed {
                    cache: remote.name.clone(),
                    message: format!("replace lost {} version races", self.replace_attempts),
                })
            }
        }
    }
}
