// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write targets for committed changes.
//!
//! A commit builds a fresh, ordered list of [`ChangesSink`]s from the
//! [`SinkTopology`], registers every merged update with the sinks that
//! accept it, then asks each sink to apply what it buffered.
//!
//! ```text
//!                    commit()
//!                       │
//!        ┌──────────────┼────────────────┐
//!        ▼              ▼                ▼
//!   StoreSink      StoreSink        ReplicaSink
//!   (primary,      (mirror,         (cross-DC,
//!    versioned)     upsert)          best-effort)
//! ```
//!
//! Deployment variants differ only in which sinks the topology builds:
//! local map only, clustered cache + local map + replica, or relational
//! store only. The changelog itself never branches on deployment.

pub mod deferred;
pub mod replica_sink;
pub mod store_sink;

pub use deferred::{DeferredChange, DeferredConsumer, DeferredQueue, DeferredStats};
pub use replica_sink::ReplicaSink;
pub use store_sink::{StoreSink, WriteMode};

use async_trait::async_trait;
use crate::entity::SessionEntity;
use crate::error::Result;
use crate::merge::MergedUpdate;
use crate::replication::{LastRefreshTracker, ReplicationPolicy};
use crate::storage::{BulkDeleteFilter, SessionStore};
use std::sync::Arc;

/// One write target for the duration of one commit (or one deferred batch).
#[async_trait]
pub trait ChangesSink: Send {
    fn name(&self) -> &str;

    /// Failures of a best-effort sink are logged, not returned from commit.
    fn is_best_effort(&self) -> bool {
        false
    }

    fn should_consume_change(&self, entity: &SessionEntity) -> bool;

    fn register_change(&mut self, key: &str, update: &MergedUpdate);

    fn register_bulk_delete(&mut self, filter: &BulkDeleteFilter);

    /// Apply everything registered, in registration order.
    /// Returns the number of changes applied.
    async fn apply_changes(&mut self) -> Result<usize>;
}

/// Which cache pair a sink serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFilter {
    All,
    OnlineOnly,
    OfflineOnly,
}

impl SinkFilter {
    pub fn accepts(&self, entity: &SessionEntity) -> bool {
        match self {
            Self::All => true,
            Self::OnlineOnly => !entity.offline,
            Self::OfflineOnly => entity.offline,
        }
    }

    /// A bulk delete concerns this sink unless it explicitly targets the other pair.
    pub fn accepts_bulk(&self, filter: &BulkDeleteFilter) -> bool {
        match (self, filter.offline) {
            (Self::All, _) | (_, None) => true,
            (Self::OnlineOnly, Some(offline)) => !offline,
            (Self::OfflineOnly, Some(offline)) => offline,
        }
    }
}

/// Ordered change before it is applied.
#[derive(Debug, Clone)]
pub(crate) enum PendingChange {
    Write { key: String, update: MergedUpdate },
    BulkDelete(BulkDeleteFilter),
}

pub type SinkFactory = Arc<dyn Fn() -> Box<dyn ChangesSink> + Send + Sync>;

type StorePair = (Arc<dyn SessionStore>, Arc<dyn SessionStore>);

/// The deployment: where reads come from and which sinks a commit writes.
pub struct SinkTopology {
    online: Arc<dyn SessionStore>,
    offline: Arc<dyn SessionStore>,
    /// Durable pair consulted on a read-source miss
    fallback: Option<StorePair>,
    factories: Vec<SinkFactory>,
    tracker: Arc<LastRefreshTracker>,
}

impl SinkTopology {
    /// Reads and versioned writes go to this online/offline pair.
    pub fn new(online: Arc<dyn SessionStore>, offline: Arc<dyn SessionStore>) -> Self {
        let topology = Self {
            online: Arc::clone(&online),
            offline: Arc::clone(&offline),
            fallback: None,
            factories: Vec::new(),
            tracker: Arc::new(LastRefreshTracker::new()),
        };
        topology
            .with_store(online, SinkFilter::OnlineOnly, WriteMode::Versioned)
            .with_store(offline, SinkFilter::OfflineOnly, WriteMode::Versioned)
    }

    /// Local in-process map only.
    pub fn local_only(online: Arc<dyn SessionStore>, offline: Arc<dyn SessionStore>) -> Self {
        Self::new(online, offline)
    }

    /// Relational store only, no cache in front of it.
    pub fn relational_only(online: Arc<dyn SessionStore>, offline: Arc<dyn SessionStore>) -> Self {
        Self::new(online, offline)
    }

    /// Clustered cache as the source of truth, a local map mirroring it,
    /// and the cross-DC replica behind `policy`.
    pub fn clustered(
        clustered: (Arc<dyn SessionStore>, Arc<dyn SessionStore>),
        local: (Arc<dyn SessionStore>, Arc<dyn SessionStore>),
        policy: ReplicationPolicy,
        replica_caches: (&str, &str),
    ) -> Self {
        Self::new(clustered.0, clustered.1)
            .with_mirror(local.0, local.1)
            .with_replica(policy, replica_caches.0, replica_caches.1)
    }

    /// Unconditionally mirror every write into another store pair.
    #[must_use]
    pub fn with_mirror(self, online: Arc<dyn SessionStore>, offline: Arc<dyn SessionStore>) -> Self {
        self.with_store(online, SinkFilter::OnlineOnly, WriteMode::Upsert)
            .with_store(offline, SinkFilter::OfflineOnly, WriteMode::Upsert)
    }

    #[must_use]
    pub fn with_store(self, store: Arc<dyn SessionStore>, filter: SinkFilter, mode: WriteMode) -> Self {
        self.with_sink(move || Box::new(StoreSink::new(Arc::clone(&store), filter, mode)))
    }

    /// Fill read-source misses from this pair, for caches that a preload
    /// may not have warmed completely.
    #[must_use]
    pub fn with_fallback(mut self, online: Arc<dyn SessionStore>, offline: Arc<dyn SessionStore>) -> Self {
        self.fallback = Some((online, offline));
        self
    }

    /// Refresh tasks staged against this topology must share the replica
    /// policy's tracker, or every refresh looks like the first.
    #[must_use]
    pub fn with_replica(mut self, policy: ReplicationPolicy, online_cache: &str, offline_cache: &str) -> Self {
        self.tracker = Arc::clone(policy.tracker());
        let online_policy = policy.clone();
        let online_cache = online_cache.to_string();
        let offline_cache = offline_cache.to_string();
        self.with_sink(move || {
            Box::new(ReplicaSink::new(online_policy.clone(), online_cache.clone(), SinkFilter::OnlineOnly))
        })
        .with_sink(move || {
            Box::new(ReplicaSink::new(policy.clone(), offline_cache.clone(), SinkFilter::OfflineOnly))
        })
    }

    #[must_use]
    pub fn with_sink<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ChangesSink> + Send + Sync + 'static,
    {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn read_source(&self, offline: bool) -> &Arc<dyn SessionStore> {
        if offline {
            &self.offline
        } else {
            &self.online
        }
    }

    pub fn fallback(&self, offline: bool) -> Option<&Arc<dyn SessionStore>> {
        self.fallback
            .as_ref()
            .map(|(online, offline_store)| if offline { offline_store } else { online })
    }

    /// Watermarks of refreshes the replica has already seen.
    pub fn refresh_tracker(&self) -> &Arc<LastRefreshTracker> {
        &self.tracker
    }

    /// Fresh sinks for one commit, in write order.
    pub fn build_sinks(&self) -> Vec<Box<dyn ChangesSink>> {
        self.factories.iter().map(|factory| factory()).collect()
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.factories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicaRegistry;
    use crate::storage::memory::InMemoryStore;

    fn pair(prefix: &str) -> (Arc<dyn SessionStore>, Arc<dyn SessionStore>) {
        (
            Arc::new(InMemoryStore::named(format!("{}-online", prefix))),
            Arc::new(InMemoryStore::named(format!("{}-offline", prefix))),
        )
    }

    #[test]
    fn test_filter_routing() {
        let online = SessionEntity::new("s", "r");
        let offline = SessionEntity::new("s", "r").offline(true);

        assert!(SinkFilter::OnlineOnly.accepts(&online));
        assert!(!SinkFilter::OnlineOnly.accepts(&offline));
        assert!(SinkFilter::OfflineOnly.accepts(&offline));
        assert!(SinkFilter::All.accepts(&offline));
    }

    #[test]
    fn test_bulk_filter_routing() {
        let any = BulkDeleteFilter::realm("r");
        let offline_only = BulkDeleteFilter::realm("r").and_offline(true);

        assert!(SinkFilter::OnlineOnly.accepts_bulk(&any));
        assert!(!SinkFilter::OnlineOnly.accepts_bulk(&offline_only));
        assert!(SinkFilter::OfflineOnly.accepts_bulk(&offline_only));
    }

    #[test]
    fn test_local_only_builds_matched_pair() {
        let (on, off) = pair("local");
        let topology = SinkTopology::local_only(on, off);
        let sinks = topology.build_sinks();

        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].name(), "local-online");
        assert_eq!(sinks[1].name(), "local-offline");
        assert_eq!(topology.read_source(true).name(), "local-offline");
    }

    #[test]
    fn test_clustered_topology_order() {
        let registry = Arc::new(ReplicaRegistry::new());
        let topology = SinkTopology::clustered(
            pair("cluster"),
            pair("local"),
            ReplicationPolicy::new(registry),
            ("sessions", "offlineSessions"),
        );
        let names: Vec<String> = topology.build_sinks().iter().map(|s| s.name().to_string()).collect();

        assert_eq!(
            names,
            vec![
                "cluster-online",
                "cluster-offline",
                "local-online",
                "local-offline",
                "sessions",
                "offlineSessions"
            ]
        );
        assert_eq!(topology.read_source(false).name(), "cluster-online");
    }

    #[test]
    fn test_clustered_topology_shares_replica_tracker() {
        let registry = Arc::new(ReplicaRegistry::new());
        let topology = SinkTopology::clustered(
            pair("cluster"),
            pair("local"),
            ReplicationPolicy::new(Arc::clone(&registry)),
            ("sessions", "offlineSessions"),
        );
        assert!(Arc::ptr_eq(topology.refresh_tracker(), registry.tracker()));
    }

    #[test]
    fn test_fallback_routes_by_pair() {
        let (on, off) = pair("cache");
        let (durable_on, durable_off) = pair("durable");
        let topology = SinkTopology::new(on, off);
        assert!(topology.fallback(false).is_none());

        let topology = topology.with_fallback(durable_on, durable_off);
        assert_eq!(topology.fallback(false).map(|s| s.name()), Some("durable-online"));
        assert_eq!(topology.fallback(true).map(|s| s.name()), Some("durable-offline"));
        assert_eq!(topology.sink_count(), 2);
    }

    #[test]
    fn test_build_sinks_returns_fresh_buffers() {
        let (on, off) = pair("local");
        let topology = SinkTopology::local_only(on, off);
        let first = topology.build_sinks();
        let second = topology.build_sinks();
        assert_eq!(first.len(), second.len());
    }
}
