// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: connect, start, preload, shutdown.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ChangelogConfig;
use crate::error::Result;
use crate::merge::ExpirationLoaders;
use crate::preload::{ClusterLock, PreloadJob, PreloadOutcome, Preloader, RedisLock};
use crate::sink::{DeferredConsumer, DeferredQueue, DeferredStats, SinkFilter, SinkTopology, WriteMode};
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::sql::SqlStore;
use crate::storage::SessionStore;

use super::{ChangelogEngine, EngineState};

type StorePair = (Arc<dyn SessionStore>, Arc<dyn SessionStore>);

impl ChangelogEngine {
    /// Connect to the configured backends and build the matching topology.
    ///
    /// | redis | sql | deployment |
    /// |-------|-----|------------|
    /// | no  | no  | local map only |
    /// | no  | yes | relational store only |
    /// | yes | no  | clustered cache, local map mirror |
    /// | yes | yes | clustered cache, local map and SQL mirrors, SQL preloads the cache and fills its misses |
    ///
    /// Add a cross-DC replica by building the topology yourself and calling
    /// [`ChangelogEngine::new`].
    pub async fn connect(config: ChangelogConfig) -> Result<Self> {
        Self::connect_with(config, ExpirationLoaders::immortal()).await
    }

    #[tracing::instrument(skip_all, fields(has_redis = config.redis_url.is_some(), has_sql = config.sql_url.is_some()))]
    pub async fn connect_with(config: ChangelogConfig, loaders: ExpirationLoaders) -> Result<Self> {
        config.validate()?;
        let local: StorePair = (
            Arc::new(InMemoryStore::named("local")),
            Arc::new(InMemoryStore::named("local-offline")),
        );

        let sql = match &config.sql_url {
            Some(url) => {
                info!("Connecting to SQL (durable store)...");
                let online = SqlStore::new(url).await?;
                let offline = SqlStore::from_pool(online.pool(), "offline_sessions", url.starts_with("sqlite:")).await?;
                info!("SQL connected");
                Some((Arc::new(online), Arc::new(offline)))
            }
            None => None,
        };

        let redis = match &config.redis_url {
            Some(url) => {
                info!(prefix = ?config.redis_prefix, "Connecting to Redis (clustered cache)...");
                let base = config.redis_prefix.clone().unwrap_or_default();
                let online = RedisStore::with_prefix(url, Some(&format!("{}sessions:", base))).await?;
                let offline = RedisStore::with_prefix(url, Some(&format!("{}offline:", base))).await?;
                info!("Redis connected");
                Some((Arc::new(online), Arc::new(offline), base))
            }
            None => None,
        };

        let loaders = Arc::new(loaders);
        let (topology, preloader) = match (redis, sql) {
            (None, None) => (SinkTopology::local_only(local.0, local.1), None),
            (None, Some((online, offline))) => (SinkTopology::relational_only(online, offline), None),
            (Some((online, offline, _)), None) => {
                let topology = SinkTopology::new(online, offline).with_mirror(local.0, local.1);
                (topology, None)
            }
            (Some((online, offline, base)), Some((sql_online, sql_offline))) => {
                let lock: Arc<dyn ClusterLock> =
                    Arc::new(RedisLock::with_prefix(online.connection(), &format!("{}lock:", base)));
                let preloader = Preloader::new(lock, &config)
                    .with_loaders(Arc::clone(&loaders))
                    .with_job(PreloadJob::new("online", sql_online.clone(), online.clone()))
                    .with_job(PreloadJob::new("offline", sql_offline.clone(), offline.clone()));
                let topology = SinkTopology::new(online, offline)
                    .with_mirror(local.0, local.1)
                    .with_fallback(sql_online.clone(), sql_offline.clone())
                    .with_store(sql_online, SinkFilter::OnlineOnly, WriteMode::Upsert)
                    .with_store(sql_offline, SinkFilter::OfflineOnly, WriteMode::Upsert);
                (topology, Some(preloader))
            }
        };
        info!(sinks = topology.sink_count(), preload = preloader.is_some(), "Topology built");

        let mut engine = Self::new(config, topology, ExpirationLoaders::immortal());
        engine.loaders = loaders;
        engine.preloader = preloader;
        Ok(engine)
    }

    /// Spawn the deferred consumer and start accepting transactions.
    ///
    /// A zero `deferred_queue_capacity` disables deferral: deferrable updates
    /// are written inline. Must be called inside a Tokio runtime.
    pub fn start(&mut self) {
        if self.state() != EngineState::Created {
            warn!(state = %self.state(), "Engine already started");
            return;
        }

        if self.config.deferred_queue_capacity > 0 {
            let (queue, rx) = DeferredQueue::channel(self.config.deferred_queue_capacity);
            let consumer = DeferredConsumer::new(
                rx,
                Arc::clone(&self.topology),
                Arc::clone(&self.loaders),
                self.config.deferred_flush_count,
                self.config.deferred_flush_interval().max(Duration::from_millis(1)),
                self.shutdown_tx.subscribe(),
            );
            self.consumer = Some(consumer.spawn());
            self.deferred = Some(queue);
        }

        self.set_state(EngineState::Running);
        info!(
            deferred = self.deferred.is_some(),
            sinks = self.topology.sink_count(),
            "Changelog engine running"
        );
    }

    /// Run the configured preloader.
    ///
    /// Returns `None` when there is nothing to preload from. Never fails:
    /// an aborted preload leaves the node to fill lazily.
    pub async fn preload(&self) -> Option<PreloadOutcome> {
        let preloader = self.preloader.as_ref()?;
        let outcome = preloader.run().await;
        info!(outcome = outcome.as_str(), "Preload finished");
        Some(outcome)
    }

    /// Stop accepting transactions, drain the deferred queue and wait for
    /// the consumer. Returns the consumer's lifetime totals.
    pub async fn shutdown(&mut self) -> DeferredStats {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return DeferredStats::default();
        }
        info!("Shutting down changelog engine");
        self.set_state(EngineState::ShuttingDown);

        // Open transactions still hold queue clones; the consumer closes
        // the receiver itself so their later submits fall back to inline.
        self.deferred = None;
        self.shutdown_tx.send_replace(true);

        let stats = match self.consumer.take() {
            Some(handle) => match handle.await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(error = %e, "Deferred consumer task failed");
                    DeferredStats::default()
                }
            },
            None => DeferredStats::default(),
        };

        self.set_state(EngineState::Stopped);
        info!(applied = stats.applied, dropped = stats.dropped, failed = stats.failed, "Changelog engine stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload::{InMemoryLock, LoadReport};

    #[tokio::test]
    async fn test_connect_without_backends_is_local_only() {
        let engine = ChangelogEngine::connect(ChangelogConfig::default()).await.unwrap();
        assert_eq!(engine.topology().sink_count(), 2);
        assert!(engine.preload().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = ChangelogConfig {
            preload_workers: 0,
            ..Default::default()
        };
        let result = ChangelogEngine::connect(config).await;
        assert!(matches!(result, Err(crate::error::ChangelogError::Config(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let mut engine = ChangelogEngine::connect(ChangelogConfig::default()).await.unwrap();
        let mut states = engine.state_receiver();

        engine.start();
        assert_eq!(*states.borrow_and_update(), EngineState::Running);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.transaction().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_harmless() {
        let mut engine = ChangelogEngine::connect(ChangelogConfig::default()).await.unwrap();
        engine.start();
        engine.start();
        assert!(engine.is_running());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_deferral() {
        let config = ChangelogConfig {
            deferred_queue_capacity: 0,
            ..Default::default()
        };
        let mut engine = ChangelogEngine::connect(config).await.unwrap();
        engine.start();
        assert_eq!(engine.deferred_depth(), 0);
        assert_eq!(engine.shutdown().await, DeferredStats::default());
    }

    #[tokio::test]
    async fn test_preload_runs_configured_preloader() {
        let durable = Arc::new(InMemoryStore::named("durable"));
        durable
            .put(
                "s1",
                &crate::entity::EntityWrapper::new(crate::entity::SessionEntity::new("s1", "r")),
                crate::storage::Expiry::NONE,
            )
            .await
            .unwrap();
        let local = Arc::new(InMemoryStore::named("local"));
        let config = ChangelogConfig::default();
        let preloader = Preloader::new(Arc::new(InMemoryLock::new()), &config)
            .with_job(PreloadJob::new("online", durable, local.clone()));
        let engine = ChangelogEngine::new(
            config,
            SinkTopology::local_only(local.clone(), Arc::new(InMemoryStore::named("local-offline"))),
            ExpirationLoaders::immortal(),
        )
        .with_preloader(preloader);

        match engine.preload().await {
            Some(PreloadOutcome::Completed(LoadReport { rows_loaded, .. })) => assert_eq!(rows_loaded, 1),
            other => panic!("expected a completed preload, got {:?}", other),
        }
        assert_eq!(local.len(), 1);
    }
}
