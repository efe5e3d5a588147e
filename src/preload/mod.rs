// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cold-start warm-up.
//!
//! Exactly one node in the cluster scans the durable store. Every node
//! races for a named lease; the winner runs a [`SegmentedBulkLoader`] per
//! job (online sessions, offline sessions) under one overall deadline.
//! Losers follow the replica's change feed instead, when one is wired up.
//!
//! ```text
//!            acquire_with_timeout(lock)
//!                 │            │
//!              won│            │LockTimeout
//!                 ▼            ▼
//!     load each job        ReplicaListener ─► ReplicaWarm
//!     (preload timeout)    (no feed)       ─► Skipped
//!                 │
//!      Completed / Aborted, then release
//! ```
//!
//! A failed or aborted preload is not fatal: the node falls back to lazy
//! fill on first read.

pub mod loader;
pub mod lock;
pub mod segments;
pub mod source;

pub use loader::{LoadReport, LoadState, LoaderConfig, SegmentedBulkLoader};
pub use lock::{acquire_with_timeout, ClusterLock, InMemoryLock, RedisLock};
pub use segments::segment_count;
pub use source::{RowSource, RowStream, SegmentRange};

use crate::config::ChangelogConfig;
use crate::merge::ExpirationLoaders;
use crate::replication::ReplicaListener;
use crate::storage::{ChangeFeed, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One source → target scan.
pub struct PreloadJob {
    pub name: String,
    pub source: Arc<dyn RowSource>,
    pub target: Arc<dyn SessionStore>,
}

impl PreloadJob {
    pub fn new(name: impl Into<String>, source: Arc<dyn RowSource>, target: Arc<dyn SessionStore>) -> Self {
        Self {
            name: name.into(),
            source,
            target,
        }
    }
}

#[derive(Debug)]
pub enum PreloadOutcome {
    /// Every job finished; reports are folded together.
    Completed(LoadReport),
    /// Error budget or deadline blown. Lazy fill covers the rest.
    Aborted(String),
    /// Lost the lock; mirroring the replica until its feed closes.
    ReplicaWarm(JoinHandle<u64>),
    /// Lost the lock and has nothing to follow.
    Skipped(String),
}

impl PreloadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Aborted(_) => "aborted",
            Self::ReplicaWarm(_) => "replica_warm",
            Self::Skipped(_) => "skipped",
        }
    }
}

pub struct Preloader {
    lock: Arc<dyn ClusterLock>,
    lock_name: String,
    owner: String,
    lease: Duration,
    lock_wait: Duration,
    timeout: Duration,
    loader_config: LoaderConfig,
    loaders: Arc<ExpirationLoaders>,
    jobs: Vec<PreloadJob>,
    replica: Option<(Arc<dyn ChangeFeed>, Arc<dyn SessionStore>)>,
}

impl Preloader {
    pub fn new(lock: Arc<dyn ClusterLock>, config: &ChangelogConfig) -> Self {
        Self {
            lock,
            lock_name: config.preload_lock_name.clone(),
            owner: uuid::Uuid::new_v4().to_string(),
            // Outlives the deadline so a slow winner is never overtaken
            lease: config.preload_timeout() * 2,
            lock_wait: config.preload_lock_wait(),
            timeout: config.preload_timeout(),
            loader_config: LoaderConfig::from(config),
            loaders: Arc::new(ExpirationLoaders::immortal()),
            jobs: Vec::new(),
            replica: None,
        }
    }

    #[must_use]
    pub fn with_job(mut self, job: PreloadJob) -> Self {
        self.jobs.push(job);
        self
    }

    #[must_use]
    pub fn with_loaders(mut self, loaders: Arc<ExpirationLoaders>) -> Self {
        self.loaders = loaders;
        self
    }

    /// Where a node that loses the lock warms from.
    #[must_use]
    pub fn with_replica_feed(mut self, feed: Arc<dyn ChangeFeed>, local: Arc<dyn SessionStore>) -> Self {
        self.replica = Some((feed, local));
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Race for the lock and warm up one way or the other.
    #[tracing::instrument(skip(self), fields(lock = %self.lock_name, owner = %self.owner))]
    pub async fn run(&self) -> PreloadOutcome {
        let acquired = acquire_with_timeout(
            self.lock.as_ref(),
            &self.lock_name,
            &self.owner,
            self.lease,
            self.lock_wait,
        )
        .await;

        let outcome = match acquired {
            Ok(()) => {
                let outcome = self.load_all().await;
                match self.lock.release(&self.lock_name, &self.owner).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Preload lock lease lapsed before release"),
                    Err(e) => warn!(error = %e, "Failed to release preload lock"),
                }
                outcome
            }
            Err(e) => {
                info!(error = %e, "Another node is preloading");
                match &self.replica {
                    Some((feed, local)) => {
                        PreloadOutcome::ReplicaWarm(ReplicaListener::spawn(feed.subscribe(), Arc::clone(local)))
                    }
                    None => PreloadOutcome::Skipped(e.to_string()),
                }
            }
        };
        crate::metrics::set_preload_state(outcome.as_str());
        outcome
    }

    async fn load_all(&self) -> PreloadOutcome {
        let jobs = async {
            let mut total = LoadReport::default();
            for job in &self.jobs {
                let loader = SegmentedBulkLoader::new(
                    Arc::clone(&job.source),
                    Arc::clone(&job.target),
                    self.loader_config.clone(),
                )
                .with_loaders(Arc::clone(&self.loaders));
                let report = loader.load().await.map_err(|e| format!("{}: {}", job.name, e))?;
                info!(job = %job.name, loaded = report.rows_loaded, "Preload job finished");
                total.absorb(&report);
            }
            total.state = LoadState::Completed;
            Ok::<_, String>(total)
        };

        match tokio::time::timeout(self.timeout, jobs).await {
            Ok(Ok(report)) => PreloadOutcome::Completed(report),
            Ok(Err(reason)) => {
                error!(reason = %reason, "Preload aborted");
                PreloadOutcome::Aborted(reason)
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "Preload deadline exceeded");
                PreloadOutcome::Aborted(format!("deadline of {:?} exceeded", self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityWrapper, SessionEntity};
    use crate::storage::memory::InMemoryStore;
    use crate::storage::Expiry;

    fn config() -> ChangelogConfig {
        ChangelogConfig {
            preload_lock_wait_secs: 0,
            ..Default::default()
        }
    }

    async fn durable(n: usize) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::named("durable"));
        for i in 0..n {
            let id = format!("s{}", i);
            store
                .put(&id, &EntityWrapper::new(SessionEntity::new(id.clone(), "r")), Expiry::NONE)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_winner_loads_and_releases() {
        let lock = Arc::new(InMemoryLock::new());
        let target = Arc::new(InMemoryStore::named("local"));
        let preloader = Preloader::new(lock.clone(), &config())
            .with_job(PreloadJob::new("online", durable(10).await, target.clone()));

        let outcome = preloader.run().await;

        match outcome {
            PreloadOutcome::Completed(report) => assert_eq!(report.rows_loaded, 10),
            other => panic!("expected Completed, got {:?}", other),
        }
        assert_eq!(target.len(), 10);
        assert_eq!(lock.holder("session-preload"), None);
    }

    #[tokio::test]
    async fn test_jobs_fold_into_one_report() {
        let online = Arc::new(InMemoryStore::named("local"));
        let offline = Arc::new(InMemoryStore::named("local-offline"));
        let preloader = Preloader::new(Arc::new(InMemoryLock::new()), &config())
            .with_job(PreloadJob::new("online", durable(3).await, online.clone()))
            .with_job(PreloadJob::new("offline", durable(4).await, offline.clone()));

        let PreloadOutcome::Completed(report) = preloader.run().await else {
            panic!("expected Completed");
        };
        assert_eq!(report.rows_loaded, 7);
        assert_eq!(report.segments, 2);
    }

    #[tokio::test]
    async fn test_loser_without_feed_skips() {
        let lock = Arc::new(InMemoryLock::new());
        lock.try_acquire("session-preload", "peer", Duration::from_secs(60)).await.unwrap();
        let target = Arc::new(InMemoryStore::named("local"));

        let outcome = Preloader::new(lock, &config())
            .with_job(PreloadJob::new("online", durable(5).await, target.clone()))
            .run()
            .await;

        assert!(matches!(outcome, PreloadOutcome::Skipped(_)));
        assert!(target.is_empty());
    }

    #[tokio::test]
    async fn test_loser_follows_replica() {
        let lock = Arc::new(InMemoryLock::new());
        lock.try_acquire("session-preload", "peer", Duration::from_secs(60)).await.unwrap();
        let replica = Arc::new(InMemoryStore::named("replica").with_change_feed(16));
        let local = Arc::new(InMemoryStore::named("local"));

        let outcome = Preloader::new(lock, &config())
            .with_replica_feed(replica.clone(), local.clone())
            .run()
            .await;
        let PreloadOutcome::ReplicaWarm(listener) = outcome else {
            panic!("expected ReplicaWarm");
        };

        replica
            .put("s1", &EntityWrapper::new(SessionEntity::new("s1", "r")), Expiry::NONE)
            .await
            .unwrap();
        drop(replica);

        assert_eq!(listener.await.unwrap(), 1);
        assert!(local.get("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_aborted_load_still_releases() {
        let lock = Arc::new(InMemoryLock::new());
        let mut cfg = config();
        cfg.max_errors = 0;
        let preloader = Preloader::new(lock.clone(), &cfg).with_job(PreloadJob::new(
            "broken",
            Arc::new(FailingSource),
            Arc::new(InMemoryStore::named("local")),
        ));

        assert!(matches!(preloader.run().await, PreloadOutcome::Aborted(_)));
        assert_eq!(lock.holder("session-preload"), None);
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl RowSource for FailingSource {
        async fn total_rows(&self) -> Result<u64, crate::storage::StorageError> {
            Ok(1)
        }

        fn rows(&self, _range: SegmentRange) -> RowStream<'_> {
            Box::pin(futures::stream::iter(vec![Err(crate::storage::StorageError::Backend(
                "unreachable".into(),
            ))]))
        }
    }
}
