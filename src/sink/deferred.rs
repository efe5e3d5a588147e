// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deferred application of low-priority changes.
//!
//! A merged update whose every task was deferrable (typically a
//! last-refresh bump) skips the inline sinks. The commit hands it to the
//! [`DeferredQueue`] and returns; a single [`DeferredConsumer`] drains the
//! queue in batches, flushing on whichever comes first:
//!
//! - the batch reaching `flush_count` changes
//! - the oldest change waiting `flush_interval`
//! - shutdown (everything still queued is drained)
//!
//! The queue is bounded. When it is full, `submit` waits for room, which
//! slows committers down instead of dropping changes.
//!
//! Deferred changes carry their tasks. At flush time each one is replayed
//! onto the currently stored value, so a session modified by a later
//! inline commit is not rolled back by an older deferred refresh.

use super::SinkTopology;
use crate::changelog::UpdatesList;
use crate::error::ChangelogError;
use crate::merge::{ExpirationLoaders, MergedUpdate};
use crate::task::UpdateTask;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What made the consumer flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Count,
    Age,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Age => "age",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeferredChange {
    pub key: String,
    pub update: MergedUpdate,
    pub tasks: Vec<UpdateTask>,
}

impl DeferredChange {
    pub fn new(key: impl Into<String>, update: MergedUpdate, tasks: Vec<UpdateTask>) -> Self {
        Self {
            key: key.into(),
            update,
            tasks,
        }
    }
}

/// Producer side, cloned into every transaction.
#[derive(Debug, Clone)]
pub struct DeferredQueue {
    tx: mpsc::Sender<DeferredChange>,
}

impl DeferredQueue {
    pub fn channel(capacity: usize) -> (DeferredQueue, mpsc::Receiver<DeferredChange>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (DeferredQueue { tx }, rx)
    }

    /// Enqueue, waiting for room if the queue is full.
    /// A closed queue hands the change back so the caller can apply it inline.
    pub async fn submit(&self, change: DeferredChange) -> Result<(), DeferredChange> {
        if self.tx.capacity() == 0 {
            debug!(key = %change.key, "Deferred queue full, waiting for room");
        }
        self.tx.send(change).await.map_err(|e| e.0)?;
        crate::metrics::record_deferred_enqueued();
        crate::metrics::set_deferred_queue_depth(self.depth());
        Ok(())
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Changes waiting for the next flush.
#[derive(Debug)]
struct PendingBatch {
    items: Vec<DeferredChange>,
    oldest: Option<Instant>,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            oldest: None,
        }
    }

    fn push(&mut self, change: DeferredChange) {
        self.oldest.get_or_insert_with(Instant::now);
        self.items.push(change);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_due(&self, max_age: Duration) -> bool {
        self.oldest.is_some_and(|t| t.elapsed() >= max_age)
    }

    fn take(&mut self) -> Vec<DeferredChange> {
        self.oldest = None;
        std::mem::take(&mut self.items)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredStats {
    pub batches: u64,
    pub applied: u64,
    /// Session gone by flush time, nothing left to write after replay, or
    /// superseded by a concurrent write
    pub dropped: u64,
    /// Rebase read or required sink write failed
    pub failed: u64,
}

pub struct DeferredConsumer {
    rx: mpsc::Receiver<DeferredChange>,
    topology: Arc<SinkTopology>,
    loaders: Arc<ExpirationLoaders>,
    flush_count: usize,
    flush_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl DeferredConsumer {
    pub fn new(
        rx: mpsc::Receiver<DeferredChange>,
        topology: Arc<SinkTopology>,
        loaders: Arc<ExpirationLoaders>,
        flush_count: usize,
        flush_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rx,
            topology,
            loaders,
            flush_count: flush_count.max(1),
            flush_interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<DeferredStats> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> DeferredStats {
        let mut stats = DeferredStats::default();
        let mut batch = PendingBatch::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut closing = false;

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(change) => {
                        batch.push(change);
                        if batch.len() >= self.flush_count {
                            self.flush(&mut batch, FlushTrigger::Count, &mut stats).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch, FlushTrigger::Shutdown, &mut stats).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if batch.is_due(self.flush_interval) {
                        self.flush(&mut batch, FlushTrigger::Age, &mut stats).await;
                    }
                }
                changed = self.shutdown.changed(), if !closing => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        // Stop accepting; recv keeps yielding what is buffered, then None
                        closing = true;
                        self.rx.close();
                    }
                }
            }
        }

        info!(
            batches = stats.batches,
            applied = stats.applied,
            dropped = stats.dropped,
            failed = stats.failed,
            "Deferred consumer stopped"
        );
        stats
    }

    async fn flush(&self, batch: &mut PendingBatch, trigger: FlushTrigger, stats: &mut DeferredStats) {
        let changes = batch.take();
        if changes.is_empty() {
            return;
        }
        crate::metrics::record_deferred_batch(changes.len(), trigger.as_str());
        debug!(count = changes.len(), trigger = trigger.as_str(), "Flushing deferred batch");

        let batch_stats = apply_batch(&self.topology, &self.loaders, changes).await;
        stats.batches += 1;
        stats.applied += batch_stats.applied;
        stats.dropped += batch_stats.dropped;
        stats.failed += batch_stats.failed;
    }
}

/// How one deferred change ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOutcome {
    Applied,
    Dropped,
    Failed,
}

/// Replay each change onto the stored value and write it through its own
/// fresh set of sinks. A conflict or failure on one key never holds back
/// the rest of the batch.
pub async fn apply_batch(
    topology: &SinkTopology,
    loaders: &ExpirationLoaders,
    changes: Vec<DeferredChange>,
) -> DeferredStats {
    let mut stats = DeferredStats::default();
    for change in changes {
        match apply_change(topology, loaders, change).await {
            ChangeOutcome::Applied => stats.applied += 1,
            ChangeOutcome::Dropped => stats.dropped += 1,
            ChangeOutcome::Failed => stats.failed += 1,
        }
    }
    stats
}

async fn apply_change(topology: &SinkTopology, loaders: &ExpirationLoaders, change: DeferredChange) -> ChangeOutcome {
    let _timer = crate::time_operation!("deferred", "apply");
    let offline = change.update.value.entity.offline;
    let source = topology.read_source(offline);
    let current = match source.get(&change.key).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            debug!(key = %change.key, "Deferred change for missing session dropped");
            return ChangeOutcome::Dropped;
        }
        Err(e) => {
            warn!(key = %change.key, error = %e, "Deferred change could not be rebased");
            return ChangeOutcome::Failed;
        }
    };

    let mut list = UpdatesList::fetched(current).with_client(change.update.client.clone());
    for task in change.tasks {
        list.add(task);
    }
    let Some(mut merged) = MergedUpdate::compute(&list, loaders) else {
        return ChangeOutcome::Dropped;
    };
    // Already deferred once; the flag must not change the routing now
    merged.deferrable = false;

    let mut sinks = topology.build_sinks();
    for sink in sinks.iter_mut() {
        if sink.should_consume_change(&merged.value.entity) {
            sink.register_change(&change.key, &merged);
        }
    }

    for sink in sinks.iter_mut() {
        match sink.apply_changes().await {
            Ok(_) => {}
            Err(e) if sink.is_best_effort() => {
                warn!(key = %change.key, sink = sink.name(), error = %e, "Best-effort sink failed");
            }
            Err(ChangelogError::WriteConflict { key, sink: name }) => {
                // A newer inline commit won; the sinks after this one never see the change
                debug!(%key, sink = %name, "Deferred change superseded");
                return ChangeOutcome::Dropped;
            }
            Err(e) => {
                warn!(key = %change.key, sink = sink.name(), error = %e, "Deferred write failed");
                return ChangeOutcome::Failed;
            }
        }
    }
    ChangeOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityWrapper, SessionEntity};
    use crate::replication::{CrossDcStatus, LastRefreshTracker};
    use crate::sink::{SinkFilter, WriteMode};
    use crate::storage::memory::InMemoryStore;
    use crate::storage::{BulkDeleteFilter, Expiry, SessionStore, StorageError};
    use crate::task::CacheOperation;

    fn setup() -> (Arc<InMemoryStore>, Arc<SinkTopology>) {
        let online = Arc::new(InMemoryStore::named("online"));
        let offline = Arc::new(InMemoryStore::named("offline"));
        let topology = Arc::new(SinkTopology::local_only(online.clone(), offline));
        (online, topology)
    }

    async fn seed(store: &InMemoryStore, id: &str, version: u64) {
        let mut entity = SessionEntity::new(id, "r");
        entity.last_session_refresh = 0;
        store
            .put(id, &EntityWrapper::with_version(entity, version), Expiry::NONE)
            .await
            .unwrap();
    }

    fn refresh_change(id: &str, timestamp: i64) -> DeferredChange {
        let tracker = Arc::new(LastRefreshTracker::new());
        let task = UpdateTask::refresh(timestamp, tracker, 60_000);
        let mut entity = SessionEntity::new(id, "r");
        entity.last_session_refresh = timestamp;
        let update = MergedUpdate {
            operation: CacheOperation::Replace,
            value: EntityWrapper::with_version(entity, 2),
            expected_version: Some(1),
            expiry: Expiry::NONE,
            deferrable: true,
            cross_dc: CrossDcStatus::NotNeeded,
            realm: "r".into(),
            client: None,
        };
        DeferredChange::new(id, update, vec![task])
    }

    #[tokio::test]
    async fn test_apply_batch_rebases_on_current_version() {
        let (online, topology) = setup();
        // Someone else moved the session on since the change was staged
        seed(&online, "s1", 7).await;

        let stats = apply_batch(&topology, &ExpirationLoaders::immortal(), vec![refresh_change("s1", 9_000)]).await;

        assert_eq!(stats.applied, 1);
        let stored = online.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.version, 8);
        assert_eq!(stored.entity.last_session_refresh, 9_000);
    }

    #[tokio::test]
    async fn test_apply_batch_drops_missing_sessions() {
        let (online, topology) = setup();
        let stats = apply_batch(&topology, &ExpirationLoaders::immortal(), vec![refresh_change("gone", 1)]).await;

        assert_eq!(stats.dropped, 1);
        assert!(online.is_empty());
    }

    /// Lets another writer bump `contended` right before our replace lands.
    struct RacingStore {
        inner: InMemoryStore,
        contended: String,
    }

    #[async_trait::async_trait]
    impl SessionStore for RacingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &str) -> Result<Option<EntityWrapper>, StorageError> {
            self.inner.get(key).await
        }

        async fn put_if_absent(&self, key: &str, wrapper: &EntityWrapper, expiry: Expiry) -> Result<bool, StorageError> {
            self.inner.put_if_absent(key, wrapper, expiry).await
        }

        async fn replace(
            &self,
            key: &str,
            expected_version: u64,
            wrapper: &EntityWrapper,
            expiry: Expiry,
        ) -> Result<bool, StorageError> {
            if key == self.contended {
                if let Some(current) = self.inner.get(key).await? {
                    let mut entity = current.entity.clone();
                    entity.user_id = Some("someone-else".into());
                    let next = EntityWrapper::with_version(entity, current.version + 1);
                    self.inner.put(key, &next, expiry).await?;
                }
            }
            self.inner.replace(key, expected_version, wrapper, expiry).await
        }

        async fn put(&self, key: &str, wrapper: &EntityWrapper, expiry: Expiry) -> Result<(), StorageError> {
            self.inner.put(key, wrapper, expiry).await
        }

        async fn remove(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.remove(key).await
        }

        async fn remove_matching(&self, filter: &BulkDeleteFilter) -> Result<u64, StorageError> {
            self.inner.remove_matching(filter).await
        }
    }

    #[tokio::test]
    async fn test_conflicting_key_does_not_block_rest_of_batch() {
        let online = Arc::new(RacingStore {
            inner: InMemoryStore::named("online"),
            contended: "a".into(),
        });
        seed(&online.inner, "a", 1).await;
        seed(&online.inner, "b", 1).await;
        let mirror = Arc::new(InMemoryStore::named("mirror"));
        let topology = SinkTopology::new(online.clone(), Arc::new(InMemoryStore::named("offline")))
            .with_store(mirror.clone(), SinkFilter::OnlineOnly, WriteMode::Upsert);

        let stats = apply_batch(
            &topology,
            &ExpirationLoaders::immortal(),
            vec![refresh_change("a", 5_000), refresh_change("b", 5_000)],
        )
        .await;

        assert_eq!(stats.applied, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.failed, 0);

        let b = online.get("b").await.unwrap().unwrap();
        assert_eq!(b.entity.last_session_refresh, 5_000);
        assert_eq!(b.version, 2);

        // The concurrent write to "a" stands and the mirror never saw our stale copy
        let a = online.get("a").await.unwrap().unwrap();
        assert_eq!(a.entity.user_id.as_deref(), Some("someone-else"));
        assert_eq!(a.entity.last_session_refresh, 0);
        assert!(mirror.get("a").await.unwrap().is_none());
        assert!(mirror.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_submit_fails_when_closed() {
        let (queue, rx) = DeferredQueue::channel(4);
        drop(rx);
        assert!(queue.submit(refresh_change("s", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_consumer_flushes_on_count() {
        let (online, topology) = setup();
        for id in ["a", "b"] {
            seed(&online, id, 1).await;
        }
        let (queue, rx) = DeferredQueue::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = DeferredConsumer::new(
            rx,
            topology,
            Arc::new(ExpirationLoaders::immortal()),
            2,
            Duration::from_secs(3600),
            stop_rx,
        )
        .spawn();

        queue.submit(refresh_change("a", 5_000)).await.unwrap();
        queue.submit(refresh_change("b", 5_000)).await.unwrap();
        drop(queue);

        let stats = handle.await.unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.batches, 1);
        assert_eq!(online.get("a").await.unwrap().unwrap().entity.last_session_refresh, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_flushes_on_age() {
        let (online, topology) = setup();
        seed(&online, "a", 1).await;
        let (queue, rx) = DeferredQueue::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = DeferredConsumer::new(
            rx,
            topology,
            Arc::new(ExpirationLoaders::immortal()),
            100,
            Duration::from_millis(250),
            stop_rx,
        )
        .spawn();

        queue.submit(refresh_change("a", 5_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(online.get("a").await.unwrap().unwrap().entity.last_session_refresh, 5_000);
        drop(queue);
        assert_eq!(handle.await.unwrap().applied, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (online, topology) = setup();
        seed(&online, "a", 1).await;
        let (queue, rx) = DeferredQueue::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        queue.submit(refresh_change("a", 5_000)).await.unwrap();
        let handle = DeferredConsumer::new(
            rx,
            topology,
            Arc::new(ExpirationLoaders::immortal()),
            100,
            Duration::from_secs(3600),
            stop_rx,
        )
        .spawn();

        stop_tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.applied, 1);
        assert!(queue.is_closed());
    }
}
