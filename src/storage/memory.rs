// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local in-process session map.
//!
//! Backed by a `DashMap`, so `put_if_absent` and `replace` are atomic per
//! key via the entry API. Expiry is lazy: an expired entry is dropped the
//! next time it is touched.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use crate::entity::EntityWrapper;
use crate::preload::source::{RowSource, RowStream, SegmentRange};
use super::traits::{BulkDeleteFilter, ChangeFeed, Expiry, SessionStore, StorageError, StoreEvent};

#[derive(Debug, Clone)]
struct StoredEntry {
    wrapper: EntityWrapper,
    expires_at: Option<Instant>,
    max_idle: Option<Duration>,
    last_access: Instant,
}

impl StoredEntry {
    fn new(wrapper: EntityWrapper, expiry: Expiry) -> Self {
        let now = Instant::now();
        let positive = |ms: i64| (ms > 0).then(|| Duration::from_millis(ms as u64));
        Self {
            wrapper,
            expires_at: positive(expiry.lifespan_ms).map(|d| now + d),
            max_idle: positive(expiry.max_idle_ms),
            last_access: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
            || self.max_idle.is_some_and(|idle| now.duration_since(self.last_access) >= idle)
    }
}

pub struct InMemoryStore {
    name: String,
    data: DashMap<String, StoredEntry>,
    feed: Option<broadcast::Sender<StoreEvent>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::named("local")
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: DashMap::new(),
            feed: None,
        }
    }

    /// Publish every mutation on a broadcast channel of `capacity`.
    #[must_use]
    pub fn with_change_feed(mut self, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        self.feed = Some(tx);
        self
    }

    /// Get current entry count (including not-yet-collected expired entries)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn publish(&self, event: StoreEvent) {
        if let Some(tx) = &self.feed {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    fn live_snapshot(&self) -> Vec<(String, EntityWrapper)> {
        let now = Instant::now();
        let mut rows: Vec<_> = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().wrapper.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<EntityWrapper>, StorageError> {
        let now = Instant::now();
        if let Some(mut entry) = self.data.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_access = now;
                return Ok(Some(entry.wrapper.clone()));
            }
        } else {
            return Ok(None);
        }
        // Guard dropped above, safe to take the shard write lock
        self.data.remove_if(key, |_, e| e.is_expired(now));
        Ok(None)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError> {
        let inserted = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(Instant::now()) {
                    occupied.insert(StoredEntry::new(wrapper.clone(), expiry));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(wrapper.clone(), expiry));
                true
            }
        };
        if inserted {
            self.publish(StoreEvent::Upserted { key: key.to_string(), wrapper: wrapper.clone() });
        }
        Ok(inserted)
    }

    async fn replace(
        &self,
        key: &str,
        expected_version: u64,
        wrapper: &EntityWrapper,
        expiry: Expiry,
    ) -> Result<bool, StorageError> {
        let replaced = match self.data.get_mut(key) {
            Some(mut entry)
                if !entry.is_expired(Instant::now()) && entry.wrapper.version == expected_version =>
            {
                *entry = StoredEntry::new(wrapper.clone(), expiry);
                true
            }
            _ => false,
        };
        if replaced {
            self.publish(StoreEvent::Upserted { key: key.to_string(), wrapper: wrapper.clone() });
        }
        Ok(replaced)
    }

    async fn put(&self, key: &str, wrapper: &EntityWrapper, expiry: Expiry) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), StoredEntry::new(wrapper.clone(), expiry));
        self.publish(StoreEvent::Upserted { key: key.to_string(), wrapper: wrapper.clone() });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let removed = self.data.remove(key).is_some();
        if removed {
            self.publish(StoreEvent::Removed { key: key.to_string() });
        }
        Ok(removed)
    }

    async fn remove_matching(&self, filter: &BulkDeleteFilter) -> Result<u64, StorageError> {
        let doomed: Vec<String> = self
            .data
            .iter()
            .filter(|e| filter.matches(e.key(), &e.value().wrapper.entity))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in doomed {
            if self.data.remove(&key).is_some() {
                removed += 1;
                self.publish(StoreEvent::Removed { key });
            }
        }
        Ok(removed)
    }
}

impl ChangeFeed for InMemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        match &self.feed {
            Some(tx) => tx.subscribe(),
            // No feed configured: a receiver that reports Closed immediately
            None => broadcast::channel(1).1,
        }
    }
}

#[async_trait]
impl RowSource for InMemoryStore {
    async fn total_rows(&self) -> Result<u64, StorageError> {
        Ok(self.live_snapshot().len() as u64)
    }

    fn rows(&self, range: SegmentRange) -> RowStream<'_> {
        let rows: Vec<Result<(String, Vec<u8>), StorageError>> = self
            .live_snapshot()
            .into_iter()
            .skip(range.offset as usize)
            .take(range.limit as usize)
            .map(|(key, wrapper)| wrapper.entity.encode().map(|raw| (key, raw)))
            .collect();
        Box::pin(stream::iter(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SessionEntity;
    use futures::StreamExt;
    use std::sync::Arc;

    fn wrapper(id: &str, realm: &str) -> EntityWrapper {
        EntityWrapper::new(SessionEntity::new(id, realm))
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.name(), "local");
    }

    #[tokio::test]
    async fn test_put_if_absent_only_once() {
        let store = InMemoryStore::new();
        let first = wrapper("s1", "r");
        let second = EntityWrapper::new(SessionEntity::new("s1", "other"));

        assert!(store.put_if_absent("s1", &first, Expiry::NONE).await.unwrap());
        assert!(!store.put_if_absent("s1", &second, Expiry::NONE).await.unwrap());

        let stored = store.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.entity.realm_id, "r");
    }

    #[tokio::test]
    async fn test_replace_checks_version() {
        let store = InMemoryStore::new();
        let v1 = wrapper("s1", "r");
        store.put_if_absent("s1", &v1, Expiry::NONE).await.unwrap();

        let mut v2 = v1.clone();
        v2.version = 2;
        v2.entity.last_session_refresh += 10;

        assert!(!store.replace("s1", 5, &v2, Expiry::NONE).await.unwrap());
        assert!(store.replace("s1", 1, &v2, Expiry::NONE).await.unwrap());
        assert_eq!(store.get("s1").await.unwrap().unwrap().version, 2);

        // Stale expected version now fails
        assert!(!store.replace("s1", 1, &v2, Expiry::NONE).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_missing_key_fails() {
        let store = InMemoryStore::new();
        assert!(!store.replace("nope", 1, &wrapper("nope", "r"), Expiry::NONE).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = InMemoryStore::new();
        store.put("s1", &wrapper("s1", "r"), Expiry::NONE).await.unwrap();
        assert!(store.remove("s1").await.unwrap());
        assert!(!store.remove("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lifespan_expiry_is_lazy() {
        let store = InMemoryStore::new();
        store.put("s1", &wrapper("s1", "r"), Expiry::new(20, -1)).await.unwrap();
        assert!(store.get("s1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get("s1").await.unwrap().is_none());
        // Expired slot can be re-created
        assert!(store.put_if_absent("s1", &wrapper("s1", "r"), Expiry::NONE).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_matching_by_realm() {
        let store = InMemoryStore::new();
        store.put("a", &wrapper("a", "r1"), Expiry::NONE).await.unwrap();
        store.put("b", &wrapper("b", "r1"), Expiry::NONE).await.unwrap();
        store.put("c", &wrapper("c", "r2"), Expiry::NONE).await.unwrap();

        let removed = store.remove_matching(&BulkDeleteFilter::realm("r1")).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_change_feed_publishes_mutations() {
        let store = InMemoryStore::named("replica").with_change_feed(16);
        let mut rx = store.subscribe();

        store.put("s1", &wrapper("s1", "r"), Expiry::NONE).await.unwrap();
        store.remove("s1").await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::Upserted { key, .. } if key == "s1"));
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Removed { key: "s1".into() });
    }

    #[tokio::test]
    async fn test_row_source_segments_in_key_order() {
        let store = InMemoryStore::new();
        for id in ["c", "a", "b", "d"] {
            store.put(id, &wrapper(id, "r"), Expiry::NONE).await.unwrap();
        }
        assert_eq!(store.total_rows().await.unwrap(), 4);

        let rows: Vec<_> = store
            .rows(SegmentRange { index: 1, offset: 2, limit: 2 })
            .collect()
            .await;
        let keys: Vec<_> = rows.into_iter().map(|r| r.unwrap().0).collect();
        assert_eq!(keys, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent_single_winner() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let w = EntityWrapper::new(SessionEntity::new("hot", format!("r{}", i)));
                store.put_if_absent("hot", &w, Expiry::NONE).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }
}
