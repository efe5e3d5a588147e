// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staging operations: read, add_task, add_bulk_delete, reload.
//!
//! The only await in here is the first fetch of a key from the read
//! source. Everything after that works on the staged copy.

use super::{EntityChangeLog, LogSlot, PersistenceState, UpdatesList};
use crate::entity::{EntityWrapper, SessionEntity};
use crate::error::{ChangelogError, Result};
use crate::storage::{BulkDeleteFilter, SessionStore};
use crate::task::{CacheOperation, UpdateTask};
use std::sync::Arc;
use tracing::debug;

impl EntityChangeLog {
    /// The staged value of `key`, or the stored one on first access.
    ///
    /// `None` if the key does not exist, if staged tasks removed it, or if
    /// a bulk delete recorded in this transaction matches it.
    pub async fn read(&mut self, key: &str, offline: bool) -> Result<Option<EntityWrapper>> {
        self.require_active()?;
        if let Some(list) = self.updates.get(key) {
            return Ok(list.exists_now().then(|| list.wrapper().clone()));
        }

        let Some(wrapper) = self.fetch(key, offline).await? else {
            return Ok(None);
        };
        self.stage(key, UpdatesList::fetched(wrapper.clone()));
        Ok(Some(wrapper))
    }

    /// Apply `task` to the staged entity now and record it for commit.
    ///
    /// A key with no stored value is only staged for an `Add` task; any
    /// other task on a missing entity is ignored and `false` returned.
    pub async fn add_task(&mut self, key: &str, offline: bool, task: UpdateTask) -> Result<bool> {
        self.require_active()?;
        if !self.updates.contains_key(key) {
            let list = match self.fetch(key, offline).await? {
                Some(wrapper) => UpdatesList::fetched(wrapper),
                None if task.operation() == CacheOperation::Add => UpdatesList::absent(
                    EntityWrapper::new(SessionEntity::placeholder(key, offline)),
                    PersistenceState::Persistent,
                ),
                None => {
                    debug!(key, op = %task.operation(), "Task for missing entity ignored");
                    return Ok(false);
                }
            };
            self.stage(key, list);
        }

        match self.updates.get_mut(key) {
            Some(list) => {
                list.add(task);
                Ok(true)
            }
            None => Err(ChangelogError::InvalidState(format!("no staging for {}", key))),
        }
    }

    /// Stage a caller-built entity (create path).
    ///
    /// Without a `task` an implicit create is recorded. A `Transient`
    /// entity is readable in this transaction but never written.
    pub fn add_task_with_entity(
        &mut self,
        key: &str,
        task: Option<UpdateTask>,
        entity: SessionEntity,
        state: PersistenceState,
    ) -> Result<()> {
        self.require_active()?;
        let base_version = self.updates.get(key).and_then(UpdatesList::base_version);
        let mut list = UpdatesList::absent(EntityWrapper::new(entity), state).with_base_version(base_version);
        list.add(task.unwrap_or_else(|| UpdateTask::add(|_| {})));
        self.stage(key, list);
        Ok(())
    }

    /// Same as [`add_task_with_entity`](Self::add_task_with_entity) with a client
    /// recorded for the expiration loaders.
    pub fn add_task_with_client(
        &mut self,
        key: &str,
        task: Option<UpdateTask>,
        entity: SessionEntity,
        client: impl Into<String>,
    ) -> Result<()> {
        self.add_task_with_entity(key, task, entity, PersistenceState::Persistent)?;
        if let Some(list) = self.updates.remove(key) {
            self.updates.insert(key.to_string(), list.with_client(Some(client.into())));
        }
        Ok(())
    }

    /// Re-fetch `key` and replay its staged tasks on the fresh value.
    /// Returns `false` if the key has nothing staged.
    pub async fn reload_entity(&mut self, key: &str) -> Result<bool> {
        self.require_active()?;
        let Some(offline) = self.updates.get(key).map(|l| l.wrapper().entity.offline) else {
            return Ok(false);
        };
        let fresh = self.fetch(key, offline).await?;
        if let Some(list) = self.updates.get_mut(key) {
            debug!(key, fresh_version = ?fresh.as_ref().map(|w| w.version), "Rebasing staged tasks");
            list.rebase(fresh);
        }
        Ok(true)
    }

    /// Stage a last-refresh bump for `key`, deferrable and replicated only
    /// once the replica's copy is stale enough to matter.
    ///
    /// Uses the topology's refresh tracker, so the decision accounts for
    /// refreshes earlier transactions already propagated.
    pub async fn refresh(&mut self, key: &str, offline: bool, timestamp: i64, idle_timeout_ms: i64) -> Result<bool> {
        let tracker = Arc::clone(self.topology.refresh_tracker());
        self.add_task(key, offline, UpdateTask::refresh(timestamp, tracker, idle_timeout_ms))
            .await
    }

    /// Record a bulk delete and drop every staged key it matches.
    /// Returns how many staged entities it deleted.
    pub fn add_bulk_delete(&mut self, filter: BulkDeleteFilter) -> Result<u64> {
        self.require_active()?;
        let updates = &mut self.updates;
        let mut deleted = 0u64;

        self.order.retain(|slot| match slot {
            LogSlot::Key(key) => {
                let Some(list) = updates.get(key) else {
                    return true;
                };
                if !filter.matches(key, &list.wrapper().entity) {
                    return true;
                }
                if list.exists_now() {
                    deleted += 1;
                }
                updates.remove(key);
                false
            }
            LogSlot::BulkDelete(_) => true,
        });

        debug!(?filter, deleted, "Bulk delete recorded");
        crate::metrics::record_bulk_delete(deleted);
        self.order.push(LogSlot::BulkDelete(filter));
        Ok(deleted)
    }

    async fn fetch(&self, key: &str, offline: bool) -> Result<Option<EntityWrapper>> {
        let source = self.topology.read_source(offline);
        let mut stored = source
            .get(key)
            .await
            .map_err(|e| ChangelogError::unavailable(source.name(), e))?;
        if stored.is_none() {
            if let Some(durable) = self.topology.fallback(offline) {
                stored = self.fill_from(durable.as_ref(), source.as_ref(), key).await?;
            }
        }

        Ok(stored
            .map(|mut wrapper| {
                wrapper.entity.offline = offline;
                wrapper
            })
            .filter(|wrapper| !self.deleted_by_marker(key, &wrapper.entity)))
    }

    /// Cache miss: copy `key` from the durable store into the read source.
    ///
    /// Losing the insert race to another filler (or a create) means the
    /// read source now holds the value to use.
    async fn fill_from(
        &self,
        durable: &dyn SessionStore,
        source: &dyn SessionStore,
        key: &str,
    ) -> Result<Option<EntityWrapper>> {
        let Some(found) = durable
            .get(key)
            .await
            .map_err(|e| ChangelogError::unavailable(durable.name(), e))?
        else {
            return Ok(None);
        };

        let _timer = crate::time_operation!("changelog", "lazy_fill");
        let expiry = self.loaders.expiry_for(&found.entity.realm_id, None, &found.entity);
        if expiry.is_expired() {
            debug!(key, durable = durable.name(), "Durable copy already expired, not filling");
            return Ok(None);
        }

        let inserted = source
            .put_if_absent(key, &found, expiry)
            .await
            .map_err(|e| ChangelogError::unavailable(source.name(), e))?;
        crate::metrics::record_lazy_fill(source.name(), if inserted { "filled" } else { "raced" });
        if inserted {
            debug!(key, from = durable.name(), to = source.name(), "Filled cache miss from durable store");
            return Ok(Some(found));
        }
        source
            .get(key)
            .await
            .map_err(|e| ChangelogError::unavailable(source.name(), e))
    }

    fn deleted_by_marker(&self, key: &str, entity: &SessionEntity) -> bool {
        self.order.iter().any(|slot| match slot {
            LogSlot::BulkDelete(filter) => filter.matches(key, entity),
            LogSlot::Key(_) => false,
        })
    }

    fn stage(&mut self, key: &str, list: UpdatesList) {
        if self.updates.insert(key.to_string(), list).is_none() {
            self.order.push(LogSlot::Key(key.to_string()));
        }
    }
}
