// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key staging inside one transaction.

use crate::entity::EntityWrapper;
use crate::storage::BulkDeleteFilter;
use crate::task::{CacheOperation, UpdateTask};

/// Whether a staged entity should outlive the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceState {
    #[default]
    Persistent,
    /// Request-scoped; visible to reads, never committed
    Transient,
}

/// Everything one transaction staged for one key.
#[derive(Debug, Clone)]
pub struct UpdatesList {
    realm: String,
    client: Option<String>,
    wrapper: EntityWrapper,
    base_version: Option<u64>,
    persistence_state: PersistenceState,
    tasks: Vec<UpdateTask>,
}

impl UpdatesList {
    /// Staging for a value fetched from the read source.
    pub fn fetched(wrapper: EntityWrapper) -> Self {
        Self {
            realm: wrapper.entity.realm_id.clone(),
            client: None,
            base_version: Some(wrapper.version),
            wrapper,
            persistence_state: PersistenceState::Persistent,
            tasks: Vec::new(),
        }
    }

    /// Staging for a key with no stored value.
    pub fn absent(wrapper: EntityWrapper, persistence_state: PersistenceState) -> Self {
        Self {
            realm: wrapper.entity.realm_id.clone(),
            client: None,
            base_version: None,
            wrapper,
            persistence_state,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Option<String>) -> Self {
        self.client = client;
        self
    }

    /// Keep the stored version of an entry this list replaces.
    #[must_use]
    pub fn with_base_version(mut self, base_version: Option<u64>) -> Self {
        self.base_version = base_version;
        self
    }

    /// Apply `task` to the staged entity and record it.
    pub fn add(&mut self, task: UpdateTask) {
        task.apply(&mut self.wrapper.entity);
        // A create task fills in a placeholder's realm
        if self.realm.is_empty() {
            self.realm = self.wrapper.entity.realm_id.clone();
        }
        self.tasks.push(task);
    }

    /// Swap in a freshly fetched value and replay the staged tasks onto it.
    pub fn rebase(&mut self, fresh: Option<EntityWrapper>) {
        match fresh {
            Some(wrapper) => {
                self.base_version = Some(wrapper.version);
                self.wrapper = wrapper;
            }
            None => self.base_version = None,
        }
        for task in &self.tasks {
            task.apply(&mut self.wrapper.entity);
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn wrapper(&self) -> &EntityWrapper {
        &self.wrapper
    }

    pub fn tasks(&self) -> &[UpdateTask] {
        &self.tasks
    }

    pub fn base_version(&self) -> Option<u64> {
        self.base_version
    }

    pub fn existed_before(&self) -> bool {
        self.base_version.is_some()
    }

    pub fn persistence_state(&self) -> PersistenceState {
        self.persistence_state
    }

    pub fn is_transient(&self) -> bool {
        self.persistence_state == PersistenceState::Transient
    }

    /// Existence after every staged task, starting from the stored state.
    pub fn exists_now(&self) -> bool {
        self.tasks.iter().fold(self.existed_before(), |exists, task| match task.operation() {
            CacheOperation::Add => true,
            CacheOperation::Remove => false,
            CacheOperation::Replace | CacheOperation::None => exists,
        })
    }
}

/// Slot in the ordered log: a key's staging or a bulk delete.
#[derive(Debug, Clone)]
pub(crate) enum LogSlot {
    Key(String),
    BulkDelete(BulkDeleteFilter),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SessionEntity;

    fn stored() -> EntityWrapper {
        EntityWrapper::with_version(SessionEntity::new("s", "r"), 4)
    }

    #[test]
    fn test_fetched_keeps_base_version() {
        let list = UpdatesList::fetched(stored());
        assert_eq!(list.base_version(), Some(4));
        assert!(list.exists_now());
        assert_eq!(list.realm(), "r");
    }

    #[test]
    fn test_existence_follows_task_order() {
        let mut list = UpdatesList::fetched(stored());
        list.add(UpdateTask::remove());
        assert!(!list.exists_now());
        list.add(UpdateTask::add(|_| {}));
        assert!(list.exists_now());
    }

    #[test]
    fn test_replace_on_absent_key_does_not_create() {
        let placeholder = EntityWrapper::new(SessionEntity::placeholder("s", false));
        let mut list = UpdatesList::absent(placeholder, PersistenceState::Persistent);
        list.add(UpdateTask::replace(|e| e.user_id = Some("x".into())));
        assert!(!list.exists_now());
    }

    #[test]
    fn test_add_fills_placeholder_realm() {
        let placeholder = EntityWrapper::new(SessionEntity::placeholder("s", false));
        let mut list = UpdatesList::absent(placeholder, PersistenceState::Persistent);
        assert_eq!(list.realm(), "");
        list.add(UpdateTask::add(|e| e.realm_id = "realm-a".into()));
        assert_eq!(list.realm(), "realm-a");
    }

    #[test]
    fn test_rebase_replays_tasks_on_fresh_value() {
        let mut list = UpdatesList::fetched(stored());
        list.add(UpdateTask::replace(|e| {
            e.notes.insert("k".into(), "v".into());
        }));

        let mut fresh = stored();
        fresh.version = 9;
        fresh.entity.user_id = Some("changed-elsewhere".into());
        list.rebase(Some(fresh));

        assert_eq!(list.base_version(), Some(9));
        assert_eq!(list.wrapper().entity.user_id.as_deref(), Some("changed-elsewhere"));
        assert_eq!(list.wrapper().entity.notes.get("k").map(String::as_str), Some("v"));
    }
}
