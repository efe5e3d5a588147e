// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Folding a key's staged tasks into one write.
//!
//! The fold is linear over the ordered task list. Existence before the
//! transaction and after the last task decide the operation:
//!
//! | existed | exists now | result |
//! |---------|------------|--------|
//! | no  | no  | nothing written (created then removed, or never created) |
//! | no  | yes | `Add` |
//! | yes | no  | `Remove` |
//! | yes | yes | `Replace` |
//!
//! Expiration loaders run once against the final entity. A loader that
//! reports [`ENTRY_EXPIRED`](crate::storage::ENTRY_EXPIRED) turns the write
//! into a removal.

use crate::changelog::UpdatesList;
use crate::entity::{EntityWrapper, SessionEntity};
use crate::replication::CrossDcStatus;
use crate::storage::{Expiry, IMMORTAL};
use crate::task::CacheOperation;
use std::fmt;
use std::sync::Arc;

/// `(realm, client, entity) -> milliseconds`
pub type ExpirationFn = Arc<dyn Fn(&str, Option<&str>, &SessionEntity) -> i64 + Send + Sync>;

/// Box a loader closure.
pub fn expiration_fn<F>(f: F) -> ExpirationFn
where
    F: Fn(&str, Option<&str>, &SessionEntity) -> i64 + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Lifespan and max-idle loaders, per cache pair.
#[derive(Clone)]
pub struct ExpirationLoaders {
    lifespan: ExpirationFn,
    max_idle: ExpirationFn,
    offline_lifespan: ExpirationFn,
    offline_max_idle: ExpirationFn,
}

impl ExpirationLoaders {
    /// Same loaders for online and offline entities.
    pub fn new(lifespan: ExpirationFn, max_idle: ExpirationFn) -> Self {
        Self {
            offline_lifespan: Arc::clone(&lifespan),
            offline_max_idle: Arc::clone(&max_idle),
            lifespan,
            max_idle,
        }
    }

    /// Nothing ever expires.
    pub fn immortal() -> Self {
        let never = expiration_fn(|_, _, _| IMMORTAL);
        Self::new(Arc::clone(&never), never)
    }

    #[must_use]
    pub fn with_offline(mut self, lifespan: ExpirationFn, max_idle: ExpirationFn) -> Self {
        self.offline_lifespan = lifespan;
        self.offline_max_idle = max_idle;
        self
    }

    pub fn expiry_for(&self, realm: &str, client: Option<&str>, entity: &SessionEntity) -> Expiry {
        let (lifespan, max_idle) = if entity.offline {
            (&self.offline_lifespan, &self.offline_max_idle)
        } else {
            (&self.lifespan, &self.max_idle)
        };
        Expiry::new(lifespan(realm, client, entity), max_idle(realm, client, entity))
    }
}

impl Default for ExpirationLoaders {
    fn default() -> Self {
        Self::immortal()
    }
}

impl fmt::Debug for ExpirationLoaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExpirationLoaders")
    }
}

/// The single write derived from one key's staged tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedUpdate {
    pub operation: CacheOperation,
    /// Final value; version is the one to write
    pub value: EntityWrapper,
    /// Version read at fetch time (`None` for creates)
    pub expected_version: Option<u64>,
    pub expiry: Expiry,
    pub deferrable: bool,
    pub cross_dc: CrossDcStatus,
    pub realm: String,
    pub client: Option<String>,
}

impl MergedUpdate {
    /// Fold `list` into one write, or `None` if nothing needs writing.
    pub fn compute(list: &UpdatesList, loaders: &ExpirationLoaders) -> Option<MergedUpdate> {
        let tasks = list.tasks();
        if tasks.iter().all(|t| t.operation() == CacheOperation::None) {
            return None;
        }

        let existed = list.existed_before();
        let mut exists = list.exists_now();
        let entity = &list.wrapper().entity;

        let expiry = if exists {
            loaders.expiry_for(list.realm(), list.client(), entity)
        } else {
            Expiry::NONE
        };
        if expiry.is_expired() {
            exists = false;
        }

        let base = list.base_version().unwrap_or(0);
        let (operation, version) = match (existed, exists) {
            (false, false) => return None,
            (false, true) => (CacheOperation::Add, 1),
            (true, false) => (CacheOperation::Remove, base),
            (true, true) => (CacheOperation::Replace, base + 1),
        };

        let value = EntityWrapper::with_version(entity.clone(), version);

        let cross_dc = tasks.iter().fold(CrossDcStatus::NotNeeded, |acc, task| {
            // Nothing outranks SYNC; skip asking the rest
            if acc == CrossDcStatus::Sync {
                acc
            } else {
                acc.merge(task.cross_dc_status(&value))
            }
        });

        Some(MergedUpdate {
            operation,
            expected_version: list.base_version(),
            expiry,
            deferrable: tasks.iter().all(|t| t.is_deferrable()),
            cross_dc,
            realm: list.realm().to_string(),
            client: list.client().map(str::to_string),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::PersistenceState;
    use crate::storage::ENTRY_EXPIRED;
    use crate::task::UpdateTask;

    fn absent(id: &str) -> UpdatesList {
        UpdatesList::absent(
            EntityWrapper::new(SessionEntity::placeholder(id, false)),
            PersistenceState::Persistent,
        )
    }

    fn existing(id: &str, version: u64) -> UpdatesList {
        UpdatesList::fetched(EntityWrapper::with_version(SessionEntity::new(id, "r"), version))
    }

    fn set_note(value: &'static str) -> UpdateTask {
        UpdateTask::replace(move |e| {
            e.notes.insert("field".into(), value.into());
        })
    }

    #[test]
    fn test_add_then_replace_is_add_with_last_value() {
        let mut list = absent("k");
        list.add(UpdateTask::add(|e| {
            e.realm_id = "r".into();
            e.notes.insert("field".into(), "v1".into());
        }));
        list.add(set_note("v2"));

        let merged = MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap();

        assert_eq!(merged.operation, CacheOperation::Add);
        assert_eq!(merged.value.entity.notes["field"], "v2");
        assert_eq!(merged.value.version, 1);
        assert_eq!(merged.expected_version, None);
        assert_eq!(merged.realm, "r");
    }

    #[test]
    fn test_add_then_remove_on_absent_key_is_noop() {
        let mut list = absent("k");
        list.add(UpdateTask::add(|_| {}));
        list.add(UpdateTask::remove());
        assert!(MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).is_none());
    }

    #[test]
    fn test_remove_of_existing_key() {
        let mut list = existing("k", 3);
        list.add(set_note("x"));
        list.add(UpdateTask::remove());

        let merged = MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap();
        assert_eq!(merged.operation, CacheOperation::Remove);
        assert_eq!(merged.expected_version, Some(3));
    }

    #[test]
    fn test_remove_then_add_on_existing_key_is_replace() {
        let mut list = existing("k", 3);
        list.add(UpdateTask::remove());
        list.add(UpdateTask::add(|_| {}));

        let merged = MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap();
        assert_eq!(merged.operation, CacheOperation::Replace);
        assert_eq!(merged.value.version, 4);
    }

    #[test]
    fn test_only_none_tasks_writes_nothing() {
        let mut list = existing("k", 1);
        list.add(UpdateTask::none(|e| {
            e.notes.insert("scratch".into(), "1".into());
        }));
        assert!(MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).is_none());
    }

    #[test]
    fn test_no_tasks_writes_nothing() {
        let list = existing("k", 1);
        assert!(MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).is_none());
    }

    #[test]
    fn test_deferrable_only_when_every_task_is() {
        let tracker = Arc::new(crate::replication::LastRefreshTracker::new());
        let mut list = existing("k", 1);
        list.add(UpdateTask::refresh(10, tracker.clone(), 60_000));
        list.add(UpdateTask::refresh(20, tracker.clone(), 60_000));
        assert!(MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap().deferrable);

        list.add(set_note("important"));
        assert!(!MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap().deferrable);
    }

    #[test]
    fn test_cross_dc_status_takes_most_urgent() {
        let mut list = existing("k", 1);
        list.add(set_note("a").with_status(CrossDcStatus::NotNeeded));
        list.add(set_note("b").with_status(CrossDcStatus::Async));
        let merged = MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap();
        assert_eq!(merged.cross_dc, CrossDcStatus::Async);

        list.add(set_note("c").with_status(CrossDcStatus::Sync));
        let merged = MergedUpdate::compute(&list, &ExpirationLoaders::immortal()).unwrap();
        assert_eq!(merged.cross_dc, CrossDcStatus::Sync);
    }

    #[test]
    fn test_loaders_evaluated_against_final_state() {
        let lifespan = expiration_fn(|_, _, e| if e.offline { 1_000 } else { 5_000 });
        let max_idle = expiration_fn(|realm, _, _| if realm == "r" { 300 } else { 0 });
        let loaders = ExpirationLoaders::new(lifespan, max_idle);

        let mut list = existing("k", 1);
        list.add(UpdateTask::replace(|e| e.offline = true));

        let merged = MergedUpdate::compute(&list, &loaders).unwrap();
        assert_eq!(merged.expiry, Expiry::new(1_000, 300));
    }

    #[test]
    fn test_expired_entity_becomes_remove() {
        let loaders = ExpirationLoaders::new(
            expiration_fn(|_, _, _| ENTRY_EXPIRED),
            expiration_fn(|_, _, _| IMMORTAL),
        );

        let mut list = existing("k", 2);
        list.add(set_note("late"));
        let merged = MergedUpdate::compute(&list, &loaders).unwrap();
        assert_eq!(merged.operation, CacheOperation::Remove);

        let mut fresh = absent("n");
        fresh.add(UpdateTask::add(|_| {}));
        assert!(MergedUpdate::compute(&fresh, &loaders).is_none());
    }
}
