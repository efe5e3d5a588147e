// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staged mutations.
//!
//! An [`UpdateTask`] is a plain record of closures: what to do to the staged
//! entity, which storage operation that amounts to, and how urgently the
//! result must reach the cross-DC replica.
//!
//! # Example
//!
//! ```
//! use session_changelog::{CacheOperation, CrossDcStatus, UpdateTask};
//!
//! let task = UpdateTask::replace(|entity| {
//!     entity.notes.insert("acr".into(), "1".into());
//! })
//! .with_status(CrossDcStatus::Async);
//!
//! assert_eq!(task.operation(), CacheOperation::Replace);
//! assert!(!task.is_deferrable());
//! ```

use crate::entity::{EntityWrapper, SessionEntity};
use crate::replication::{CrossDcStatus, LastRefreshTracker};
use std::fmt;
use std::sync::Arc;

/// Storage effect of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOperation {
    /// No storage effect (state read, touch without change)
    None,
    Add,
    Remove,
    Replace,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
        }
    }
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ApplyFn = Arc<dyn Fn(&mut SessionEntity) + Send + Sync>;
type CrossDcFn = Arc<dyn Fn(&EntityWrapper) -> CrossDcStatus + Send + Sync>;

/// One staged mutation. Immutable once added to a changelog.
#[derive(Clone)]
pub struct UpdateTask {
    apply: ApplyFn,
    operation: CacheOperation,
    cross_dc: CrossDcFn,
    deferrable: bool,
}

impl UpdateTask {
    /// Task with `operation` and `apply`, replicated synchronously.
    pub fn new<F>(operation: CacheOperation, apply: F) -> Self
    where
        F: Fn(&mut SessionEntity) + Send + Sync + 'static,
    {
        Self {
            apply: Arc::new(apply),
            operation,
            cross_dc: Arc::new(|_| CrossDcStatus::Sync),
            deferrable: false,
        }
    }

    /// Create the entity, initialising it with `apply`.
    pub fn add<F>(apply: F) -> Self
    where
        F: Fn(&mut SessionEntity) + Send + Sync + 'static,
    {
        Self::new(CacheOperation::Add, apply)
    }

    pub fn replace<F>(apply: F) -> Self
    where
        F: Fn(&mut SessionEntity) + Send + Sync + 'static,
    {
        Self::new(CacheOperation::Replace, apply)
    }

    pub fn remove() -> Self {
        Self::new(CacheOperation::Remove, |_| {})
    }

    /// Mutation that must not be written (request-scoped bookkeeping).
    pub fn none<F>(apply: F) -> Self
    where
        F: Fn(&mut SessionEntity) + Send + Sync + 'static,
    {
        Self::new(CacheOperation::None, apply).with_status(CrossDcStatus::NotNeeded)
    }

    /// Bump `last_session_refresh`. Low priority: applied through the
    /// deferred queue, and only replicated once the replica's copy is
    /// stale enough to matter.
    pub fn refresh(timestamp: i64, tracker: Arc<LastRefreshTracker>, idle_timeout_ms: i64) -> Self {
        Self::replace(move |entity| {
            entity.last_session_refresh = entity.last_session_refresh.max(timestamp);
        })
        .with_cross_dc(move |wrapper| {
            tracker.status_for_refresh(
                &wrapper.entity.id,
                wrapper.entity.started,
                timestamp,
                idle_timeout_ms,
            )
        })
        .deferrable()
    }

    #[must_use]
    pub fn with_cross_dc<F>(mut self, f: F) -> Self
    where
        F: Fn(&EntityWrapper) -> CrossDcStatus + Send + Sync + 'static,
    {
        self.cross_dc = Arc::new(f);
        self
    }

    #[must_use]
    pub fn with_status(self, status: CrossDcStatus) -> Self {
        self.with_cross_dc(move |_| status)
    }

    /// Mark as low priority.
    #[must_use]
    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    pub fn apply(&self, entity: &mut SessionEntity) {
        (self.apply)(entity)
    }

    #[must_use]
    pub fn operation(&self) -> CacheOperation {
        self.operation
    }

    pub fn cross_dc_status(&self, wrapper: &EntityWrapper) -> CrossDcStatus {
        (self.cross_dc)(wrapper)
    }

    #[must_use]
    pub fn is_deferrable(&self) -> bool {
        self.deferrable
    }
}

impl fmt::Debug for UpdateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateTask")
            .field("operation", &self.operation)
            .field("deferrable", &self.deferrable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mutates_entity() {
        let task = UpdateTask::replace(|e| e.user_id = Some("bob".into()));
        let mut entity = SessionEntity::new("s", "r");
        task.apply(&mut entity);
        assert_eq!(entity.user_id.as_deref(), Some("bob"));
    }

    #[test]
    fn test_defaults_are_sync_and_high_priority() {
        let task = UpdateTask::remove();
        let wrapper = EntityWrapper::new(SessionEntity::new("s", "r"));
        assert_eq!(task.operation(), CacheOperation::Remove);
        assert_eq!(task.cross_dc_status(&wrapper), CrossDcStatus::Sync);
        assert!(!task.is_deferrable());
    }

    #[test]
    fn test_none_task_not_replicated() {
        let task = UpdateTask::none(|_| {});
        let wrapper = EntityWrapper::new(SessionEntity::new("s", "r"));
        assert_eq!(task.cross_dc_status(&wrapper), CrossDcStatus::NotNeeded);
    }

    #[test]
    fn test_refresh_never_moves_timestamp_back() {
        let tracker = Arc::new(LastRefreshTracker::new());
        let mut entity = SessionEntity::new("s", "r");
        entity.last_session_refresh = 5_000;

        UpdateTask::refresh(4_000, tracker.clone(), 60_000).apply(&mut entity);
        assert_eq!(entity.last_session_refresh, 5_000);

        UpdateTask::refresh(9_000, tracker, 60_000).apply(&mut entity);
        assert_eq!(entity.last_session_refresh, 9_000);
    }

    #[test]
    fn test_refresh_is_deferrable() {
        let task = UpdateTask::refresh(1, Arc::new(LastRefreshTracker::new()), 1_000);
        assert!(task.is_deferrable());
        assert_eq!(task.operation(), CacheOperation::Replace);
    }
}
