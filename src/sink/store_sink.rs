// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sink writing into a [`SessionStore`].
//!
//! # Write modes
//!
//! - [`WriteMode::Versioned`]: creates are `put_if_absent`, replaces are
//!   conditional on the version read at fetch time. A lost race is a
//!   [`ChangelogError::WriteConflict`] unless the store already holds the
//!   exact value we meant to write (a replayed commit).
//! - [`WriteMode::Upsert`]: unconditional writes, for stores that mirror
//!   the primary and never serve conditional reads.

use super::{ChangesSink, PendingChange, SinkFilter};
use async_trait::async_trait;
use crate::entity::{EntityWrapper, SessionEntity};
use crate::error::{ChangelogError, Result};
use crate::merge::MergedUpdate;
use crate::storage::{BulkDeleteFilter, SessionStore};
use crate::task::CacheOperation;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Versioned,
    Upsert,
}

pub struct StoreSink {
    store: Arc<dyn SessionStore>,
    filter: SinkFilter,
    mode: WriteMode,
    pending: Vec<PendingChange>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn SessionStore>, filter: SinkFilter, mode: WriteMode) -> Self {
        Self {
            store,
            filter,
            mode,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn write(&self, key: &str, update: &MergedUpdate) -> Result<()> {
        let store = self.store.as_ref();
        let sink = store.name();
        let op = update.operation.as_str();

        let applied = match (update.operation, self.mode) {
            (CacheOperation::None, _) => return Ok(()),
            (CacheOperation::Remove, _) => {
                store.remove(key).await.map_err(|e| ChangelogError::unavailable(sink, e))?;
                true
            }
            (_, WriteMode::Upsert) => {
                store
                    .put(key, &update.value, update.expiry)
                    .await
                    .map_err(|e| ChangelogError::unavailable(sink, e))?;
                true
            }
            (CacheOperation::Add, WriteMode::Versioned) => store
                .put_if_absent(key, &update.value, update.expiry)
                .await
                .map_err(|e| ChangelogError::unavailable(sink, e))?,
            (CacheOperation::Replace, WriteMode::Versioned) => {
                let expected = update.expected_version.unwrap_or(0);
                store
                    .replace(key, expected, &update.value, update.expiry)
                    .await
                    .map_err(|e| ChangelogError::unavailable(sink, e))?
            }
        };

        if applied {
            crate::metrics::record_sink_write(sink, op, "success");
            return Ok(());
        }

        // Lost the race; fine only if the store already has what we wanted
        let current = store.get(key).await.map_err(|e| ChangelogError::unavailable(sink, e))?;
        if is_replay(current.as_ref(), &update.value) {
            debug!(sink, key, op, "Value already present, treating write as replay");
            crate::metrics::record_sink_write(sink, op, "replay");
            return Ok(());
        }

        warn!(
            sink,
            key,
            op,
            expected = ?update.expected_version,
            found = ?current.as_ref().map(|w| w.version),
            "Concurrent modification detected"
        );
        crate::metrics::record_write_conflict(sink);
        Err(ChangelogError::WriteConflict {
            key: key.to_string(),
            sink: sink.to_string(),
        })
    }
}

fn is_replay(current: Option<&EntityWrapper>, intended: &EntityWrapper) -> bool {
    current.is_some_and(|c| c.entity == intended.entity && c.version >= intended.version)
}

#[async_trait]
impl ChangesSink for StoreSink {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn should_consume_change(&self, entity: &SessionEntity) -> bool {
        self.filter.accepts(entity)
    }

    fn register_change(&mut self, key: &str, update: &MergedUpdate) {
        self.pending.push(PendingChange::Write {
            key: key.to_string(),
            update: update.clone(),
        });
    }

    fn register_bulk_delete(&mut self, filter: &BulkDeleteFilter) {
        if self.filter.accepts_bulk(filter) {
            self.pending.push(PendingChange::BulkDelete(filter.clone()));
        }
    }

    async fn apply_changes(&mut self) -> Result<usize> {
        let pending = std::mem::take(&mut self.pending);
        let mut applied = 0;
        for change in &pending {
            match change {
                PendingChange::Write { key, update } => self.write(key, update).await?,
                PendingChange::BulkDelete(filter) => {
                    let removed = self
                        .store
                        .remove_matching(filter)
                        .await
                        .map_err(|e| ChangelogError::unavailable(self.store.name(), e))?;
                    debug!(sink = self.store.name(), removed, "Applied bulk delete");
                    crate::metrics::record_sink_write(self.store.name(), "bulk_delete", "success");
                }
            }
            applied += 1;
        }
        Ok(applied)
    }
}
