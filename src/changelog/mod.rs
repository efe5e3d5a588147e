// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The per-transaction changelog.
//!
//! An [`EntityChangeLog`] stages every mutation a transaction makes to
//! session entities. Nothing touches a store until [`commit`], which folds
//! each key's tasks into one [`MergedUpdate`](crate::merge::MergedUpdate)
//! and routes it to the sinks of the deployment.
//!
//! ```text
//!   read / add_task / add_bulk_delete      commit()
//!   ─────────────────────────────────      ────────────────────────────
//!   key ─► UpdatesList { tasks.. }   ──►   merge ─► deferred queue
//!   bulk delete ─► marker in order                └► sinks, in log order
//! ```
//!
//! The log is owned by one task at a time (`&mut self` everywhere), so no
//! locking happens inside a transaction.
//!
//! [`commit`]: EntityChangeLog::commit

mod api;
mod commit;
mod updates;

pub use commit::CommitReport;
pub use updates::{PersistenceState, UpdatesList};
pub(crate) use updates::LogSlot;

use crate::error::{ChangelogError, Result};
use crate::merge::ExpirationLoaders;
use crate::replication::LastRefreshTracker;
use crate::sink::{DeferredQueue, SinkTopology};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotBegun,
    Active,
    Committed,
    /// Commit attempted and a required sink failed
    Failed,
    RolledBack,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotBegun => "not_begun",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct EntityChangeLog {
    topology: Arc<SinkTopology>,
    loaders: Arc<ExpirationLoaders>,
    deferred: Option<DeferredQueue>,
    updates: HashMap<String, UpdatesList>,
    order: Vec<LogSlot>,
    state: TxState,
    rollback_only: bool,
}

impl EntityChangeLog {
    pub fn new(topology: Arc<SinkTopology>, loaders: Arc<ExpirationLoaders>) -> Self {
        Self {
            topology,
            loaders,
            deferred: None,
            updates: HashMap::new(),
            order: Vec::new(),
            state: TxState::NotBegun,
            rollback_only: false,
        }
    }

    /// Route deferrable updates through `queue` instead of writing inline.
    #[must_use]
    pub fn with_deferred(mut self, queue: DeferredQueue) -> Self {
        self.deferred = Some(queue);
        self
    }

    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            TxState::NotBegun => {
                self.state = TxState::Active;
                Ok(())
            }
            other => Err(ChangelogError::InvalidState(format!(
                "cannot begin a transaction that is {}",
                other
            ))),
        }
    }

    /// Discard everything staged. Safe to call more than once.
    pub fn rollback(&mut self) {
        if self.state == TxState::Active {
            crate::metrics::record_rollback();
        }
        self.updates.clear();
        self.order.clear();
        self.state = TxState::RolledBack;
    }

    /// Make the eventual commit fail instead of writing.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn refresh_tracker(&self) -> &Arc<LastRefreshTracker> {
        self.topology.refresh_tracker()
    }

    /// Keys with staged state.
    #[must_use]
    pub fn staged_keys(&self) -> usize {
        self.updates.len()
    }

    /// Bulk deletes recorded in this transaction.
    #[must_use]
    pub fn bulk_deletes(&self) -> usize {
        self.order
            .iter()
            .filter(|slot| matches!(slot, LogSlot::BulkDelete(_)))
            .count()
    }

    fn require_active(&self) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(ChangelogError::InvalidState(format!(
                "transaction is {}, not active",
                self.state
            )))
        }
    }
}

impl fmt::Debug for EntityChangeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityChangeLog")
            .field("state", &self.state)
            .field("staged_keys", &self.updates.len())
            .field("slots", &self.order.len())
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}
