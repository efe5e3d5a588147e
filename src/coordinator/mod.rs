// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Changelog engine coordinator.
//!
//! The [`ChangelogEngine`] ties the components together:
//! - the [`SinkTopology`] every commit writes through
//! - the expiration loaders every merge consults
//! - the deferred queue and its background consumer
//! - the preloader that warms a cold node
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use session_changelog::{ChangelogConfig, ChangelogEngine, EngineState, UpdateTask};
//!
//! # #[tokio::main]
//! # async fn main() -> session_changelog::Result<()> {
//! let mut engine = ChangelogEngine::connect(ChangelogConfig::default()).await?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start();
//! engine.preload().await;
//!
//! let mut tx = engine.transaction()?;
//! tx.add_task("s1", false, UpdateTask::replace(|s| s.last_session_refresh += 1)).await?;
//! tx.commit().await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::EngineState;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::changelog::EntityChangeLog;
use crate::config::ChangelogConfig;
use crate::error::{ChangelogError, Result};
use crate::merge::ExpirationLoaders;
use crate::preload::Preloader;
use crate::replication::LastRefreshTracker;
use crate::sink::{DeferredQueue, DeferredStats, SinkTopology};

/// Main changelog engine.
///
/// Cheap to share behind an `Arc`: every transaction borrows the topology
/// and loaders by reference count and owns only its staged state.
pub struct ChangelogEngine {
    pub(super) config: ChangelogConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    pub(super) topology: Arc<SinkTopology>,

    pub(super) loaders: Arc<ExpirationLoaders>,

    /// Producer side handed to transactions, None until started or after shutdown
    pub(super) deferred: Option<DeferredQueue>,

    /// Consumer task, resolves to its totals once drained
    pub(super) consumer: Option<JoinHandle<DeferredStats>>,

    /// Tells the consumer to close its queue and drain
    pub(super) shutdown_tx: watch::Sender<bool>,

    pub(super) preloader: Option<Preloader>,
}

impl ChangelogEngine {
    /// Create an engine over an already-built topology.
    ///
    /// Nothing runs until [`start()`](Self::start).
    pub fn new(config: ChangelogConfig, topology: SinkTopology, loaders: ExpirationLoaders) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state,
            topology: Arc::new(topology),
            loaders: Arc::new(loaders),
            deferred: None,
            consumer: None,
            shutdown_tx,
            preloader: None,
        }
    }

    #[must_use]
    pub fn with_preloader(mut self, preloader: Preloader) -> Self {
        self.preloader = Some(preloader);
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<SinkTopology> {
        &self.topology
    }

    pub fn loaders(&self) -> &Arc<ExpirationLoaders> {
        &self.loaders
    }

    /// Watermarks shared by refresh tasks and the replica policy.
    pub fn refresh_tracker(&self) -> &Arc<LastRefreshTracker> {
        self.topology.refresh_tracker()
    }

    /// Deferred changes waiting for the consumer.
    #[must_use]
    pub fn deferred_depth(&self) -> usize {
        self.deferred.as_ref().map_or(0, DeferredQueue::depth)
    }

    /// A begun transaction bound to this engine.
    pub fn transaction(&self) -> Result<EntityChangeLog> {
        if !self.is_running() {
            return Err(ChangelogError::InvalidState(format!(
                "engine is {}, not accepting transactions",
                self.state()
            )));
        }
        let mut log = EntityChangeLog::new(Arc::clone(&self.topology), Arc::clone(&self.loaders));
        if let Some(queue) = &self.deferred {
            log = log.with_deferred(queue.clone());
        }
        log.begin()?;
        debug!(deferred = self.deferred.is_some(), "Transaction opened");
        Ok(log)
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(state.as_str());
    }
}
