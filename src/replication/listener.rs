// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Warming the local store from replica change events.
//!
//! A node that did not win the preload lock skips the durable scan and
//! follows the replica instead: every upsert/remove published by the
//! replica's change feed is mirrored into the local store.

use crate::storage::{Expiry, SessionStore, StoreEvent};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ReplicaListener;

impl ReplicaListener {
    /// Mirror events into `local` until the feed closes.
    /// The task resolves to the number of events applied.
    pub fn spawn(
        mut events: broadcast::Receiver<StoreEvent>,
        local: Arc<dyn SessionStore>,
    ) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut applied = 0u64;
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if Self::apply(local.as_ref(), event).await {
                            applied += 1;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Missed keys fall back to lazy fill on first read
                        warn!(missed, store = local.name(), "Replica listener lagged");
                        crate::metrics::record_replica_event("lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!(applied, store = local.name(), "Replica feed closed, listener stopped");
            applied
        })
    }

    async fn apply(local: &dyn SessionStore, event: StoreEvent) -> bool {
        let result = match &event {
            StoreEvent::Upserted { key, wrapper } => {
                crate::metrics::record_replica_event("upserted");
                local.put(key, wrapper, Expiry::NONE).await
            }
            StoreEvent::Removed { key } => {
                crate::metrics::record_replica_event("removed");
                local.remove(key).await.map(|_| ())
            }
        };
        match result {
            Ok(()) => {
                debug!(?event, "Applied replica event");
                true
            }
            Err(e) => {
                warn!(error = %e, ?event, "Failed to apply replica event");
                false
            }
        }
    }
}
