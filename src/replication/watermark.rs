// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-refresh watermarks.
//!
//! Refreshing a session's timestamp is the most frequent write there is.
//! The replica only needs a new timestamp once the copy it holds could
//! expire before ours, so we remember what we last sent and skip the rest.

use crate::replication::CrossDcStatus;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct LastRefreshTracker {
    watermarks: DashMap<String, i64>,
}

impl LastRefreshTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Sync` once half the idle timeout has passed since the last
    /// propagated refresh (or since `started`, if none was propagated).
    pub fn status_for_refresh(
        &self,
        id: &str,
        started: i64,
        new_refresh: i64,
        idle_timeout_ms: i64,
    ) -> CrossDcStatus {
        let last_known = self.last_propagated(id).unwrap_or(started);
        if last_known.saturating_add(idle_timeout_ms / 2) <= new_refresh {
            CrossDcStatus::Sync
        } else {
            CrossDcStatus::NotNeeded
        }
    }

    /// Remember that the replica has seen `timestamp`. Never moves backwards.
    pub fn record_propagated(&self, id: &str, timestamp: i64) {
        self.watermarks
            .entry(id.to_string())
            .and_modify(|ts| *ts = (*ts).max(timestamp))
            .or_insert(timestamp);
    }

    pub fn last_propagated(&self, id: &str) -> Option<i64> {
        self.watermarks.get(id).map(|ts| *ts)
    }

    pub fn forget(&self, id: &str) {
        self.watermarks.remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }
}
