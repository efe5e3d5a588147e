// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sink forwarding committed changes to a cross-DC replica.

use super::{ChangesSink, PendingChange, SinkFilter};
use async_trait::async_trait;
use crate::entity::SessionEntity;
use crate::error::Result;
use crate::merge::MergedUpdate;
use crate::replication::{ReplicationOutcome, ReplicationPolicy};
use crate::storage::BulkDeleteFilter;

pub struct ReplicaSink {
    policy: ReplicationPolicy,
    cache: String,
    filter: SinkFilter,
    pending: Vec<PendingChange>,
}

impl ReplicaSink {
    pub fn new(policy: ReplicationPolicy, cache: impl Into<String>, filter: SinkFilter) -> Self {
        Self {
            policy,
            cache: cache.into(),
            filter,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl ChangesSink for ReplicaSink {
    fn name(&self) -> &str {
        &self.cache
    }

    fn is_best_effort(&self) -> bool {
        true
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

    /// Replica failures are logged by the policy and never fail the commit.
    async fn apply_changes(&mut self) -> Result<usize> {
        let mut forwarded = 0;
        for change in std::mem::take(&mut self.pending) {
            match change {
                PendingChange::Write { key, update } => {
                    match self.policy.replicate(&self.cache, &key, &update).await {
                        ReplicationOutcome::Written | ReplicationOutcome::Dispatched => forwarded += 1,
                        ReplicationOutcome::Skipped | ReplicationOutcome::Failed => {}
                    }
                }
                PendingChange::BulkDelete(filter) => {
                    self.policy.replicate_bulk_delete(&self.cache, &filter);
                    forwarded += 1;
                }
            }
        }
        Ok(forwarded)
    }
}
