// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit: merge every staged key and route the result.

use super::{EntityChangeLog, LogSlot, TxState};
use crate::error::{ChangelogError, Result};
use crate::merge::MergedUpdate;
use crate::sink::DeferredChange;
use tracing::{debug, error, warn};

/// What one commit did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Merged updates registered with the inline sinks
    pub written: usize,
    /// Merged updates handed to the deferred queue
    pub deferred: usize,
    pub bulk_deletes: usize,
    /// Keys whose tasks merged to nothing
    pub no_ops: usize,
    pub transient: usize,
}

impl EntityChangeLog {
    /// Write the merged result of every staged key to the sinks, in log order.
    ///
    /// Fails with [`ChangelogError::RollbackOnly`] after
    /// [`set_rollback_only`](Self::set_rollback_only). A failing required sink
    /// fails the commit; best-effort sinks only log. The log is discarded
    /// either way.
    #[tracing::instrument(skip(self), fields(keys = self.updates.len(), slots = self.order.len()))]
    pub async fn commit(&mut self) -> Result<CommitReport> {
        if self.rollback_only {
            self.updates.clear();
            self.order.clear();
            self.state = TxState::Failed;
            crate::metrics::record_commit("rollback_only");
            return Err(ChangelogError::RollbackOnly);
        }
        self.require_active()?;
        let _timer = crate::time_operation!("changelog", "commit");

        let mut sinks = self.topology.build_sinks();
        let mut updates = std::mem::take(&mut self.updates);
        let order = std::mem::take(&mut self.order);
        let mut report = CommitReport::default();

        for slot in order {
            let key = match slot {
                LogSlot::BulkDelete(filter) => {
                    for sink in sinks.iter_mut() {
                        sink.register_bulk_delete(&filter);
                    }
                    report.bulk_deletes += 1;
                    continue;
                }
                LogSlot::Key(key) => key,
            };
            let Some(list) = updates.remove(&key) else {
                continue;
            };
            if list.is_transient() {
                report.transient += 1;
                continue;
            }
            let Some(merged) = MergedUpdate::compute(&list, &self.loaders) else {
                report.no_ops += 1;
                crate::metrics::record_merged_operation("noop");
                continue;
            };
            crate::metrics::record_merged_operation(merged.operation.as_str());

            if merged.deferrable {
                if let Some(queue) = &self.deferred {
                    let change = DeferredChange::new(key, merged, list.tasks().to_vec());
                    match queue.submit(change).await {
                        Ok(()) => {
                            report.deferred += 1;
                            continue;
                        }
                        Err(change) => {
                            warn!(key = %change.key, "Deferred queue closed, writing inline");
                            register(&mut sinks, &change.key, &change.update);
                            report.written += 1;
                            continue;
                        }
                    }
                }
            }

            register(&mut sinks, &key, &merged);
            report.written += 1;
        }

        for sink in sinks.iter_mut() {
            match sink.apply_changes().await {
                Ok(applied) => debug!(sink = sink.name(), applied, "Sink applied"),
                Err(e) if sink.is_best_effort() => {
                    warn!(sink = sink.name(), error = %e, "Best-effort sink failed");
                }
                Err(e) => {
                    error!(sink = sink.name(), error = %e, "Commit failed");
                    self.state = TxState::Failed;
                    crate::metrics::record_commit("failed");
                    return Err(e);
                }
            }
        }

        self.state = TxState::Committed;
        crate::metrics::record_commit("success");
        Ok(report)
    }
}

fn register(sinks: &mut [Box<dyn crate::sink::ChangesSink>], key: &str, update: &MergedUpdate) {
    for sink in sinks.iter_mut() {
        if sink.should_consume_change(&update.value.entity) {
            sink.register_change(key, update);
        }
    }
}
