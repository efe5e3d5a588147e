// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the changelog engine.
//!
//! Uses the `metrics` crate facade; the host process picks the exporter.
//!
//! # Metric Naming Convention
//! - `changelog_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `sink`: store name (local, clustered, sql, replica cache name)
//! - `operation`: add, replace, remove, bulk_delete
//! - `status`/`outcome`: success, conflict, error, rejected, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// TRANSACTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished commit (success, conflict, unavailable, rollback_only)
pub fn record_commit(outcome: &str) {
    counter!("changelog_commits_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_rollback() {
    counter!("changelog_rollbacks_total").increment(1);
}

/// Record the merged operation chosen for one key (add, replace, remove, noop, transient)
pub fn record_merged_operation(operation: &str) {
    counter!("changelog_merged_operations_total", "operation" => operation.to_string())
        .increment(1);
}

/// Keys dropped from the pending log by a bulk delete
pub fn record_bulk_delete(discarded: u64) {
    counter!("changelog_bulk_delete_markers_total").increment(1);
    counter!("changelog_bulk_delete_discarded_total").increment(discarded);
}

// ═══════════════════════════════════════════════════════════════════════════
// SINKS
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_sink_write(sink: &str, operation: &str, status: &str) {
    counter!(
        "changelog_sink_writes_total",
        "sink" => sink.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_write_conflict(sink: &str) {
    counter!("changelog_write_conflicts_total", "sink" => sink.to_string()).increment(1);
}

/// Cache miss served from the durable store (filled, raced)
pub fn record_lazy_fill(store: &str, outcome: &str) {
    counter!(
        "changelog_lazy_fills_total",
        "store" => store.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(scope: &str, operation: &str, duration: Duration) {
    histogram!(
        "changelog_operation_seconds",
        "scope" => scope.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFERRED QUEUE - Low-priority writes applied in batches
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_deferred_enqueued() {
    counter!("changelog_deferred_enqueued_total").increment(1);
}

pub fn set_deferred_queue_depth(depth: usize) {
    gauge!("changelog_deferred_queue_depth").set(depth as f64);
}

pub fn record_deferred_batch(count: usize, trigger: &str) {
    histogram!("changelog_deferred_batch_size").record(count as f64);
    counter!("changelog_deferred_batches_total", "trigger" => trigger.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REPLICATION - Cross-DC replica writes (best-effort)
// ═══════════════════════════════════════════════════════════════════════════

/// status: sync, async, not_needed; outcome: written, skipped, failed, dispatched
pub fn record_replication(cache: &str, status: &str, outcome: &str) {
    counter!(
        "changelog_replication_total",
        "cache" => cache.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_replica_event(kind: &str) {
    counter!("changelog_replica_events_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "changelog_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// PRELOAD - Segmented bulk load on startup
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_preload_phase(phase: &str, duration: Duration) {
    histogram!("changelog_preload_phase_seconds", "phase" => phase.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_preload_state(state: &str) {
    // One gauge per state: 1 = current. A node that lost the lock ends in
    // replica_warm or skipped.
    for s in ["not_started", "loading", "completed", "aborted", "replica_warm", "skipped"] {
        gauge!("changelog_preload_state", "state" => s).set(if s == state { 1.0 } else { 0.0 });
    }
}

/// outcome: completed, failed, stalled, retried
pub fn record_segment(outcome: &str) {
    counter!("changelog_preload_segments_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_rows_loaded(loaded: u64, skipped: u64, corrupt: u64) {
    counter!("changelog_preload_rows_total", "result" => "loaded").increment(loaded);
    counter!("changelog_preload_rows_total", "result" => "skipped").increment(skipped);
    counter!("changelog_preload_rows_total", "result" => "corrupt").increment(corrupt);
}

/// outcome: acquired, contended, timeout, error
pub fn record_lock_attempt(lock: &str, outcome: &str) {
    counter!(
        "changelog_lock_attempts_total",
        "lock" => lock.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

pub fn set_engine_state(state: &str) {
    for s in ["created", "running", "shutting_down", "stopped"] {
        gauge!("changelog_engine_state", "state" => s).set(if s == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    scope: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(scope: &'static str, operation: &'static str) -> Self {
        Self {
            scope,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.scope, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($scope:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($scope, $op)
    };
}
