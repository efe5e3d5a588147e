// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the changelog engine.
//!
//! # Error Categories
//!
//! | Error Type | Surfaces to | Description |
//! |------------|-------------|-------------|
//! | `WriteConflict` | commit caller | Optimistic create/replace lost a race at a sink |
//! | `SinkUnavailable` | commit caller | A synchronous sink could not be reached |
//! | `ReplicationFailed` | logs only | Cross-DC replica write failed |
//! | `LoadAborted` | preloader | Bulk load exceeded its error budget |
//! | `LockTimeout` | preloader | Preload lock not acquired in time |
//! | `SegmentStalled` | loader | One segment exceeded its deadline |
//! | `RollbackOnly` | commit caller | Commit of a transaction marked rollback-only |
//! | `InvalidState` | caller | Lifecycle misuse (commit twice, begin twice) |
//!
//! # Retry Behavior
//!
//! [`ChangelogError::is_retryable()`] is true for transient backend trouble.
//! A `WriteConflict` is not retryable as-is: the caller must re-read and
//! either accept the winner's value or retry with a fresh version.

use crate::storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for changelog operations.
pub type Result<T> = std::result::Result<T, ChangelogError>;

#[derive(Error, Debug)]
pub enum ChangelogError {
    /// An optimistic write lost a race.
    #[error("Write conflict on '{key}' at sink {sink}")]
    WriteConflict { key: String, sink: String },

    /// A synchronous sink failed; the enclosing commit fails.
    #[error("Sink {sink} unavailable: {source}")]
    SinkUnavailable {
        sink: String,
        #[source]
        source: StorageError,
    },

    /// Replica write failed. Logged, never returned from a commit.
    #[error("Replication to {cache} failed: {message}")]
    ReplicationFailed { cache: String, message: String },

    #[error("Bulk load aborted after {errors} errors (budget {max_errors})")]
    LoadAborted { errors: u32, max_errors: u32 },

    #[error("Lock '{lock}' not acquired within {waited:?}")]
    LockTimeout { lock: String, waited: Duration },

    #[error("Segment {segment} stalled after {timeout:?}")]
    SegmentStalled { segment: u32, timeout: Duration },

    /// Commit attempted after `set_rollback_only`.
    #[error("Transaction is marked rollback-only")]
    RollbackOnly,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ChangelogError {
    /// Wrap a backend failure with the name of the sink it came from.
    pub fn unavailable(sink: impl Into<String>, source: StorageError) -> Self {
        Self::SinkUnavailable {
            sink: sink.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SinkUnavailable { .. } => true,
            Self::ReplicationFailed { .. } => true,
            Self::SegmentStalled { .. } => true,
            Self::LockTimeout { .. } => true,
            Self::Storage(e) => e.is_retryable(),
            Self::WriteConflict { .. } => false, // re-read first
            Self::LoadAborted { .. } => false,
            Self::RollbackOnly => false,
            Self::InvalidState(_) => false,
            Self::Config(_) => false,
        }
    }
}
