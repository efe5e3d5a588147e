// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Segmented, bounded-concurrency warm-up of a cold store.
//!
//! ```text
//!  NotStarted ──► Loading ──► Completed
//!                    │
//!                    └──────► Aborted   (errors > max_errors)
//! ```
//!
//! The row set is split into [`segment_count`] ranges. Each range is one
//! task on a `JoinSet`, gated by a semaphore so at most `workers` segments
//! run at once. A segment that fails or runs past the stalled timeout
//! counts one error and is retried once. The load aborts (remaining
//! segments are cancelled) as soon as the error count exceeds the budget.
//!
//! Rows are written with `put_if_absent`: anything live traffic created
//! meanwhile wins over the scanned copy.

use super::segments::segment_count;
use super::source::{RowSource, SegmentRange};
use crate::config::ChangelogConfig;
use crate::entity::{EntityWrapper, SessionEntity};
use crate::error::{ChangelogError, Result};
use crate::merge::ExpirationLoaders;
use crate::storage::{Expiry, SessionStore, StorageError};
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotStarted,
    Loading,
    Completed,
    Aborted,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Loading => "loading",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub max_errors: u32,
    pub rows_per_segment: u64,
    pub cache_segments: i32,
    pub workers: usize,
    pub stalled_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from(&ChangelogConfig::default())
    }
}

impl From<&ChangelogConfig> for LoaderConfig {
    fn from(config: &ChangelogConfig) -> Self {
        Self {
            max_errors: config.max_errors,
            rows_per_segment: config.rows_per_segment,
            cache_segments: config.cache_segments,
            workers: config.preload_workers.max(1),
            stalled_timeout: config.stalled_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub segments: u32,
    pub rows_loaded: u64,
    /// Already present in the target, or expired
    pub rows_skipped: u64,
    /// Undecodable payloads
    pub rows_corrupt: u64,
    pub errors: u32,
    pub state: LoadState,
}

impl LoadReport {
    fn empty() -> Self {
        Self {
            segments: 0,
            rows_loaded: 0,
            rows_skipped: 0,
            rows_corrupt: 0,
            errors: 0,
            state: LoadState::NotStarted,
        }
    }

    /// Fold another job's report into this one.
    pub fn absorb(&mut self, other: &LoadReport) {
        self.segments += other.segments;
        self.rows_loaded += other.rows_loaded;
        self.rows_skipped += other.rows_skipped;
        self.rows_corrupt += other.rows_corrupt;
        self.errors += other.errors;
        self.state = other.state;
    }
}

impl Default for LoadReport {
    fn default() -> Self {
        Self::empty()
    }
}

/// Row counters shared by all segment tasks.
#[derive(Debug, Default)]
struct RowCounters {
    loaded: AtomicU64,
    skipped: AtomicU64,
    corrupt: AtomicU64,
}

pub struct SegmentedBulkLoader {
    source: Arc<dyn RowSource>,
    target: Arc<dyn SessionStore>,
    loaders: Arc<ExpirationLoaders>,
    config: LoaderConfig,
    state: watch::Sender<LoadState>,
}

impl SegmentedBulkLoader {
    pub fn new(source: Arc<dyn RowSource>, target: Arc<dyn SessionStore>, config: LoaderConfig) -> Self {
        let (state, _) = watch::channel(LoadState::NotStarted);
        Self {
            source,
            target,
            loaders: Arc::new(ExpirationLoaders::immortal()),
            config,
            state,
        }
    }

    /// Give loaded entries the same expiry a commit would.
    #[must_use]
    pub fn with_loaders(mut self, loaders: Arc<ExpirationLoaders>) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> LoadState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LoadState) {
        self.state.send_replace(state);
        crate::metrics::set_preload_state(state.as_str());
    }

    /// Run the load to a terminal state.
    ///
    /// Exceeding the error budget returns [`ChangelogError::LoadAborted`];
    /// the target keeps whatever was loaded before the abort.
    #[tracing::instrument(skip(self), fields(target = %self.target.name()))]
    pub async fn load(&self) -> Result<LoadReport> {
        if self.state() != LoadState::NotStarted {
            return Err(ChangelogError::InvalidState(format!("loader already {}", self.state())));
        }
        self.set_state(LoadState::Loading);
        let started = Instant::now();

        let total = match self.source.total_rows().await {
            Ok(total) => total,
            Err(e) => {
                error!(error = %e, "Could not size the row source");
                self.set_state(LoadState::Aborted);
                return Err(e.into());
            }
        };
        let segments = segment_count(total, self.config.rows_per_segment, self.config.cache_segments);
        info!(total, segments, workers = self.config.workers, "Preload started");

        let counters = Arc::new(RowCounters::default());
        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for range in SegmentRange::split(total, segments) {
            let source = Arc::clone(&self.source);
            let target = Arc::clone(&self.target);
            let loaders = Arc::clone(&self.loaders);
            let counters = Arc::clone(&counters);
            let permits = Arc::clone(&permits);
            let stalled = self.config.stalled_timeout;

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return 1;
                };
                load_with_retry(source.as_ref(), target.as_ref(), &loaders, &counters, range, stalled).await
            });
        }

        let mut errors = 0u32;
        while let Some(joined) = tasks.join_next().await {
            errors += match joined {
                Ok(segment_errors) => segment_errors,
                Err(e) => {
                    warn!(error = %e, "Segment task died");
                    1
                }
            };
            if errors > self.config.max_errors {
                tasks.abort_all();
                self.set_state(LoadState::Aborted);
                crate::metrics::record_preload_phase("aborted", started.elapsed());
                error!(errors, max_errors = self.config.max_errors, "Preload aborted, falling back to lazy fill");
                return Err(ChangelogError::LoadAborted {
                    errors,
                    max_errors: self.config.max_errors,
                });
            }
        }

        let report = LoadReport {
            segments,
            rows_loaded: counters.loaded.load(Ordering::Relaxed),
            rows_skipped: counters.skipped.load(Ordering::Relaxed),
            rows_corrupt: counters.corrupt.load(Ordering::Relaxed),
            errors,
            state: LoadState::Completed,
        };
        self.set_state(LoadState::Completed);
        crate::metrics::record_preload_phase("completed", started.elapsed());
        crate::metrics::record_rows_loaded(report.rows_loaded, report.rows_skipped, report.rows_corrupt);
        info!(
            segments,
            loaded = report.rows_loaded,
            skipped = report.rows_skipped,
            corrupt = report.rows_corrupt,
            errors,
            elapsed = ?started.elapsed(),
            "Preload completed"
        );
        Ok(report)
    }
}

/// Up to two attempts. Returns the number of failed attempts.
async fn load_with_retry(
    source: &dyn RowSource,
    target: &dyn SessionStore,
    loaders: &ExpirationLoaders,
    counters: &RowCounters,
    range: SegmentRange,
    stalled: Duration,
) -> u32 {
    let mut failures = 0;
    for attempt in 1..=2u32 {
        let outcome = tokio::time::timeout(stalled, load_segment(source, target, loaders, counters, range)).await;
        let error = match outcome {
            Ok(Ok(())) => {
                crate::metrics::record_segment(if attempt == 1 { "loaded" } else { "retried" });
                return failures;
            }
            Ok(Err(e)) => ChangelogError::from(e),
            Err(_) => ChangelogError::SegmentStalled {
                segment: range.index,
                timeout: stalled,
            },
        };
        failures += 1;
        crate::metrics::record_segment("failed");
        warn!(segment = range.index, attempt, error = %error, "Segment failed");
    }
    failures
}

async fn load_segment(
    source: &dyn RowSource,
    target: &dyn SessionStore,
    loaders: &ExpirationLoaders,
    counters: &RowCounters,
    range: SegmentRange,
) -> std::result::Result<(), StorageError> {
    let mut rows = source.rows(range);
    while let Some(row) = rows.next().await {
        let (key, raw) = row?;
        let entity = match SessionEntity::decode(&raw) {
            Ok(entity) => entity,
            Err(e) => {
                debug!(key, error = %e, "Skipping undecodable row");
                counters.corrupt.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let expiry: Expiry = loaders.expiry_for(&entity.realm_id, None, &entity);
        if expiry.is_expired() {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if target.put_if_absent(&key, &EntityWrapper::new(entity), expiry).await? {
            counters.loaded.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}
