// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row sources feeding the bulk loader.

use async_trait::async_trait;
use futures::stream::BoxStream;
use crate::storage::StorageError;

/// A sub-range of the total row set, in source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub index: u32,
    pub offset: u64,
    pub limit: u64,
}

impl SegmentRange {
    /// Split `total_rows` into `segments` contiguous ranges.
    /// Trailing ranges may be empty when rows don't divide evenly.
    pub fn split(total_rows: u64, segments: u32) -> Vec<SegmentRange> {
        let segments = segments.max(1);
        let per = total_rows.div_ceil(u64::from(segments)).max(1);
        (0..segments)
            .map(|index| {
                let offset = (u64::from(index) * per).min(total_rows);
                let limit = per.min(total_rows - offset);
                SegmentRange { index, offset, limit }
            })
            .collect()
    }
}

/// `(key, raw payload)` pairs for one segment.
pub type RowStream<'a> = BoxStream<'a, Result<(String, Vec<u8>), StorageError>>;

/// External collaborator the loader scans.
///
/// `rows` must be lazy, finite and restartable: calling it again with the
/// same range starts the segment over.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn total_rows(&self) -> Result<u64, StorageError>;

    fn rows(&self, range: SegmentRange) -> RowStream<'_>;
}
