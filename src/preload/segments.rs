// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! How many segments a bulk load is split into.

/// Segment count for `total_rows` rows at `rows_per_segment` rows each.
///
/// The raw count is rounded up to a power of two, then capped by the
/// cache's own segment count when that is positive. A non-positive cap
/// means no cap.
///
/// ```
/// use session_changelog::preload::segment_count;
///
/// assert_eq!(segment_count(0, 64, -1), 1);
/// assert_eq!(segment_count(1000, 64, 256), 16);
/// assert_eq!(segment_count(10_000_000, 64, 256), 256);
/// ```
pub fn segment_count(total_rows: u64, rows_per_segment: u64, cache_segments: i32) -> u32 {
    let raw = total_rows.div_ceil(rows_per_segment.max(1)).max(1);
    let segments = raw.checked_next_power_of_two().unwrap_or(1 << 63);
    let segments = u32::try_from(segments).unwrap_or(1 << 31);

    if cache_segments > 0 {
        segments.min(cache_segments as u32)
    } else {
        segments
    }
}
