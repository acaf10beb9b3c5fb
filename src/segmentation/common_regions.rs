//! Common CNV region handling
//!
//! Common CNV regions are mapped from genomic coordinates onto bin index ranges, and any
//! breakpoint falling strictly inside such a range is replaced by the range boundaries.
//!

use std::ops::Range;

use crate::bin_track::ChromBins;

/// Maximum distance from a common CNV region boundary to the matching bin boundary
const MAX_COMMON_REGION_BIN_DIST: i64 = 10_000;

/// Index of the value in sorted `positions` nearest to `target`, if within the matching distance
///
/// Ties are resolved to the lower index.
///
fn get_nearest_index(positions: &[i64], target: i64) -> Option<usize> {
    let upper = positions.partition_point(|&x| x < target);
    let lower = upper.checked_sub(1);
    let nearest = [lower, Some(upper)]
        .into_iter()
        .flatten()
        .filter(|&i| i < positions.len())
        .min_by_key(|&i| (positions[i] - target).abs())?;
    if (positions[nearest] - target).abs() <= MAX_COMMON_REGION_BIN_DIST {
        Some(nearest)
    } else {
        None
    }
}

/// Map common CNV regions onto bin index ranges
///
/// Each region start is matched to the nearest bin start, and each region end to the nearest bin
/// end. Regions without a bin boundary close enough to either end are skipped.
///
/// # Arguments
/// * `intervals` - Common CNV regions on this chromosome as (start, end)
///
pub fn remap_common_regions(intervals: &[(i64, i64)], bins: &ChromBins) -> Vec<Range<usize>> {
    intervals
        .iter()
        .filter_map(|&(start, end)| {
            let start_index = get_nearest_index(&bins.start, start)?;
            let end_index = get_nearest_index(&bins.end, end)?;
            if end_index < start_index {
                None
            } else {
                Some(start_index..end_index + 1)
            }
        })
        .collect()
}

/// Merge common CNV ranges into the breakpoint list
///
/// A breakpoint strictly inside a common CNV range is replaced by the start and end of that
/// range. Returns sorted unique breakpoints, excluding the chromosome boundaries.
///
pub fn overlap_common_regions(
    breakpoints: &[usize],
    common_ranges: &[Range<usize>],
    bin_count: usize,
) -> Vec<usize> {
    let mut merged = Vec::new();
    for &breakpoint in breakpoints {
        let mut is_replaced = false;
        for range in common_ranges
            .iter()
            .filter(|x| x.start < breakpoint && breakpoint < x.end)
        {
            merged.push(range.start);
            merged.push(range.end);
            is_replaced = true;
        }
        if !is_replaced {
            merged.push(breakpoint);
        }
    }
    merged.retain(|&x| x > 0 && x < bin_count);
    merged.sort_unstable();
    merged.dedup();
    merged
}
