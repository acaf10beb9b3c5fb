use std::collections::BTreeMap;

use super::Segment;
use crate::bin_track::ChromBins;
use crate::expected_ploidy::ReferencePloidy;

/// Rules which force a new segment between two adjacent bins, in addition to the engine
/// breakpoints
pub struct SegmentBoundaryRules<'a> {
    chrom_label: &'a str,
    max_inter_bin_dist: i64,

    /// Sorted midpoints of all forbidden regions on the chromosome
    forbidden_midpoints: Vec<i64>,

    ploidy: Option<&'a ReferencePloidy>,
}

impl<'a> SegmentBoundaryRules<'a> {
    pub fn new(
        chrom_label: &'a str,
        max_inter_bin_dist: i64,
        forbidden_intervals: Vec<(i64, i64)>,
        ploidy: Option<&'a ReferencePloidy>,
    ) -> Self {
        let mut forbidden_midpoints = forbidden_intervals
            .into_iter()
            .map(|(start, end)| start + (end - start) / 2)
            .collect::<Vec<_>>();
        forbidden_midpoints.sort_unstable();
        Self {
            chrom_label,
            max_inter_bin_dist,
            forbidden_midpoints,
            ploidy,
        }
    }

    /// True if any forbidden region midpoint is in the open interval (`prev_end`, `end`)
    fn is_forbidden_midpoint_between(&self, prev_end: i64, end: i64) -> bool {
        let index = self.forbidden_midpoints.partition_point(|&x| x <= prev_end);
        self.forbidden_midpoints
            .get(index)
            .is_some_and(|&midpoint| midpoint < end)
    }

    /// True if a new segment must start at the current bin, regardless of the engine breakpoints
    ///
    /// # Arguments
    /// * `prev_end` - End of the previous bin
    /// * `start` - Start of the current bin
    /// * `end` - End of the current bin
    ///
    fn is_forced_boundary(&self, prev_end: i64, start: i64, end: i64) -> bool {
        if start - prev_end > self.max_inter_bin_dist {
            return true;
        }
        if self.is_forbidden_midpoint_between(prev_end, end) {
            return true;
        }
        if let Some(ploidy) = self.ploidy
            && !ploidy.is_uniform_ploidy(self.chrom_label, prev_end - 1, start + 1)
        {
            return true;
        }
        false
    }
}

/// Convert bin-index breakpoints into segments
///
/// Walks the bins in order, starting a new segment at every breakpoint and at every bin where
/// `rules` force a boundary.
///
/// # Arguments
/// * `breakpoints` - Sorted indices of the first bin of every segment after the first
///
pub fn get_segments_from_breakpoints(
    bins: &ChromBins,
    breakpoints: &[usize],
    rules: &SegmentBoundaryRules,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    if bins.is_empty() {
        return segments;
    }

    let mut breakpoints = breakpoints.iter().peekable();
    let mut segment = Segment::new(bins.start[0], bins.end[0]);
    for bin_index in 1..bins.len() {
        while breakpoints.next_if(|&&x| x < bin_index).is_some() {}
        let is_breakpoint = breakpoints.next_if_eq(&&bin_index).is_some();

        let (start, end) = (bins.start[bin_index], bins.end[bin_index]);
        if is_breakpoint || rules.is_forced_boundary(bins.end[bin_index - 1], start, end) {
            segments.push(segment);
            segment = Segment::new(start, end);
        } else {
            segment.end = end;
        }
    }
    segments.push(segment);
    segments
}

/// Merge segmentations of the same chromosome from multiple samples
///
/// The merged segments are the finest partition consistent with the boundaries of every input
/// segment. Positions not covered by any input segment are not covered by the output.
///
pub fn split_overlapping_segments(segment_lists: &[Vec<Segment>]) -> Vec<Segment> {
    // Change in the count of covering segments at each boundary position
    let mut boundaries = BTreeMap::new();
    for segment in segment_lists.iter().flatten() {
        *boundaries.entry(segment.start).or_insert(0i64) += 1;
        *boundaries.entry(segment.end).or_insert(0i64) -= 1;
    }

    let mut merged = Vec::new();
    let mut depth = 0;
    let mut last_pos = None;
    for (pos, change) in boundaries {
        if let Some(last_pos) = last_pos
            && depth > 0
            && pos > last_pos
        {
            merged.push(Segment::new(last_pos, pos));
        }
        depth += change;
        last_pos = Some(pos);
    }
    merged
}
