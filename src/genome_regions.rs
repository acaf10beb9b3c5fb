use std::collections::HashMap;
use std::io::BufRead;

use bio::data_structures::interval_tree::{IntervalTree, IntervalTreeIterator};
use camino::Utf8Path;
use log::info;
use simple_error::{SimpleResult, bail, try_with};

use crate::os_utils::get_dynamic_reader;

/// A set of chromosome regions which can be efficiently queried
///
#[derive(Clone)]
pub struct ChromRegions {
    regions: IntervalTree<i64, u8>,
}

impl ChromRegions {
    pub fn new() -> Self {
        Self {
            regions: IntervalTree::new(),
        }
    }

    /// Return true if the start-end range intersects with any regions stored in this object
    ///
    pub fn intersect(&self, start: i64, end: i64) -> bool {
        //find any region that overlaps
        self.regions.find(start..end).next().is_some()
    }

    pub fn find_overlaps(&self, start: i64, end: i64) -> IntervalTreeIterator<'_, i64, u8> {
        self.regions.find(start..end)
    }

    /// All regions as (start, end, value), sorted by position
    pub fn get_sorted_regions(&self) -> Vec<(i64, i64, u8)> {
        let mut regions = self
            .regions
            .find(i64::MIN..i64::MAX)
            .map(|x| (x.interval().start, x.interval().end, *x.data()))
            .collect::<Vec<_>>();
        regions.sort_unstable();
        regions
    }

    /// Add region
    ///
    /// Adds a region with the default value, regions are not collapsed
    ///
    pub fn add_region(&mut self, start: i64, end: i64) {
        self.regions.insert(start..end, Default::default());
    }

    /// Add region value
    ///
    /// Adds a value for a particular region, regions are not collapsed
    ///
    pub fn add_region_value(&mut self, start: i64, end: i64, value: u8) {
        self.regions.insert(start..end, value);
    }
}

#[derive(Clone)]
pub struct GenomeRegions {
    pub chroms: HashMap<String, ChromRegions>,
    pub overlaps_allowed: bool,
}

impl GenomeRegions {
    /// Creates a new genome region lookup
    /// # Arguments
    /// * `overlaps_allowed` - if false, attempts to insert overlapping regions will panic
    pub fn new(overlaps_allowed: bool) -> Self {
        Self {
            chroms: HashMap::new(),
            overlaps_allowed,
        }
    }

    /// Create new object from a bed file, which may be gzip-compressed
    ///
    /// # Arguments
    ///
    /// * `label` - Used to error messages to describe what type of regions file this is
    /// * `overlaps_allowed` - if false, an error is returned if any loaded regions overlap
    /// * `payload_required` - if true, every region must have an integer value in column 5
    ///
    pub fn from_bed(
        filename: &Utf8Path,
        label: &str,
        overlaps_allowed: bool,
        payload_required: bool,
    ) -> SimpleResult<Self> {
        info!("Reading {label} regions from file '{filename}'");

        let mut regions = GenomeRegions::new(overlaps_allowed);
        let reader = get_dynamic_reader(filename, label)?;

        for (line_index, line) in reader.lines().enumerate() {
            let line = try_with!(
                line,
                "Can't parse text from {} regions file: '{}'",
                label,
                filename
            );
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }
            let line_no = line_index + 1;

            let words = line.split('\t').collect::<Vec<_>>();
            if words.len() < 3 {
                bail!(
                    "Expected at least 3 columns on line {} of {} regions file: '{}'",
                    line_no,
                    label,
                    filename
                );
            }
            let chrom = words[0];
            let start = try_with!(
                words[1].parse::<i64>(),
                "Invalid start position on line {} of {} regions file: '{}'",
                line_no,
                label,
                filename
            );
            let end = try_with!(
                words[2].parse::<i64>(),
                "Invalid end position on line {} of {} regions file: '{}'",
                line_no,
                label,
                filename
            );
            if end <= start {
                bail!(
                    "Empty region {}:{}-{} on line {} of {} regions file: '{}'",
                    chrom,
                    start,
                    end,
                    line_no,
                    label,
                    filename
                );
            }
            if !overlaps_allowed && regions.intersect(chrom, start, end) {
                bail!(
                    "Overlapping regions are not allowed, but found overlap at {}:{}-{} on line {} of {} regions file: '{}'",
                    chrom,
                    start,
                    end,
                    line_no,
                    label,
                    filename
                );
            }

            //check if we have a value to load for the track
            if words.len() >= 5 {
                let value = try_with!(
                    words[4].parse::<u8>(),
                    "Invalid value in column 5 on line {} of {} regions file: '{}'",
                    line_no,
                    label,
                    filename
                );
                regions.add_region_value(chrom, start, end, value);
            } else if payload_required {
                bail!(
                    "Missing value in column 5 on line {} of {} regions file: '{}'",
                    line_no,
                    label,
                    filename
                );
            } else {
                regions.add_region(chrom, start, end);
            }
        }

        Ok(regions)
    }

    pub fn get_chrom(&self, chrom: &str) -> Option<&ChromRegions> {
        self.chroms.get(chrom)
    }

    /// Return true if the start-end range intersects any region on `chrom`
    pub fn intersect(&self, chrom: &str, start: i64, end: i64) -> bool {
        self.chroms
            .get(chrom)
            .is_some_and(|x| x.intersect(start, end))
    }

    /// This will add a region with the default value
    /// # Arguments
    /// * `chrom` - the contig string
    /// * `start` - the start coordinate (included)
    /// * `end` - the end coordinates (excluded)
    pub fn add_region(&mut self, chrom: &str, start: i64, end: i64) {
        self.add_region_value(chrom, start, end, Default::default());
    }

    /// This will add a region with the given value
    /// # Arguments
    /// * `chrom` - the contig string
    /// * `start` - the start coordinate (included)
    /// * `end` - the end coordinates (excluded)
    /// * `value` - the value associated with the region
    pub fn add_region_value(&mut self, chrom: &str, start: i64, end: i64, value: u8) {
        let chrom_regions = self
            .chroms
            .entry(chrom.to_owned())
            .or_insert_with(ChromRegions::new);

        if !self.overlaps_allowed && chrom_regions.intersect(start, end) {
            panic!("Overlaps are not allowed but were detected: {chrom} {start} {end}");
        }

        chrom_regions.add_region_value(start, end, value);
    }
}
