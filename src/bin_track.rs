//! Binned genome signal input
//!

use std::collections::HashMap;
use std::io::BufRead;

use camino::Utf8Path;
use log::info;
use serde::{Deserialize, Serialize};
use simple_error::{SimpleResult, bail, try_with};
use thousands::Separable;

use crate::genome_regions::GenomeRegions;
use crate::numeric_utils::get_finite_indices;
use crate::os_utils::get_dynamic_reader;

/// Chromosome names in enumeration order
///
/// Chromosome index order is the order of first appearance in the input, and determines both the
/// output order and the per-chromosome random seed assignment.
///
#[derive(Default)]
pub struct ChromList {
    pub labels: Vec<String>,
    pub label_to_index: HashMap<String, usize>,
}

impl ChromList {
    /// Get the index of a chromosome, adding it to the end of the list if it is new
    pub fn get_or_insert(&mut self, label: &str) -> usize {
        if let Some(&chrom_index) = self.label_to_index.get(label) {
            return chrom_index;
        }
        let chrom_index = self.labels.len();
        self.labels.push(label.to_string());
        self.label_to_index.insert(label.to_string(), chrom_index);
        chrom_index
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Bins of one chromosome, stored as parallel vectors sorted by start position
///
/// Each bin spans the zero-indexed half-open interval `start..end`.
///
#[derive(Clone, Debug, Default)]
pub struct ChromBins {
    pub start: Vec<i64>,
    pub end: Vec<i64>,
    pub score: Vec<f64>,
}

impl ChromBins {
    pub fn len(&self) -> usize {
        self.start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
    }

    fn push(&mut self, start: i64, end: i64, score: f64) {
        self.start.push(start);
        self.end.push(end);
        self.score.push(score);
    }

    /// Copy of these bins restricted to the given indices
    fn select(&self, indices: &[usize]) -> Self {
        Self {
            start: indices.iter().map(|&i| self.start[i]).collect(),
            end: indices.iter().map(|&i| self.end[i]).collect(),
            score: indices.iter().map(|&i| self.score[i]).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BinLoadStats {
    pub input_bin_count: usize,
    pub forbidden_bin_count: usize,
    pub nonfinite_bin_count: usize,
    pub usable_bin_count: usize,
}

/// Binned signal track for one sample
pub struct GenomicBinTrack {
    pub sample_name: String,

    /// Bins indexed by chromosome index
    pub chroms: Vec<ChromBins>,

    pub load_stats: BinLoadStats,
}

impl GenomicBinTrack {
    /// Extend the chromosome vector to cover every chromosome in `chrom_list`
    pub fn resize(&mut self, chrom_list: &ChromList) {
        self.chroms.resize_with(chrom_list.len(), Default::default);
    }
}

/// Derive a sample name from a bin filename by removing directories and known extensions
pub fn get_sample_name(filename: &Utf8Path) -> String {
    let mut name = filename.file_name().unwrap_or(filename.as_str());
    for suffix in [".gz", ".bgz", ".bed", ".tsv", ".txt", ".bins", ".partitioned"] {
        if let Some(x) = name.strip_suffix(suffix)
            && !x.is_empty()
        {
            name = x;
        }
    }
    name.to_string()
}

/// Read a tab-delimited bin file with columns `chrom start end score`
///
/// Bins must be grouped by chromosome, sorted by start position and non-overlapping within each
/// chromosome. Bins which intersect a forbidden region, or which have a non-finite score, are dropped.
///
/// New chromosome names are appended to `chrom_list`.
///
pub fn read_bin_track(
    filename: &Utf8Path,
    chrom_list: &mut ChromList,
    forbidden_regions: Option<&GenomeRegions>,
) -> SimpleResult<GenomicBinTrack> {
    info!("Reading bins from file: '{filename}'");

    let reader = get_dynamic_reader(filename, "bin")?;

    let mut load_stats = BinLoadStats::default();
    let mut chroms: Vec<ChromBins> = Vec::new();
    let mut completed_chroms = vec![false; chrom_list.len()];
    let mut last_chrom_index: Option<usize> = None;

    // End of the previous input bin on the current chromosome, including dropped bins
    let mut last_end: Option<i64> = None;

    for (line_index, line) in reader.lines().enumerate() {
        let line = try_with!(line, "Can't read text from bin file: '{}'", filename);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = line_index + 1;

        let words = line.split('\t').collect::<Vec<_>>();
        if words.len() < 4 {
            bail!(
                "Expected at least 4 columns on line {} of bin file '{}'",
                line_no,
                filename
            );
        }
        let chrom = words[0];
        let start = try_with!(
            words[1].parse::<i64>(),
            "Invalid start position on line {} of bin file '{}'",
            line_no,
            filename
        );
        let end = try_with!(
            words[2].parse::<i64>(),
            "Invalid end position on line {} of bin file '{}'",
            line_no,
            filename
        );
        let score = try_with!(
            words[3].parse::<f64>(),
            "Invalid score on line {} of bin file '{}'",
            line_no,
            filename
        );
        if start < 0 || end <= start {
            bail!(
                "Invalid bin interval {}:{}-{} on line {} of bin file '{}'",
                chrom,
                start,
                end,
                line_no,
                filename
            );
        }

        let chrom_index = chrom_list.get_or_insert(chrom);
        if chrom_index >= chroms.len() {
            chroms.resize_with(chrom_index + 1, Default::default);
            completed_chroms.resize(chrom_index + 1, false);
        }
        if last_chrom_index != Some(chrom_index) {
            if completed_chroms[chrom_index] {
                bail!(
                    "Bins for chromosome '{}' are not contiguous in bin file '{}'",
                    chrom,
                    filename
                );
            }
            if let Some(last_chrom_index) = last_chrom_index {
                completed_chroms[last_chrom_index] = true;
            }
            last_chrom_index = Some(chrom_index);
            last_end = None;
        }

        if let Some(last_end) = last_end
            && start < last_end
        {
            bail!(
                "Bin at {}:{} on line {} of bin file '{}' is unsorted or overlaps the previous bin ending at {}",
                chrom,
                start,
                line_no,
                filename,
                last_end
            );
        }
        last_end = Some(end);
        let chrom_bins = &mut chroms[chrom_index];

        load_stats.input_bin_count += 1;
        if let Some(forbidden_regions) = forbidden_regions
            && forbidden_regions.intersect(chrom, start, end)
        {
            load_stats.forbidden_bin_count += 1;
            continue;
        }
        chrom_bins.push(start, end, score);
    }

    let chroms = chroms
        .into_iter()
        .map(|chrom_bins| {
            let finite_indices = get_finite_indices(&chrom_bins.score);
            load_stats.nonfinite_bin_count += chrom_bins.len() - finite_indices.len();
            if finite_indices.len() == chrom_bins.len() {
                chrom_bins
            } else {
                chrom_bins.select(&finite_indices)
            }
        })
        .collect::<Vec<_>>();
    load_stats.usable_bin_count = chroms.iter().map(|x| x.len()).sum();

    info!(
        "Read {} bins from file '{filename}', {} usable after filtering",
        load_stats.input_bin_count.separate_with_commas(),
        load_stats.usable_bin_count.separate_with_commas()
    );

    let mut track = GenomicBinTrack {
        sample_name: get_sample_name(filename),
        chroms,
        load_stats,
    };
    track.resize(chrom_list);
    Ok(track)
}
