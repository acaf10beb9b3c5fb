//! Genome segmentation driver
//!
//! Each chromosome is segmented independently on a worker pool. The selected engine produces
//! bin-index breakpoints for each chromosome, which are merged with any common CNV regions and
//! then converted to genomic segments with the gap, forbidden region and ploidy boundary rules.
//!

mod common_regions;
mod segment_emission;

use std::collections::HashMap;
use std::sync::mpsc::channel;

use log::info;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use self::common_regions::{overlap_common_regions, remap_common_regions};
pub use self::segment_emission::split_overlapping_segments;
use self::segment_emission::{SegmentBoundaryRules, get_segments_from_breakpoints};
use crate::bin_track::{ChromBins, ChromList, GenomicBinTrack};
use crate::cbs::{CbsParameters, CbsSegmenter};
use crate::expected_ploidy::ReferencePloidy;
use crate::genome_regions::GenomeRegions;
use crate::hmm::{HmmParameters, hmm_segment};
use crate::log_utils::debug_msg;
use crate::wavelets::{WaveletParameters, haar_wavelets};

#[derive(
    Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize, clap::ValueEnum, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SegmentationMethod {
    #[default]
    Wavelets,
    Cbs,
    Hmm,
}

/// A segment on one chromosome
///
/// The segment spans the zero-indexed half-open interval `start..end`.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Segment {
    pub start: i64,
    pub end: i64,
}

impl Segment {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SegmentationParameters {
    pub method: SegmentationMethod,
    pub cbs: CbsParameters,
    pub wavelets: WaveletParameters,
    pub hmm: HmmParameters,

    /// Master seed for all per-chromosome random streams
    pub seed: u64,

    /// A new segment is started after any gap between adjacent bins larger than this
    pub max_inter_bin_dist: i64,

    /// Enable extra debug output for a single chromosome
    pub debug_chrom: Option<String>,
}

impl Default for SegmentationParameters {
    fn default() -> Self {
        Self {
            method: SegmentationMethod::Wavelets,
            cbs: CbsParameters::default(),
            wavelets: WaveletParameters::default(),
            hmm: HmmParameters::default(),
            seed: 0,
            max_inter_bin_dist: 1_000_000,
            debug_chrom: None,
        }
    }
}

/// Optional genome annotations used during segmentation
#[derive(Default)]
pub struct SegmentationRegions {
    /// Regions excluded from segmentation
    ///
    /// Bins intersecting these regions are expected to be filtered out when the bins are read,
    /// the regions are used here only to prevent segments from spanning across them.
    pub forbidden: Option<GenomeRegions>,

    /// Known common CNV regions, whose boundaries are preferred over nearby breakpoints
    pub common_cnv: Option<GenomeRegions>,

    pub ploidy: Option<ReferencePloidy>,
}

/// Engine state shared by all chromosome tasks
enum Segmenter<'a> {
    Cbs(CbsSegmenter),
    Wavelets(&'a WaveletParameters),
    Hmm(&'a HmmParameters),
}

impl<'a> Segmenter<'a> {
    fn new(params: &'a SegmentationParameters) -> Self {
        match params.method {
            SegmentationMethod::Cbs => Self::Cbs(CbsSegmenter::new(&params.cbs)),
            SegmentationMethod::Wavelets => Self::Wavelets(&params.wavelets),
            SegmentationMethod::Hmm => Self::Hmm(&params.hmm),
        }
    }
}

/// Sorted (start, end) intervals of `regions` on one chromosome
fn get_chrom_intervals(regions: Option<&GenomeRegions>, chrom_label: &str) -> Vec<(i64, i64)> {
    regions
        .and_then(|x| x.get_chrom(chrom_label))
        .map(|x| {
            x.get_sorted_regions()
                .into_iter()
                .map(|(start, end, _)| (start, end))
                .collect()
        })
        .unwrap_or_default()
}

/// Find the bins present in every sample
///
/// Returns the shared bins, with the score of the first sample, and the observations of all
/// samples for each shared bin, indexed [bin][sample].
///
fn get_shared_bins(sample_bins: &[&ChromBins]) -> (ChromBins, Vec<Vec<f64>>) {
    let mut shared_bins = ChromBins::default();
    let mut observations = Vec::new();
    let Some((first, others)) = sample_bins.split_first() else {
        return (shared_bins, observations);
    };

    let other_scores = others
        .iter()
        .map(|bins| {
            (0..bins.len())
                .map(|i| ((bins.start[i], bins.end[i]), bins.score[i]))
                .collect::<HashMap<_, _>>()
        })
        .collect::<Vec<_>>();

    for bin_index in 0..first.len() {
        let key = (first.start[bin_index], first.end[bin_index]);
        let mut obs = vec![first.score[bin_index]];
        for scores in other_scores.iter() {
            match scores.get(&key) {
                Some(&score) => obs.push(score),
                None => break,
            }
        }
        if obs.len() == sample_bins.len() {
            shared_bins.start.push(key.0);
            shared_bins.end.push(key.1);
            shared_bins.score.push(first.score[bin_index]);
            observations.push(obs);
        }
    }
    (shared_bins, observations)
}

/// Convert bin-index breakpoints from one engine run into genomic segments
fn get_segments(
    bins: &ChromBins,
    breakpoints: Vec<usize>,
    common_intervals: &[(i64, i64)],
    rules: &SegmentBoundaryRules,
) -> Vec<Segment> {
    let breakpoints = if common_intervals.is_empty() {
        breakpoints
    } else {
        let common_ranges = remap_common_regions(common_intervals, bins);
        overlap_common_regions(&breakpoints, &common_ranges, bins.len())
    };
    get_segments_from_breakpoints(bins, &breakpoints, rules)
}

/// Segment one chromosome across all samples
///
/// # Arguments
/// * `sample_bins` - Bins of this chromosome for each sample
/// * `seed` - Seed of the random stream for this chromosome
///
fn segment_chromosome(
    chrom_label: &str,
    sample_bins: &[&ChromBins],
    params: &SegmentationParameters,
    regions: &SegmentationRegions,
    segmenter: &Segmenter,
    seed: u64,
) -> Vec<Segment> {
    let debug = params.debug_chrom.as_deref() == Some(chrom_label);

    let sample_bins = sample_bins
        .iter()
        .filter(|x| !x.is_empty())
        .copied()
        .collect::<Vec<_>>();
    if sample_bins.is_empty() {
        return Vec::new();
    }

    let rules = SegmentBoundaryRules::new(
        chrom_label,
        params.max_inter_bin_dist,
        get_chrom_intervals(regions.forbidden.as_ref(), chrom_label),
        regions.ploidy.as_ref(),
    );
    let common_intervals = get_chrom_intervals(regions.common_cnv.as_ref(), chrom_label);

    // CBS and wavelets segment each sample independently, then merge the sample segmentations
    let segment_each_sample = |get_breakpoints: &dyn Fn(&[f64]) -> Vec<usize>| {
        let all_sample_segments = sample_bins
            .iter()
            .map(|bins| {
                let breakpoints = get_breakpoints(bins.score.as_slice());
                debug_msg!(
                    debug,
                    "Chromosome {chrom_label}: breakpoints at bin indices {:?}",
                    breakpoints
                );
                get_segments(bins, breakpoints, &common_intervals, &rules)
            })
            .collect::<Vec<_>>();
        if all_sample_segments.len() == 1 {
            all_sample_segments.into_iter().next().unwrap_or_default()
        } else {
            split_overlapping_segments(&all_sample_segments)
        }
    };

    let segments = match segmenter {
        Segmenter::Cbs(cbs) => segment_each_sample(&|x: &[f64]| cbs.breakpoints(x, seed)),
        Segmenter::Wavelets(wavelet_params) => {
            segment_each_sample(&|x: &[f64]| haar_wavelets(x, wavelet_params))
        }
        Segmenter::Hmm(hmm_params) => {
            let (shared_bins, observations) = get_shared_bins(&sample_bins);
            debug_msg!(
                debug,
                "Chromosome {chrom_label}: {} bins shared by {} samples",
                shared_bins.len(),
                sample_bins.len()
            );
            if shared_bins.is_empty() {
                return Vec::new();
            }
            let breakpoints = hmm_segment(&observations, hmm_params);
            get_segments(&shared_bins, breakpoints, &common_intervals, &rules)
        }
    };

    debug_msg!(
        debug,
        "Chromosome {chrom_label}: {} segments {:?}",
        segments.len(),
        segments
    );
    segments
}

/// Draw the seed of each chromosome's random stream from the master seed
///
/// Seeds are assigned in chromosome index order so that results don't depend on thread
/// scheduling.
///
fn get_chrom_seeds(master_seed: u64, chrom_count: usize) -> Vec<u64> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(master_seed);
    (0..chrom_count).map(|_| rng.random::<u64>()).collect()
}

/// Segment all chromosomes of all samples
///
/// Returns the segments of each chromosome, indexed by chromosome index.
///
pub fn segment_genome(
    thread_count: usize,
    chrom_list: &ChromList,
    tracks: &[GenomicBinTrack],
    params: &SegmentationParameters,
    regions: &SegmentationRegions,
) -> Vec<Vec<Segment>> {
    let chrom_count = chrom_list.len();
    let mut genome_segments = vec![Vec::new(); chrom_count];

    let usable_bin_count = tracks
        .iter()
        .map(|x| x.load_stats.usable_bin_count)
        .sum::<usize>();
    if usable_bin_count == 0 {
        info!("No usable bins found in any sample, skipping segmentation");
        return genome_segments;
    }

    info!(
        "Segmenting {} chromosomes in {} samples with method '{}'",
        chrom_count,
        tracks.len(),
        params.method
    );

    let segmenter = &Segmenter::new(params);
    let chrom_seeds = &get_chrom_seeds(params.seed, chrom_count);

    let worker_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(thread_count)
        .build()
        .unwrap();

    let (tx, rx) = channel();
    worker_pool.scope(move |scope| {
        for (chrom_index, chrom_label) in chrom_list.labels.iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let sample_bins = tracks
                    .iter()
                    .filter_map(|x| x.chroms.get(chrom_index))
                    .collect::<Vec<_>>();
                let segments = segment_chromosome(
                    chrom_label,
                    &sample_bins,
                    params,
                    regions,
                    segmenter,
                    chrom_seeds[chrom_index],
                );
                tx.send((chrom_index, segments)).unwrap();
            });
        }
    });

    for (chrom_index, segments) in rx {
        genome_segments[chrom_index] = segments;
    }

    info!(
        "Finished segmentation, found {} segments",
        genome_segments.iter().map(|x| x.len()).sum::<usize>()
    );
    genome_segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_step_bins(bin_count: usize, step_index: usize, low: f64, high: f64) -> ChromBins {
        let mut bins = ChromBins::default();
        for i in 0..bin_count {
            bins.start.push(i as i64 * 1000);
            bins.end.push((i as i64 + 1) * 1000);
            bins.score.push(if i < step_index { low } else { high });
        }
        bins
    }

    fn get_test_track(sample_name: &str, chroms: Vec<ChromBins>) -> GenomicBinTrack {
        let mut track = GenomicBinTrack {
            sample_name: sample_name.to_string(),
            chroms,
            load_stats: Default::default(),
        };
        track.load_stats.usable_bin_count = track.chroms.iter().map(|x| x.len()).sum();
        track
    }

    fn get_test_chrom_list(labels: &[&str]) -> ChromList {
        let mut chrom_list = ChromList::default();
        for label in labels {
            chrom_list.get_or_insert(label);
        }
        chrom_list
    }

    #[test]
    fn test_chrom_seeds() {
        let seeds = get_chrom_seeds(7, 4);
        assert_eq!(seeds, get_chrom_seeds(7, 4));
        assert_eq!(&seeds[..2], &get_chrom_seeds(7, 2)[..]);
        assert_ne!(seeds, get_chrom_seeds(8, 4));
    }

    #[test]
    fn test_shared_bins() {
        let a = get_step_bins(4, 2, 1.0, 2.0);
        let mut b = get_step_bins(4, 2, 3.0, 4.0);
        b.start.remove(1);
        b.end.remove(1);
        b.score.remove(1);

        let (shared, observations) = get_shared_bins(&[&a, &b]);
        assert_eq!(shared.start, vec![0, 2000, 3000]);
        assert_eq!(
            observations,
            vec![vec![1.0, 3.0], vec![2.0, 4.0], vec![2.0, 4.0]]
        );
    }

    #[test]
    fn test_segment_genome_wavelets() {
        let chrom_list = get_test_chrom_list(&["chr1", "chr2"]);
        let tracks = vec![get_test_track(
            "s1",
            vec![get_step_bins(200, 100, 10.0, 200.0), ChromBins::default()],
        )];
        let params = SegmentationParameters::default();
        let regions = SegmentationRegions::default();
        let segments = segment_genome(2, &chrom_list, &tracks, &params, &regions);
        assert_eq!(
            segments,
            vec![
                vec![Segment::new(0, 100_000), Segment::new(100_000, 200_000)],
                vec![]
            ]
        );
    }

    #[test]
    fn test_segment_genome_cbs_determinism() {
        let chrom_list = get_test_chrom_list(&["chr1"]);
        let tracks = vec![get_test_track(
            "s1",
            vec![get_step_bins(1000, 500, 0.0, 5.0)],
        )];
        let params = SegmentationParameters {
            method: SegmentationMethod::Cbs,
            cbs: CbsParameters {
                nperm: 1000,
                ..Default::default()
            },
            seed: 11,
            ..Default::default()
        };
        let regions = SegmentationRegions::default();
        let segments = segment_genome(1, &chrom_list, &tracks, &params, &regions);
        assert_eq!(
            segments[0],
            vec![Segment::new(0, 500_000), Segment::new(500_000, 1_000_000)]
        );
        assert_eq!(
            segments,
            segment_genome(3, &chrom_list, &tracks, &params, &regions)
        );
    }

    #[test]
    fn test_segment_genome_multi_sample() {
        let chrom_list = get_test_chrom_list(&["chr1"]);
        let tracks = vec![
            get_test_track("s1", vec![get_step_bins(200, 50, 10.0, 200.0)]),
            get_test_track("s2", vec![get_step_bins(200, 150, 10.0, 200.0)]),
        ];
        let params = SegmentationParameters::default();
        let regions = SegmentationRegions::default();
        let segments = segment_genome(2, &chrom_list, &tracks, &params, &regions);
        assert_eq!(
            segments[0],
            vec![
                Segment::new(0, 50_000),
                Segment::new(50_000, 150_000),
                Segment::new(150_000, 200_000)
            ]
        );
    }

    #[test]
    fn test_segment_genome_hmm() {
        let chrom_list = get_test_chrom_list(&["chr1"]);
        let mut bins = get_step_bins(80, 40, 20.0, 60.0);
        for (i, v) in bins.score.iter_mut().enumerate() {
            *v += if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        let tracks = vec![get_test_track("s1", vec![bins])];
        let params = SegmentationParameters {
            method: SegmentationMethod::Hmm,
            ..Default::default()
        };
        let regions = SegmentationRegions::default();
        let segments = segment_genome(1, &chrom_list, &tracks, &params, &regions);
        assert_eq!(
            segments[0],
            vec![Segment::new(0, 40_000), Segment::new(40_000, 80_000)]
        );
    }

    #[test]
    fn test_segment_genome_no_bins() {
        let chrom_list = get_test_chrom_list(&["chr1"]);
        let tracks = vec![get_test_track("s1", vec![ChromBins::default()])];
        let segments = segment_genome(
            1,
            &chrom_list,
            &tracks,
            &SegmentationParameters::default(),
            &SegmentationRegions::default(),
        );
        assert_eq!(segments, vec![Vec::<Segment>::new()]);
    }
}
