use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use const_format::concatcp;
use serde::{Deserialize, Serialize};
use simple_error::{SimpleResult, bail};
use unwrap::unwrap;

use super::utils::{check_optional_filename, check_required_filename};
use crate::bin_track::get_sample_name;
use crate::cbs::{CbsParameters, UndoMethod, validate_cbs_parameters};
use crate::hmm::{EmissionKind, HmmDecoder, HmmParameters};
use crate::segmentation::{SegmentationMethod, SegmentationParameters};
use crate::wavelets::WaveletParameters;

pub const SETTINGS_FILENAME: &str = "segment.settings.json";

#[derive(Args, Deserialize, Serialize)]
pub struct SegmentSettings {
    /// Directory for all segmentation output (must not already exist unless --clobber is set)
    #[arg(long, value_name = "DIR", default_value = concatcp!(env!("CARGO_PKG_NAME"), "_output"))]
    pub output_dir: Utf8PathBuf,

    /// Binned signal for one sample, as tab-delimited 'chrom start end score' rows
    ///
    /// The file may be gzip compressed. Bins must be sorted by start position within each
    /// chromosome. Repeat this option to segment multiple samples jointly, the sample name is taken
    /// from each filename.
    ///
    #[arg(long = "bins", value_name = "FILE", required = true)]
    pub bin_filenames: Vec<Utf8PathBuf>,

    /// Segmentation method
    #[arg(long, value_enum, default_value_t = SegmentationMethod::Wavelets)]
    pub method: SegmentationMethod,

    /// Seed for all random number generation
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Regions of the genome to exclude from segmentation, in BED format
    ///
    /// Bins intersecting these regions are dropped, and no segment will span a region midpoint.
    ///
    #[arg(long = "forbidden", value_name = "FILE")]
    pub forbidden_regions_filename: Option<Utf8PathBuf>,

    /// Known common CNV regions, in BED format
    ///
    /// A breakpoint inside a common CNV region is replaced by breakpoints at the region boundaries.
    ///
    #[arg(long = "common-cnv", value_name = "FILE")]
    pub common_cnv_filename: Option<Utf8PathBuf>,

    /// Reference ploidy by genomic interval, in BED format
    ///
    /// Ploidy is read from column 5 of the input BED file. Column 4 is ignored and can be used as
    /// a region label. The default ploidy is 2 for unspecified regions. Segments are split
    /// wherever the reference ploidy changes.
    ///
    #[arg(long = "ploidy", value_name = "FILE")]
    pub ploidy_filename: Option<Utf8PathBuf>,

    /// Start a new segment wherever the gap between adjacent bins exceeds this distance
    #[arg(long, value_name = "BP", default_value_t = 1_000_000)]
    pub max_inter_bin_dist: i64,

    /// CBS significance level for accepting a change point
    #[arg(long, default_value_t = 0.01)]
    pub alpha: f64,

    /// CBS permutation count used to assess change point significance
    #[arg(long, default_value_t = 10000)]
    pub nperm: usize,

    /// CBS minimum segment length, in bins, in the range [2,5]
    #[arg(long, default_value_t = 2)]
    pub min_width: usize,

    /// CBS maximum arc length for the hybrid permutation statistic
    #[arg(long, default_value_t = 25)]
    pub kmax: usize,

    /// CBS segments longer than this use the hybrid p-value computation
    #[arg(long, default_value_t = 200)]
    pub nmin: usize,

    /// CBS type I error rate of the sequential permutation stopping rule
    #[arg(long, default_value_t = 0.05)]
    pub eta: f64,

    /// CBS method used to remove weakly supported change points
    #[arg(long, value_enum, default_value_t = UndoMethod::None)]
    pub undo_method: UndoMethod,

    /// CBS relative increase in residual sum of squares allowed by the prune undo method
    #[arg(long, default_value_t = 0.05)]
    pub undo_prune: f64,

    /// CBS trimmed standard deviations between adjacent segment means required by the sdundo
    /// method
    #[arg(long, default_value_t = 3.0)]
    pub undo_sd: f64,

    /// Fraction trimmed from each tail when estimating the standard deviation for sdundo
    #[arg(hide = true, long, default_value_t = 0.025)]
    pub undo_sd_trim: f64,

    /// Wavelet lower bound of the noise level estimate
    #[arg(long, default_value_t = 5.0)]
    pub threshold_lower: f64,

    /// Wavelet upper bound of the noise level estimate
    #[arg(long, default_value_t = 80.0)]
    pub threshold_upper: f64,

    /// Wavelet multiplier of the median absolute deviation used as the noise level estimate
    #[arg(long, default_value_t = 2.0)]
    pub mad_factor: f64,

    /// Use germline wavelet thresholds and breakpoint refinement
    #[arg(long)]
    pub germline: bool,

    /// Chromosomes with no more than this many bins are not segmented by the wavelet or HMM
    /// methods
    #[arg(long, default_value_t = 10)]
    pub min_size: usize,

    /// HMM hidden state count, corresponding to copy number levels
    #[arg(long, default_value_t = 5)]
    pub hidden_states: usize,

    /// HMM emission distribution
    #[arg(long, value_enum, default_value_t = EmissionKind::Gaussian)]
    pub hmm_emission: EmissionKind,

    /// HMM state path decoder
    #[arg(long, value_enum, default_value_t = HmmDecoder::Viterbi)]
    pub hmm_decoder: HmmDecoder,

    /// Longest single state duration, in bins, modeled by the hsmm decoder
    #[arg(long, default_value_t = 100)]
    pub max_state_length: usize,

    /// Print extra segmentation details for the given chromosome only
    #[arg(hide = true, long)]
    pub debug_chrom: Option<String>,
}

impl SegmentSettings {
    fn get_cbs_parameters(&self) -> CbsParameters {
        CbsParameters {
            alpha: self.alpha,
            nperm: self.nperm,
            min_width: self.min_width,
            kmax: self.kmax,
            nmin: self.nmin,
            eta: self.eta,
            undo_method: self.undo_method,
            undo_prune: self.undo_prune,
            undo_sd: self.undo_sd,
            trim: self.undo_sd_trim,
        }
    }

    pub fn get_segmentation_parameters(&self) -> SegmentationParameters {
        SegmentationParameters {
            method: self.method,
            cbs: self.get_cbs_parameters(),
            wavelets: WaveletParameters {
                threshold_lower: self.threshold_lower,
                threshold_upper: self.threshold_upper,
                mad_factor: self.mad_factor,
                is_germline: self.germline,
                min_size: self.min_size,
            },
            hmm: HmmParameters {
                hidden_states: self.hidden_states,
                emission: self.hmm_emission,
                decoder: self.hmm_decoder,
                max_state_length: self.max_state_length,
                min_size: self.min_size,
            },
            seed: self.seed,
            max_inter_bin_dist: self.max_inter_bin_dist,
            debug_chrom: self.debug_chrom.clone(),
        }
    }
}

/// Validate settings and update to parameters that can't be processed automatically by clap.
///
/// Assumes that the logger is not setup
///
pub fn validate_and_fix_segment_settings(
    settings: SegmentSettings,
) -> SimpleResult<SegmentSettings> {
    if settings.bin_filenames.is_empty() {
        bail!("Must specify at least one --bins file");
    }

    let mut sample_names = HashSet::new();
    for bin_filename in settings.bin_filenames.iter() {
        check_required_filename(bin_filename, "bin")?;
        let sample_name = get_sample_name(bin_filename);
        if !sample_names.insert(sample_name.clone()) {
            bail!(
                "Sample name '{}' from bin file '{}' is used by more than one --bins file",
                sample_name,
                bin_filename
            );
        }
    }

    check_optional_filename(
        settings.forbidden_regions_filename.as_ref(),
        "forbidden regions",
    )?;
    check_optional_filename(settings.common_cnv_filename.as_ref(), "common CNV regions")?;
    check_optional_filename(settings.ploidy_filename.as_ref(), "ploidy")?;

    if settings.max_inter_bin_dist < 0 {
        bail!("--max-inter-bin-dist must be non-negative");
    }

    validate_cbs_parameters(&settings.get_cbs_parameters())?;
    if !(0.0..0.5).contains(&settings.undo_sd_trim) {
        bail!(
            "--undo-sd-trim must be in the range [0,0.5), found {}",
            settings.undo_sd_trim
        );
    }

    if settings.threshold_lower < 0.0 {
        bail!("--threshold-lower must be non-negative");
    }
    if settings.threshold_lower > settings.threshold_upper {
        bail!(
            "--threshold-lower ({}) must not exceed --threshold-upper ({})",
            settings.threshold_lower,
            settings.threshold_upper
        );
    }
    if !(settings.mad_factor > 0.0) {
        bail!("--mad-factor must be greater than 0");
    }

    if !(2..=255).contains(&settings.hidden_states) {
        bail!(
            "--hidden-states must be in the range [2,255], found {}",
            settings.hidden_states
        );
    }
    if settings.max_state_length == 0 {
        bail!("--max-state-length must be greater than 0");
    }

    Ok(settings)
}

/// Write segment settings out in json format
pub fn write_segment_settings(output_dir: &Utf8Path, settings: &SegmentSettings) {
    use log::info;

    let filename = output_dir.join(SETTINGS_FILENAME);

    info!("Writing segment settings to file: '{filename}'");

    let f = unwrap!(
        std::fs::File::create(&filename),
        "Unable to create segment settings json file: '{}'",
        filename
    );

    serde_json::to_writer_pretty(&f, &settings).unwrap();
}
