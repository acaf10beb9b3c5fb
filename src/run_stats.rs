//! Track stats for the whole cnpartition run
//!

use std::fs::File;

use camino::Utf8Path;
use log::info;
use serde::{Deserialize, Serialize};
use unwrap::unwrap;

use crate::bin_track::{BinLoadStats, ChromList, GenomicBinTrack};
use crate::segmentation::{Segment, SegmentationMethod};

pub const RUN_STATS_FILENAME: &str = "run.stats.json";

#[derive(Deserialize, Serialize)]
pub struct SampleStats {
    pub sample_name: String,
    pub bin_stats: BinLoadStats,
}

#[derive(Deserialize, Serialize)]
pub struct ChromSegmentStats {
    pub chrom: String,
    pub segment_count: usize,
}

#[derive(Deserialize, Serialize)]
pub struct SegmentRunStats {
    pub method: SegmentationMethod,
    pub samples: Vec<SampleStats>,
    pub chroms: Vec<ChromSegmentStats>,
    pub total_segment_count: usize,
    pub segmentation_time_secs: f64,
}

impl SegmentRunStats {
    pub fn new(
        method: SegmentationMethod,
        chrom_list: &ChromList,
        tracks: &[GenomicBinTrack],
        genome_segments: &[Vec<Segment>],
        segmentation_time_secs: f64,
    ) -> Self {
        let samples = tracks
            .iter()
            .map(|x| SampleStats {
                sample_name: x.sample_name.clone(),
                bin_stats: x.load_stats.clone(),
            })
            .collect();
        let chroms = chrom_list
            .labels
            .iter()
            .zip(genome_segments.iter())
            .map(|(chrom, segments)| ChromSegmentStats {
                chrom: chrom.clone(),
                segment_count: segments.len(),
            })
            .collect();
        Self {
            method,
            samples,
            chroms,
            total_segment_count: genome_segments.iter().map(|x| x.len()).sum(),
            segmentation_time_secs,
        }
    }
}

/// Write run_stats structure out in json format
pub fn write_run_stats(output_dir: &Utf8Path, run_stats: &SegmentRunStats) {
    let filename = output_dir.join(RUN_STATS_FILENAME);

    info!("Writing run statistics to file: '{filename}'");

    let f = unwrap!(
        File::create(&filename),
        "Unable to create run statistics json file: '{}'",
        filename
    );

    serde_json::to_writer_pretty(&f, &run_stats).unwrap();
}
