use log::info;
use simple_error::SimpleResult;

use crate::bin_track::{ChromList, read_bin_track};
use crate::cli;
use crate::expected_ploidy::ReferencePloidy;
use crate::genome_regions::GenomeRegions;
use crate::partition_output::{write_partitioned_bins, write_segments_bed};
use crate::run_stats::{SegmentRunStats, write_run_stats};
use crate::segmentation::{SegmentationRegions, segment_genome};

/// Read all optional region annotation files
fn read_segmentation_regions(settings: &cli::SegmentSettings) -> SimpleResult<SegmentationRegions> {
    let forbidden = settings
        .forbidden_regions_filename
        .as_ref()
        .map(|x| GenomeRegions::from_bed(x, "forbidden", true, false))
        .transpose()?;
    let common_cnv = settings
        .common_cnv_filename
        .as_ref()
        .map(|x| GenomeRegions::from_bed(x, "common CNV", true, false))
        .transpose()?;
    let ploidy = settings
        .ploidy_filename
        .as_ref()
        .map(|x| ReferencePloidy::from_bed(x))
        .transpose()?;
    Ok(SegmentationRegions {
        forbidden,
        common_cnv,
        ploidy,
    })
}

/// Segment all input samples and write the partitioned bins for each sample
///
/// All input files are read before segmentation starts, so any input error is returned before
/// segmentation work begins.
///
pub fn run_partition(
    shared_settings: &cli::SharedSettings,
    settings: &cli::SegmentSettings,
) -> SimpleResult<()> {
    cli::write_segment_settings(&settings.output_dir, settings);

    let params = settings.get_segmentation_parameters();
    let regions = read_segmentation_regions(settings)?;

    let mut chrom_list = ChromList::default();
    let mut tracks = settings
        .bin_filenames
        .iter()
        .map(|x| read_bin_track(x, &mut chrom_list, regions.forbidden.as_ref()))
        .collect::<SimpleResult<Vec<_>>>()?;
    for track in tracks.iter_mut() {
        track.resize(&chrom_list);
    }

    let start = std::time::Instant::now();
    let genome_segments = segment_genome(
        shared_settings.thread_count,
        &chrom_list,
        &tracks,
        &params,
        &regions,
    );
    let segmentation_time_secs = start.elapsed().as_secs_f64();

    for track in tracks.iter() {
        write_partitioned_bins(&settings.output_dir, &chrom_list, track, &genome_segments);
    }
    write_segments_bed(
        &settings.output_dir,
        &chrom_list,
        tracks.first(),
        &genome_segments,
    );

    let run_stats = SegmentRunStats::new(
        params.method,
        &chrom_list,
        &tracks,
        &genome_segments,
        segmentation_time_secs,
    );
    write_run_stats(&settings.output_dir, &run_stats);

    info!("Finished writing partitioned bins for {} samples", tracks.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;

    use camino::Utf8PathBuf;
    use clap::Parser;

    use super::*;
    use crate::os_utils::get_dynamic_reader;
    use crate::partition_output::get_partition_filename;

    #[test]
    fn test_run_partition() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let bin_filename = dir.join("sample1.bed");
        let mut content = String::new();
        for i in 0..200 {
            let score = if i < 100 { 10.0 } else { 200.0 };
            content += &format!("chr1\t{}\t{}\t{}\n", i * 1000, (i + 1) * 1000, score);
        }
        std::fs::write(&bin_filename, content).unwrap();

        let forbidden_filename = dir.join("forbidden.bed");
        std::fs::write(&forbidden_filename, "chr1\t50500\t50600\n").unwrap();

        let output_dir = dir.join("out");
        std::fs::create_dir(&output_dir).unwrap();

        let settings = cli::Settings::try_parse_from([
            "cnpartition",
            "--bins",
            bin_filename.as_str(),
            "--forbidden",
            forbidden_filename.as_str(),
            "--output-dir",
            output_dir.as_str(),
            "--threads",
            "2",
        ])
        .unwrap();
        let settings = cli::validate_and_fix_settings_impl(settings).unwrap();
        run_partition(&settings.shared, &settings.segment).unwrap();

        let lines = get_dynamic_reader(&get_partition_filename(&output_dir, "sample1"), "test")
            .unwrap()
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        // One bin is removed by the forbidden region
        assert_eq!(lines.len(), 199);
        assert_eq!(lines[0], "chr1\t0\t1000\t10\t0");
        assert_eq!(lines[50], "chr1\t51000\t52000\t10\t1");
        assert_eq!(lines[198], "chr1\t199000\t200000\t200\t2");

        let segments = std::fs::read_to_string(output_dir.join("segments.bed")).unwrap();
        assert_eq!(
            segments,
            "chr1\t0\t50000\t0\t10\nchr1\t51000\t100000\t1\t10\nchr1\t100000\t200000\t2\t200\n"
        );
    }
}
