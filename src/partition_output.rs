//! Write segmentation results
//!

use std::fs::File;
use std::io::{BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::{Compression, write::GzEncoder};
use log::info;
use unwrap::unwrap;

use crate::bin_track::{ChromBins, ChromList, GenomicBinTrack};
use crate::numeric_utils::mean;
use crate::segmentation::Segment;

pub const SEGMENTS_FILENAME: &str = "segments.bed";

pub fn get_partition_filename(output_dir: &Utf8Path, sample_name: &str) -> Utf8PathBuf {
    output_dir.join(format!("{sample_name}.partitioned.bed.gz"))
}

/// Find the index of the segment containing the start of each bin
///
/// Bins and segments must both be sorted by position.
///
fn get_bin_segment_indices(bins: &ChromBins, segments: &[Segment]) -> Vec<Option<usize>> {
    let mut segment_index = 0;
    bins.start
        .iter()
        .map(|&start| {
            while segment_index < segments.len() && segments[segment_index].end <= start {
                segment_index += 1;
            }
            segments
                .get(segment_index)
                .filter(|x| x.start <= start)
                .map(|_| segment_index)
        })
        .collect()
}

/// Genome-wide index of the first segment of each chromosome
fn get_chrom_segment_offsets(genome_segments: &[Vec<Segment>]) -> Vec<usize> {
    genome_segments
        .iter()
        .scan(0, |offset, x| {
            let chrom_offset = *offset;
            *offset += x.len();
            Some(chrom_offset)
        })
        .collect()
}

/// Write every bin of one sample with the genome-wide index of the segment it belongs to
///
/// Bins outside of all segments are written with segment index 'NA'.
///
pub fn write_partitioned_bins(
    output_dir: &Utf8Path,
    chrom_list: &ChromList,
    track: &GenomicBinTrack,
    genome_segments: &[Vec<Segment>],
) {
    let filename = get_partition_filename(output_dir, &track.sample_name);

    info!("Writing partitioned bins to file: '{filename}'");

    let f = unwrap!(
        File::create(&filename),
        "Unable to create partitioned bin file: '{}'",
        filename
    );
    let mut f = BufWriter::new(GzEncoder::new(f, Compression::default()));

    let chrom_offsets = get_chrom_segment_offsets(genome_segments);
    for (chrom_index, bins) in track.chroms.iter().enumerate() {
        let chrom_label = &chrom_list.labels[chrom_index];
        let segments = &genome_segments[chrom_index];
        let segment_indices = get_bin_segment_indices(bins, segments);
        for (bin_index, segment_index) in segment_indices.into_iter().enumerate() {
            let segment_label = match segment_index {
                Some(x) => (chrom_offsets[chrom_index] + x).to_string(),
                None => "NA".to_string(),
            };
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}",
                chrom_label,
                bins.start[bin_index],
                bins.end[bin_index],
                bins.score[bin_index],
                segment_label
            )
            .unwrap();
        }
    }

    let encoder = unwrap!(
        f.into_inner(),
        "Unable to write partitioned bin file: '{}'",
        filename
    );
    unwrap!(
        encoder.finish(),
        "Unable to write partitioned bin file: '{}'",
        filename
    );
}

/// Write a bed file of all segments with the mean score of each segment in the first sample
///
pub fn write_segments_bed(
    output_dir: &Utf8Path,
    chrom_list: &ChromList,
    score_track: Option<&GenomicBinTrack>,
    genome_segments: &[Vec<Segment>],
) {
    let filename = output_dir.join(SEGMENTS_FILENAME);

    info!("Writing segments to file: '{filename}'");

    let f = unwrap!(
        File::create(&filename),
        "Unable to create segments bed file: '{}'",
        filename
    );
    let mut f = BufWriter::new(f);

    let chrom_offsets = get_chrom_segment_offsets(genome_segments);
    for (chrom_index, segments) in genome_segments.iter().enumerate() {
        let chrom_label = &chrom_list.labels[chrom_index];

        let mut segment_scores = vec![Vec::new(); segments.len()];
        if let Some(bins) = score_track.and_then(|x| x.chroms.get(chrom_index)) {
            let segment_indices = get_bin_segment_indices(bins, segments);
            for (bin_index, segment_index) in segment_indices.into_iter().enumerate() {
                if let Some(segment_index) = segment_index {
                    segment_scores[segment_index].push(bins.score[bin_index]);
                }
            }
        }

        for (segment_index, segment) in segments.iter().enumerate() {
            let scores = &segment_scores[segment_index];
            let score_label = if scores.is_empty() {
                "NA".to_string()
            } else {
                mean(scores).to_string()
            };
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{}",
                chrom_label,
                segment.start,
                segment.end,
                chrom_offsets[chrom_index] + segment_index,
                score_label
            )
            .unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;

    use super::*;
    use crate::os_utils::get_dynamic_reader;

    fn get_test_data() -> (ChromList, GenomicBinTrack, Vec<Vec<Segment>>) {
        let mut chrom_list = ChromList::default();
        chrom_list.get_or_insert("chr1");
        chrom_list.get_or_insert("chr2");

        let track = GenomicBinTrack {
            sample_name: "s1".to_string(),
            chroms: vec![
                ChromBins {
                    start: vec![0, 10, 20],
                    end: vec![10, 20, 30],
                    score: vec![1.0, 2.0, 3.0],
                },
                ChromBins {
                    start: vec![0],
                    end: vec![10],
                    score: vec![5.0],
                },
            ],
            load_stats: Default::default(),
        };
        let genome_segments = vec![vec![Segment::new(0, 20)], vec![Segment::new(0, 10)]];
        (chrom_list, track, genome_segments)
    }

    fn read_lines(filename: &Utf8Path) -> Vec<String> {
        get_dynamic_reader(filename, "test")
            .unwrap()
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_bin_segment_indices() {
        let bins = ChromBins {
            start: vec![0, 10, 20, 30, 40],
            end: vec![10, 20, 30, 40, 50],
            score: vec![0.0; 5],
        };
        let segments = vec![Segment::new(0, 20), Segment::new(30, 50)];
        assert_eq!(
            get_bin_segment_indices(&bins, &segments),
            vec![Some(0), Some(0), None, Some(1), Some(1)]
        );
        assert_eq!(get_bin_segment_indices(&bins, &[]), vec![None; 5]);
    }

    #[test]
    fn test_write_partitioned_bins() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let (chrom_list, track, genome_segments) = get_test_data();

        write_partitioned_bins(&dir, &chrom_list, &track, &genome_segments);
        assert_eq!(
            read_lines(&get_partition_filename(&dir, "s1")),
            vec![
                "chr1\t0\t10\t1\t0",
                "chr1\t10\t20\t2\t0",
                "chr1\t20\t30\t3\tNA",
                "chr2\t0\t10\t5\t1",
            ]
        );
    }

    #[test]
    fn test_write_segments_bed() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let (chrom_list, track, genome_segments) = get_test_data();

        write_segments_bed(&dir, &chrom_list, Some(&track), &genome_segments);
        assert_eq!(
            read_lines(&dir.join(SEGMENTS_FILENAME)),
            vec!["chr1\t0\t20\t0\t1.5", "chr2\t0\t10\t1\t5"]
        );

        write_segments_bed(&dir, &chrom_list, None, &genome_segments);
        assert_eq!(
            read_lines(&dir.join(SEGMENTS_FILENAME)),
            vec!["chr1\t0\t20\t0\tNA", "chr2\t0\t10\t1\tNA"]
        );
    }
}
