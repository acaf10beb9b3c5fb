use camino::Utf8Path;
use simple_error::SimpleResult;

use crate::genome_regions::GenomeRegions;

/// Ploidy assumed for any part of the genome not covered by a ploidy region
const DEFAULT_PLOIDY: u8 = 2;

/// Reference ploidy lookup over the genome
///
/// Regions are read from a bed file with the ploidy in column 5, such as a description of the
/// non-PAR sex chromosome regions for a male sample. Positions without a ploidy region are diploid.
///
pub struct ReferencePloidy {
    regions: GenomeRegions,
}

impl ReferencePloidy {
    pub fn from_bed(filename: &Utf8Path) -> SimpleResult<Self> {
        let regions = GenomeRegions::from_bed(filename, "ploidy", false, true)?;
        Ok(Self { regions })
    }

    #[cfg(test)]
    pub fn from_regions(regions: GenomeRegions) -> Self {
        Self { regions }
    }

    /// Return true if a single reference ploidy applies over all of `start..end` on `chrom`
    ///
    pub fn is_uniform_ploidy(&self, chrom: &str, start: i64, end: i64) -> bool {
        if end <= start {
            return true;
        }
        let Some(chrom_regions) = self.regions.get_chrom(chrom) else {
            return true;
        };

        let mut overlaps = chrom_regions
            .find_overlaps(start, end)
            .map(|x| {
                (
                    x.interval().start.max(start),
                    x.interval().end.min(end),
                    *x.data(),
                )
            })
            .collect::<Vec<_>>();
        if overlaps.is_empty() {
            return true;
        }
        overlaps.sort_unstable();

        // Find any uncovered position, which takes the default ploidy
        let mut covered_end = start;
        let mut has_gap = false;
        for &(region_start, region_end, _) in overlaps.iter() {
            if region_start > covered_end {
                has_gap = true;
                break;
            }
            covered_end = covered_end.max(region_end);
        }
        if covered_end < end {
            has_gap = true;
        }

        let ploidy = if has_gap {
            DEFAULT_PLOIDY
        } else {
            overlaps[0].2
        };
        overlaps.iter().all(|x| x.2 == ploidy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_ploidy() -> ReferencePloidy {
        let mut regions = GenomeRegions::new(false);
        regions.add_region_value("chrX", 1000, 2000, 1);
        regions.add_region_value("chrX", 2000, 3000, 1);
        regions.add_region_value("chrX", 5000, 6000, 2);
        regions.add_region_value("chrY", 0, 1000, 0);
        ReferencePloidy::from_regions(regions)
    }

    #[test]
    fn test_is_uniform_ploidy() {
        let ploidy = get_test_ploidy();

        // No regions
        assert!(ploidy.is_uniform_ploidy("chr1", 0, 100));
        assert!(ploidy.is_uniform_ploidy("chrX", 0, 1000));

        // Fully covered by haploid regions
        assert!(ploidy.is_uniform_ploidy("chrX", 1500, 2500));

        // Crosses from diploid default into haploid
        assert!(!ploidy.is_uniform_ploidy("chrX", 999, 1001));
        assert!(!ploidy.is_uniform_ploidy("chrX", 2999, 3001));

        // Explicit diploid region adjacent to default diploid
        assert!(ploidy.is_uniform_ploidy("chrX", 4999, 6001));

        assert!(!ploidy.is_uniform_ploidy("chrY", 999, 1001));
        assert!(ploidy.is_uniform_ploidy("chrY", 10, 20));

        // Empty interval
        assert!(ploidy.is_uniform_ploidy("chrX", 1000, 1000));
    }

    #[test]
    fn test_from_bed() {
        let dir = tempfile::tempdir().unwrap();
        let filename = camino::Utf8PathBuf::from_path_buf(dir.path().join("ploidy.bed")).unwrap();
        std::fs::write(&filename, "chrX\t100\t200\tnonpar\t1\n").unwrap();
        let ploidy = ReferencePloidy::from_bed(&filename).unwrap();
        assert!(ploidy.is_uniform_ploidy("chrX", 120, 180));
        assert!(!ploidy.is_uniform_ploidy("chrX", 50, 180));
    }
}
