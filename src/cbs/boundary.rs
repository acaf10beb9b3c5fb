//! Sequential stopping boundary for the CBS permutation test
//!
//! The boundary is stored as a flat triangular table. Row `r` (for `r` in `1..=max_ones`) holds `r`
//! permutation counts, and starts at offset `r * (r - 1) / 2`. Entry `c` of row `r` is the
//! permutation index at which the test can stop and declare significance when only `c`
//! rejections have been observed, given that the test is allowed `r - 1` rejections in total.
//!

use log::debug;

use crate::special_functions::phyper;

/// Tolerance on the relative width of the bracket around the target exceedance probability
const BOUNDARY_TOLERANCE: f64 = 0.01;

/// Limit on the bracket refinement iterations for each boundary row
const MAX_BOUNDARY_ITERATIONS: usize = 100;

/// Fill `kbdry` with the boundary for `ka` total rejections at per-step level `eta`
///
/// `kbdry[k]` is the first permutation index `i` at which having seen no more than `k`
/// rejections in the first `i` permutations has probability at most `eta`, for `ka` rejections
/// distributed uniformly over `nperm` permutations.
///
fn eta_boundary(nperm: usize, eta: f64, ka: usize, kbdry: &mut [usize]) {
    assert_eq!(kbdry.len(), ka);
    let mut k = 0;
    for i in 1..=nperm {
        if phyper(k as f64, ka as f64, (nperm - ka) as f64, i as f64, true) <= eta {
            kbdry[k] = i;
            k += 1;
            if k == ka {
                return;
            }
        }
    }

    // Entries not reached within nperm can never trigger a stop
    for v in kbdry[k..].iter_mut() {
        *v = nperm + 1;
    }
}

/// Probability that a uniformly random placement of `ka` rejections among `nperm` permutations
/// crosses the boundary `kbdry`
///
/// The boundary is crossed if for some `r` fewer than `r + 1` rejections have been observed by
/// permutation `kbdry[r]`.
///
fn p_exceed(nperm: usize, ka: usize, kbdry: &[usize]) -> f64 {
    assert_eq!(kbdry.len(), ka);

    // prob[c] is the probability of having observed c rejections without crossing the boundary
    let mut prob = vec![0.0; ka + 1];
    prob[0] = 1.0;
    let mut exceed = 0.0;
    let mut next = vec![0.0; ka + 1];
    for p in 1..=nperm {
        let remaining = (nperm - p + 1) as f64;
        next.fill(0.0);
        for c in 0..=ka {
            let pc = prob[c];
            if pc == 0.0 {
                continue;
            }
            if c < ka {
                let q = (ka - c) as f64 / remaining;
                next[c + 1] += pc * q;
                next[c] += pc * (1.0 - q);
            } else {
                next[c] += pc;
            }
        }
        std::mem::swap(&mut prob, &mut next);

        for (c, &b) in kbdry.iter().enumerate() {
            if b <= p && prob[c] > 0.0 {
                exceed += prob[c];
                prob[c] = 0.0;
            }
        }
    }
    exceed
}

/// Compute the triangular sequential boundary table used to stop CBS permutation tests early
///
/// Row 1 is set directly from `eta`. For each later row the per-step level is tuned by regula
/// falsi between `0.25 * eta0` and `1.1 * eta0`, so that the overall boundary crossing
/// probability matches `eta`, where `eta0` is the level found for the previous row.
///
/// # Arguments
/// * `nperm` - Number of permutations in the test
/// * `max_ones` - Number of table rows, this should be `floor(nperm * alpha) + 1`
///
pub fn compute_boundary(nperm: usize, max_ones: usize, eta: f64) -> Vec<usize> {
    let mut sbdry = vec![0usize; max_ones * (max_ones + 1) / 2];
    if max_ones == 0 {
        return sbdry;
    }

    sbdry[0] = nperm - (nperm as f64 * eta) as usize;

    let mut offset = 1;
    let mut eta0 = eta;
    for ka in 2..=max_ones.min(nperm) {
        let row = &mut sbdry[offset..(offset + ka)];

        let mut etahi = eta0 * 1.1;
        eta_boundary(nperm, etahi, ka, row);
        let mut phi = p_exceed(nperm, ka, row);

        let mut etalo = eta0 * 0.25;
        eta_boundary(nperm, etalo, ka, row);
        let mut plo = p_exceed(nperm, ka, row);

        let mut iteration = 0;
        while plo > 0.0 && (phi - plo) / plo > BOUNDARY_TOLERANCE {
            if iteration >= MAX_BOUNDARY_ITERATIONS {
                debug!("Sequential boundary row {ka} did not converge");
                break;
            }
            iteration += 1;

            eta0 = etalo + (etahi - etalo) * (eta - plo) / (phi - plo);
            eta_boundary(nperm, eta0, ka, row);
            let pexd = p_exceed(nperm, ka, row);
            if pexd > eta {
                etahi = eta0;
                phi = pexd;
            } else {
                etalo = eta0;
                plo = pexd;
            }
        }
        offset += ka;
    }

    // Rows beyond nperm rejections can't be reached
    for v in sbdry[offset..].iter_mut() {
        *v = nperm + 1;
    }

    sbdry
}
