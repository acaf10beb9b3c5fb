//! Numeric primitives shared by all segmentation methods
//!

use crate::special_functions::{dnorm, qnorm};

/// Scale factor making the median absolute deviation a consistent estimator of the normal
/// standard deviation
pub const MAD_NORMAL_SCALE: f64 = 1.4826;

/// Partially sort `x` so that the element at index `k` is the one that would be found there in a
/// fully sorted array
///
/// This mutates `x`, callers that need to keep their data intact must pass a copy.
///
/// Returns the selected value
///
pub fn quick_select(x: &mut [f64], k: usize) -> f64 {
    assert!(k < x.len());

    let mut left = 0;
    let mut right = x.len() - 1;
    loop {
        if left == right {
            return x[left];
        }

        // Median of three pivot selection keeps sorted input from degrading to quadratic time
        let mid = left + (right - left) / 2;
        if x[mid] < x[left] {
            x.swap(mid, left);
        }
        if x[right] < x[left] {
            x.swap(right, left);
        }
        if x[right] < x[mid] {
            x.swap(right, mid);
        }
        let pivot = x[mid];
        x.swap(mid, right);

        let mut store = left;
        for i in left..right {
            if x[i] < pivot {
                x.swap(i, store);
                store += 1;
            }
        }
        x.swap(store, right);

        if k == store {
            return x[k];
        } else if k < store {
            right = store - 1;
        } else {
            left = store + 1;
        }
    }
}

/// Median of `x[start..end]`
///
/// Even-length ranges return the average of the two middle values. The input does not need to be
/// sorted and is not modified. An empty range returns NaN.
///
pub fn median(x: &[f64], start: usize, end: usize) -> f64 {
    assert!(start <= end && end <= x.len());
    let n = end - start;
    if n == 0 {
        return f64::NAN;
    }

    let mut values = x[start..end].to_vec();
    let upper = quick_select(&mut values, n / 2);
    if n % 2 == 1 {
        upper
    } else {
        // After selection everything left of n/2 is not greater than the upper middle value
        let lower = values[..n / 2]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        (lower + upper) / 2.0
    }
}

/// Median of the full slice
pub fn median_all(x: &[f64]) -> f64 {
    median(x, 0, x.len())
}

/// `constant * median(|x - median(x)|)`
///
pub fn median_absolute_deviation(x: &[f64], constant: f64) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    let center = median_all(x);
    let deviations = x.iter().map(|v| (v - center).abs()).collect::<Vec<_>>();
    constant * median_all(&deviations)
}

/// Lagged differences `x[i + lag] - x[i]`, with output length `x.len() - lag`
///
pub fn diff(x: &[f64], lag: usize) -> Vec<f64> {
    assert!(lag > 0);
    if x.len() <= lag {
        return Vec::new();
    }
    (0..(x.len() - lag)).map(|i| x[i + lag] - x[i]).collect()
}

pub fn cumulative_sum(x: &[f64]) -> Vec<f64> {
    let mut total = 0.0;
    x.iter()
        .map(|v| {
            total += v;
            total
        })
        .collect()
}

pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

fn weight_at(weights: Option<&[f64]>, index: usize) -> f64 {
    weights.map_or(1.0, |w| w[index])
}

/// Weighted mean of `x`, where missing weights are treated as all ones
///
pub fn weighted_average(x: &[f64], weights: Option<&[f64]>) -> f64 {
    if let Some(w) = weights {
        assert_eq!(x.len(), w.len());
    }
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for (i, v) in x.iter().enumerate() {
        let w = weight_at(weights, i);
        sum += w * v;
        weight_sum += w;
    }
    sum / weight_sum
}

/// Weighted sum of squared deviations of `x` from `center`
///
pub fn weighted_sum_of_squares(x: &[f64], weights: Option<&[f64]>, center: f64) -> f64 {
    if let Some(w) = weights {
        assert_eq!(x.len(), w.len());
    }
    x.iter()
        .enumerate()
        .map(|(i, v)| weight_at(weights, i) * (v - center).powi(2))
        .sum()
}

/// Sum of `w[i] * x[i]^power` over `start..end`
///
pub fn partial_sum_of_powers(
    x: &[f64],
    weights: Option<&[f64]>,
    power: i32,
    start: usize,
    end: usize,
) -> f64 {
    (start..end)
        .map(|i| weight_at(weights, i) * x[i].powi(power))
        .sum()
}

/// Indices of all values which are neither NaN nor infinite, in input order
///
pub fn get_finite_indices(x: &[f64]) -> Vec<usize> {
    x.iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, _)| i)
        .collect()
}

/// Index of the first maximum value
pub fn max_index<T: PartialOrd>(x: &[T]) -> usize {
    assert!(!x.is_empty());
    let mut mi = 0;
    for i in 1..x.len() {
        if x[i] > x[mi] {
            mi = i;
        }
    }
    mi
}

/// Variance inflation factor correcting the variance of a symmetrically trimmed standard normal
///
fn trim_inflation_factor(trim: f64) -> f64 {
    let a = qnorm(1.0 - trim);
    let steps = 10000;
    let width = 2.0 * a / steps as f64;
    let mut total = 0.0;
    for i in 0..steps {
        let x = -a + (i as f64 + 0.5) * width;
        total += x * x * dnorm(x);
    }
    1.0 / (total * width / (1.0 - 2.0 * trim))
}

/// Robust variance estimate from the squared absolute first differences, after discarding the
/// largest `2 * trim` fraction of them
///
pub fn trimmed_variance(x: &[f64], trim: f64) -> f64 {
    let n = x.len();
    if n < 2 {
        return 0.0;
    }
    let keep_count = ((1.0 - 2.0 * trim) * (n - 1) as f64).round() as usize;
    if keep_count == 0 {
        return 0.0;
    }
    let mut abs_diff = diff(x, 1).into_iter().map(f64::abs).collect::<Vec<_>>();
    abs_diff.sort_by(f64::total_cmp);
    let sum = abs_diff[..keep_count]
        .iter()
        .map(|v| v * v / (2.0 * keep_count as f64))
        .sum::<f64>();
    trim_inflation_factor(trim) * sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_median() {
        assert_eq!(median_all(&[5.0]), 5.0);
        assert_eq!(median_all(&[1.0, 3.0, 2.0, 4.0]), 2.5);
        assert_eq!(median(&[9.0, 1.0, 3.0, 2.0, 9.0], 1, 4), 2.0);
        assert!(median_all(&[]).is_nan());
    }

    #[test]
    fn test_median_matches_sort() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        for len in 1..40 {
            let x = (0..len)
                .map(|_| rng.random_range(0..10) as f64)
                .collect::<Vec<_>>();
            let mut sorted = x.clone();
            sorted.sort_by(f64::total_cmp);
            let expect = if len % 2 == 1 {
                sorted[len / 2]
            } else {
                (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
            };
            assert_eq!(median_all(&x), expect);
        }
    }

    #[test]
    fn test_quick_select_all_equal() {
        let mut x = vec![3.0; 17];
        assert_eq!(quick_select(&mut x, 8), 3.0);
    }

    #[test]
    fn test_mad() {
        let x = [1.0, 2.0, 3.0, 4.0, 100.0];
        approx::assert_ulps_eq!(
            median_absolute_deviation(&x, MAD_NORMAL_SCALE),
            1.4826,
            max_ulps = 4
        );
        assert_eq!(median_absolute_deviation(&[2.0; 5], MAD_NORMAL_SCALE), 0.0);
    }

    #[test]
    fn test_diff_cumsum_inverse() {
        let x = [3.0, -1.0, 4.0, 1.0, -5.0, 9.0];
        let mut padded = vec![0.0];
        padded.extend(cumulative_sum(&x));
        let restored = cumulative_sum(&diff(&padded, 1));
        let expect = cumulative_sum(&x);
        assert_eq!(restored, expect);
        assert_eq!(diff(&padded, 1), x.to_vec());
        assert_eq!(diff(&x, 2).len(), 4);
        assert!(diff(&[1.0], 1).is_empty());
    }

    #[test]
    fn test_weighted() {
        let x = [1.0, 2.0, 3.0];
        assert_eq!(weighted_average(&x, None), 2.0);
        assert_eq!(weighted_average(&x, Some(&[0.0, 0.0, 1.0])), 3.0);
        assert_eq!(weighted_sum_of_squares(&x, None, 2.0), 2.0);
        assert_eq!(partial_sum_of_powers(&x, None, 2, 1, 3), 13.0);
    }

    #[test]
    fn test_get_finite_indices() {
        let x = [1.0, f64::NAN, 2.0, f64::INFINITY, 3.0];
        assert_eq!(get_finite_indices(&x), vec![0, 2, 4]);
        assert!(get_finite_indices(&[]).is_empty());
    }

    #[test]
    fn test_trimmed_variance() {
        // Flat input has no variance
        assert_eq!(trimmed_variance(&[4.0; 20], 0.025), 0.0);

        // Unit-variance noise should give an estimate near 1
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let x = (0..20000)
            .map(|_| {
                // Sum of uniforms approximates a normal draw
                (0..12).map(|_| rng.random::<f64>()).sum::<f64>() - 6.0
            })
            .collect::<Vec<_>>();
        let v = trimmed_variance(&x, 0.025);
        assert!((v - 1.0).abs() < 0.05, "{v}");
    }
}
