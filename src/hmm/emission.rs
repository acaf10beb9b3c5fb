use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Discrete, NegativeBinomial, Normal, Poisson};

/// Lower bound applied to every estimated variance
const MIN_VARIANCE: f64 = f64::EPSILON;

/// Lower bound applied to the means of the count distributions
const MIN_COUNT_MEAN: f64 = f64::EPSILON;

/// Negative binomial variance is kept at least this factor above the mean
const MIN_NB_OVERDISPERSION: f64 = 1.001;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EmissionKind {
    #[default]
    Gaussian,
    Poisson,
    NegativeBinomial,
}

/// Emission distribution of one hidden state
///
/// Each distribution is multivariate over samples, with independent dimensions.
///
#[derive(Clone, Debug)]
pub enum EmissionDistribution {
    Gaussian { mean: Vec<f64>, variance: Vec<f64> },
    Poisson { mean: Vec<f64> },
    NegativeBinomial { mean: Vec<f64>, variance: Vec<f64> },
}

/// Observations are rounded to the nearest non-negative count for the discrete distributions
fn to_count(x: f64) -> u64 {
    x.max(0.0).round() as u64
}

fn floor_count_mean(mean: Vec<f64>) -> Vec<f64> {
    mean.into_iter().map(|m| m.max(MIN_COUNT_MEAN)).collect()
}

fn floor_variance(variance: Vec<f64>) -> Vec<f64> {
    variance.into_iter().map(|v| v.max(MIN_VARIANCE)).collect()
}

fn gaussian_ln_pdf(mean: f64, variance: f64, x: f64) -> f64 {
    match Normal::new(mean, variance.sqrt()) {
        Ok(pd) => pd.ln_pdf(x),
        Err(_) => f64::NEG_INFINITY,
    }
}

fn poisson_ln_pmf(mean: f64, x: f64) -> f64 {
    match Poisson::new(mean) {
        Ok(pd) => pd.ln_pmf(to_count(x)),
        Err(_) => f64::NEG_INFINITY,
    }
}

/// Negative binomial log pmf parameterized by mean and variance
fn negative_binomial_ln_pmf(mean: f64, variance: f64, x: f64) -> f64 {
    let p = mean / variance;
    let r = mean * mean / (variance - mean);
    match NegativeBinomial::new(r, p) {
        Ok(pd) => pd.ln_pmf(to_count(x)),
        Err(_) => f64::NEG_INFINITY,
    }
}

impl EmissionDistribution {
    /// Create a distribution of the given kind, applying the parameter floors of that kind
    ///
    /// `variance` is ignored for the Poisson distribution.
    ///
    pub fn new(kind: EmissionKind, mean: Vec<f64>, variance: Vec<f64>) -> Self {
        assert_eq!(mean.len(), variance.len());
        match kind {
            EmissionKind::Gaussian => Self::Gaussian {
                mean,
                variance: floor_variance(variance),
            },
            EmissionKind::Poisson => Self::Poisson {
                mean: floor_count_mean(mean),
            },
            EmissionKind::NegativeBinomial => {
                let mean = floor_count_mean(mean);
                let variance = mean
                    .iter()
                    .zip(variance)
                    .map(|(m, v)| v.max(m * MIN_NB_OVERDISPERSION))
                    .collect();
                Self::NegativeBinomial { mean, variance }
            }
        }
    }

    pub fn kind(&self) -> EmissionKind {
        match self {
            Self::Gaussian { .. } => EmissionKind::Gaussian,
            Self::Poisson { .. } => EmissionKind::Poisson,
            Self::NegativeBinomial { .. } => EmissionKind::NegativeBinomial,
        }
    }

    pub fn mean(&self) -> &[f64] {
        match self {
            Self::Gaussian { mean, .. }
            | Self::Poisson { mean }
            | Self::NegativeBinomial { mean, .. } => mean,
        }
    }

    /// Log likelihood of one multi-sample observation
    pub fn ln_likelihood(&self, observation: &[f64]) -> f64 {
        assert_eq!(observation.len(), self.mean().len());
        match self {
            Self::Gaussian { mean, variance } => observation
                .iter()
                .zip(mean.iter().zip(variance))
                .map(|(&x, (&m, &v))| gaussian_ln_pdf(m, v, x))
                .sum(),
            Self::Poisson { mean } => observation
                .iter()
                .zip(mean)
                .map(|(&x, &m)| poisson_ln_pmf(m, x))
                .sum(),
            Self::NegativeBinomial { mean, variance } => observation
                .iter()
                .zip(mean.iter().zip(variance))
                .map(|(&x, (&m, &v))| negative_binomial_ln_pmf(m, v, x))
                .sum(),
        }
    }

    /// Likelihood of one multi-sample observation
    pub fn estimate_likelihood(&self, observation: &[f64]) -> f64 {
        self.ln_likelihood(observation).exp()
    }

    /// Replace the distribution parameters with re-estimated values
    pub fn update(&mut self, mean: Vec<f64>, variance: Vec<f64>) {
        *self = Self::new(self.kind(), mean, variance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poisson_emission() {
        // Value should match `log(dpois(5,10))` in R:
        let pd = EmissionDistribution::new(EmissionKind::Poisson, vec![10.0], vec![0.0]);
        approx::assert_relative_eq!(
            pd.ln_likelihood(&[5.0]),
            -3.2745662778118154,
            max_relative = 1e-12
        );

        // Dimensions are independent
        let pd = EmissionDistribution::new(EmissionKind::Poisson, vec![10.0, 10.0], vec![0.0; 2]);
        approx::assert_relative_eq!(
            pd.ln_likelihood(&[5.0, 5.0]),
            2.0 * -3.2745662778118154,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_gaussian_emission() {
        let pd = EmissionDistribution::new(EmissionKind::Gaussian, vec![0.0], vec![1.0]);
        approx::assert_relative_eq!(
            pd.estimate_likelihood(&[0.0]),
            0.3989422804014327,
            max_relative = 1e-12
        );
        assert_eq!(pd.mean(), &[0.0]);

        // Zero variance is floored rather than rejected
        let pd = EmissionDistribution::new(EmissionKind::Gaussian, vec![1.0], vec![0.0]);
        assert!(pd.ln_likelihood(&[1.0]).is_finite());
    }

    #[test]
    fn test_negative_binomial_emission() {
        // Value should match `log(dnbinom(3, mu=4, size=8))` in R:
        let pd = EmissionDistribution::new(EmissionKind::NegativeBinomial, vec![4.0], vec![6.0]);
        approx::assert_relative_eq!(
            pd.ln_likelihood(&[3.0]),
            -1.7520659880875988,
            max_relative = 1e-10
        );

        // Variance below the mean is raised to keep the distribution valid
        let pd = EmissionDistribution::new(EmissionKind::NegativeBinomial, vec![4.0], vec![1.0]);
        assert!(pd.ln_likelihood(&[4.0]).is_finite());
    }

    #[test]
    fn test_update_keeps_kind() {
        let mut pd = EmissionDistribution::new(EmissionKind::Poisson, vec![1.0], vec![1.0]);
        pd.update(vec![0.0], vec![0.0]);
        assert_eq!(pd.kind(), EmissionKind::Poisson);
        assert!(pd.mean()[0] > 0.0);
    }
}
