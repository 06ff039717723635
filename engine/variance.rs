//! Random-effect variance decomposition.
//!
//! For a grouping factor with random-effect covariance Σ and per-observation
//! random-effect design rows zᵢ = (1, slope covariates), the variance the
//! factor contributes on the link scale is (Johnson 2014)
//!
//! ```text
//! σ²_l = Tr(Z Σ Zᵀ) / n = mean_i zᵢᵀ Σ zᵢ
//! ```
//!
//! which reduces to the intercept variance for random-intercept factors. The
//! engine widens population-level intervals by the mean of σ²_l over all
//! grouping factors of the relevant model part.

use crate::model::{GroupingFactor, ModelFrame};
use ndarray::Array1;

/// Mean random-effect variance of a set of grouping factors; `0.0` when there
/// are none.
pub fn mean_random_effect_variance(factors: &[GroupingFactor], frame: &ModelFrame) -> f64 {
    if factors.is_empty() {
        return 0.0;
    }
    let total: f64 = factors
        .iter()
        .map(|factor| factor_variance(factor, frame))
        .sum();
    total / factors.len() as f64
}

/// Johnson's σ²_l for one grouping factor.
pub fn factor_variance(factor: &GroupingFactor, frame: &ModelFrame) -> f64 {
    let sigma = &factor.covariance;
    let variance = if factor.slopes.is_empty() {
        sigma[(0, 0)]
    } else {
        let columns: Vec<&[f64]> = factor
            .slopes
            .iter()
            .filter_map(|slope| frame.numeric_values(slope).ok())
            .collect();
        let n = columns.iter().map(|c| c.len()).min().unwrap_or(0);
        if columns.len() != factor.slopes.len() || n == 0 {
            // No aligned observations: evaluate at the covariate means.
            let mut z = Array1::ones(factor.dim());
            for (k, column) in columns.iter().enumerate() {
                if !column.is_empty() {
                    z[k + 1] = column.iter().sum::<f64>() / column.len() as f64;
                }
            }
            z.dot(&sigma.dot(&z))
        } else {
            let mut z = Array1::ones(factor.dim());
            let mut sum = 0.0;
            for i in 0..n {
                for (k, column) in columns.iter().enumerate() {
                    z[k + 1] = column[i];
                }
                sum += z.dot(&sigma.dot(&z));
            }
            sum / n as f64
        }
    };

    if !variance.is_finite() || variance < 0.0 {
        log::warn!(
            "Random-effect variance of '{}' is {}; treating it as zero",
            factor.name,
            variance
        );
        return 0.0;
    }
    if variance == 0.0 {
        log::warn!(
            "Random-effect variance of '{}' is zero; prediction intervals will not widen",
            factor.name
        );
    }
    variance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupLevel, Variable};
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn intercept_only_factor_reduces_to_its_variance() {
        let factor = GroupingFactor::intercept("site", 0.7, Vec::new());
        assert_relative_eq!(factor_variance(&factor, &ModelFrame::new()), 0.7);
    }

    #[test]
    fn no_factors_means_no_variance() {
        assert_eq!(mean_random_effect_variance(&[], &ModelFrame::new()), 0.0);
    }

    #[test]
    fn mean_is_taken_across_factors() {
        let factors = vec![
            GroupingFactor::intercept("site", 0.4, Vec::new()),
            GroupingFactor::intercept("year", 1.0, Vec::new()),
        ];
        assert_relative_eq!(
            mean_random_effect_variance(&factors, &ModelFrame::new()),
            0.7
        );
    }

    #[test]
    fn random_slopes_average_over_observations() {
        // Σ = [[1, 0.5], [0.5, 2]], x ∈ {0, 1, 2}
        // zᵀΣz = 1 + 2·0.5·x + 2x² → 1, 4, 11 → mean 16/3
        let frame = ModelFrame::new().with("x", Variable::numeric(vec![0.0, 1.0, 2.0]));
        let factor = GroupingFactor {
            name: "site".into(),
            slopes: vec!["x".into()],
            covariance: array![[1.0, 0.5], [0.5, 2.0]],
            levels: vec![GroupLevel {
                level: "a".into(),
                modes: vec![0.0, 0.0],
                conditional_variance: None,
            }],
        };
        assert_relative_eq!(factor_variance(&factor, &frame), 16.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn negative_variance_is_clamped() {
        let factor = GroupingFactor::intercept("site", -0.1, Vec::new());
        assert_eq!(factor_variance(&factor, &ModelFrame::new()), 0.0);
    }
}
