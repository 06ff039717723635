//! # Simulation
//!
//! Monte-Carlo building blocks for the prediction types without a closed-form
//! interval:
//!
//! - multivariate-normal parameter draws `mean + R z`, with `R Rᵀ = Σ`;
//! - response draws from the model family at a given mean;
//! - empirical summaries (mean and type-7 quantile interval) of the draws;
//! - a parallel per-row driver.
//!
//! All parameter draws come sequentially from the single per-call `StdRng`.
//! Rows are evaluated in parallel, each with its own generator seeded from a
//! value taken from that same `StdRng`, so results only depend on the seed and
//! never on the number of threads.

use crate::faer_ndarray::{FaerLinalgError, covariance_root};
use crate::model::Family;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Bernoulli, Beta, Distribution, Gamma, Normal, Poisson, StandardNormal};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Could not factor the covariance matrix for parameter draws: {0}")]
    Linalg(#[from] FaerLinalgError),
    #[error("Simulating {0} responses requires a dispersion parameter, but the model has none.")]
    MissingDispersion(Family),
    #[error("Cannot draw {family} responses with mean {mean}: {detail}")]
    Distribution {
        family: Family,
        mean: f64,
        detail: String,
    },
    #[error("Row {0} produced no finite draws.")]
    NoFiniteDraws(usize),
}

/// Mean and equal-tailed interval of a set of draws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawSummary {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Empirical quantile of sorted data, linearly interpolated between order
/// statistics (R's type 7).
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let below = h.floor() as usize;
            let above = (below + 1).min(n - 1);
            let fraction = h - below as f64;
            sorted[below] + fraction * (sorted[above] - sorted[below])
        }
    }
}

/// Summarizes draws by their mean and the `(1 ± ci_level) / 2` quantiles.
/// Non-finite draws are discarded; `None` when nothing finite remains.
pub fn summarize(mut draws: Vec<f64>, ci_level: f64) -> Option<DrawSummary> {
    draws.retain(|d| d.is_finite());
    if draws.is_empty() {
        return None;
    }
    draws.sort_by(f64::total_cmp);
    let tail = (1.0 - ci_level) / 2.0;
    let mean = draws.iter().sum::<f64>() / draws.len() as f64;
    Some(DrawSummary {
        mean,
        lower: quantile_sorted(&draws, tail),
        upper: quantile_sorted(&draws, 1.0 - tail),
    })
}

/// Draws `n` vectors from `N(mean, covariance)`, one per row of the result.
pub fn draw_mvn(
    mean: &Array1<f64>,
    covariance: &Array2<f64>,
    n: usize,
    rng: &mut StdRng,
) -> Result<Array2<f64>, SimulationError> {
    let root = covariance_root(covariance)?;
    let p = mean.len();
    let z = Array2::from_shape_simple_fn((n, p), || rng.sample::<f64, _>(StandardNormal));
    let mut draws = z.dot(&root.t());
    for mut row in draws.rows_mut() {
        row += mean;
    }
    Ok(draws)
}

/// Seeds for the per-row generators, drawn in row order.
pub fn row_seeds(rng: &mut StdRng, rows: usize) -> Vec<u64> {
    (0..rows).map(|_| rng.next_u64()).collect()
}

/// Draws one response from `family` with mean `mu`.
///
/// `dispersion` is the residual SD (Gaussian), size θ (negative binomial),
/// φ with `Var = φμ²` (Gamma) or precision φ (Beta).
pub fn draw_response<R: Rng + ?Sized>(
    family: Family,
    mu: f64,
    dispersion: Option<f64>,
    rng: &mut R,
) -> Result<f64, SimulationError> {
    let fail = |detail: String| SimulationError::Distribution {
        family,
        mean: mu,
        detail,
    };
    let dispersion = || dispersion.ok_or(SimulationError::MissingDispersion(family));

    // Extreme parameter draws can push the mean outside the family's support;
    // such draws come back as NaN and are dropped by `summarize`.
    let in_support = match family {
        Family::Gamma => mu > 0.0,
        Family::Beta => mu > 0.0 && mu < 1.0,
        _ => true,
    };
    if !(mu.is_finite() && in_support) {
        return Ok(f64::NAN);
    }

    match family {
        Family::Gaussian => {
            let normal = Normal::new(mu, dispersion()?).map_err(|e| fail(e.to_string()))?;
            Ok(normal.sample(rng))
        }
        Family::Binomial => {
            let trial = Bernoulli::new(mu.clamp(0.0, 1.0)).map_err(|e| fail(e.to_string()))?;
            Ok(if trial.sample(rng) { 1.0 } else { 0.0 })
        }
        Family::Poisson => draw_poisson(mu, rng).map_err(fail),
        Family::NegativeBinomial => {
            // Gamma-Poisson mixture with E[λ] = μ and shape θ.
            if !(mu > 0.0) {
                return Ok(0.0);
            }
            let theta = dispersion()?;
            let gamma = Gamma::new(theta, mu / theta).map_err(|e| fail(e.to_string()))?;
            draw_poisson(gamma.sample(rng), rng).map_err(fail)
        }
        Family::Gamma => {
            let phi = dispersion()?;
            let gamma = Gamma::new(1.0 / phi, mu * phi).map_err(|e| fail(e.to_string()))?;
            Ok(gamma.sample(rng))
        }
        Family::Beta => {
            let phi = dispersion()?;
            let beta =
                Beta::new(mu * phi, (1.0 - mu) * phi).map_err(|e| fail(e.to_string()))?;
            Ok(beta.sample(rng))
        }
    }
}

fn draw_poisson<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> Result<f64, String> {
    if !(lambda > 0.0) {
        return Ok(0.0);
    }
    let poisson = Poisson::new(lambda).map_err(|e| e.to_string())?;
    Ok(poisson.sample(rng))
}

/// Evaluates `draws_for_row` for every row in parallel and summarizes each
/// row's draws. `draws_for_row` receives the row index and a generator seeded
/// from `seeds[row]`.
pub fn simulate_rows<F>(
    seeds: &[u64],
    ci_level: f64,
    draws_for_row: F,
) -> Result<Vec<DrawSummary>, SimulationError>
where
    F: Fn(usize, &mut StdRng) -> Result<Vec<f64>, SimulationError> + Sync,
{
    seeds
        .par_iter()
        .enumerate()
        .map(|(row, &seed)| {
            let mut rng = StdRng::seed_from_u64(seed);
            let draws = draws_for_row(row, &mut rng)?;
            let total = draws.len();
            let summary = summarize(draws, ci_level).ok_or(SimulationError::NoFiniteDraws(row))?;
            log::trace!("Row {row}: summarized {total} draws");
            Ok(summary)
        })
        .collect()
}
