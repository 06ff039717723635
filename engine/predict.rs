//! # Marginal Predictions
//!
//! Entry point of the engine. `predict_marginal` builds the prediction grid
//! for the requested focal terms and evaluates it under one of five
//! prediction types:
//!
//! | type            | point                        | interval                                      |
//! |-----------------|------------------------------|-----------------------------------------------|
//! | `fixed`         | g⁻¹(xβ̂)                      | confidence interval from xᵀVx                 |
//! | `random`        | g⁻¹(xβ̂)                      | prediction interval from xᵀVx + σ²_RE          |
//! | `zero_inflated` | μ̂(1 − π̂)                     | quantiles of draws of both sub-models          |
//! | `zi_random`     | μ̂(1 − π̂)                     | as above, with random-effect noise added       |
//! | `sim`           | mean of simulated responses  | quantiles of simulated responses               |
//!
//! Rows whose grid fixes a grouping factor to one of its levels add that
//! level's conditional modes to the linear predictor. The analytic types
//! report no standard error or interval for such rows.

use crate::faer_ndarray::FaerLinalgError;
use crate::grid::{CategoricalWeighting, Condition, GridError, PredictionGrid, Setting, Typical, build_grid};
use crate::model::{Capability, FittedModel, GroupLevel, GroupingFactor, LinearPredictor, ModelError};
use crate::quadrature::bias_corrected_mean_batch;
use crate::result::{PredictionResult, PredictionRow};
use crate::simulate::{
    DrawSummary, SimulationError, draw_mvn, draw_response, row_seeds, simulate_rows,
};
use crate::terms::{TermError, TermSpec};
use crate::variance::mean_random_effect_variance;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default number of Monte-Carlo draws for the simulated prediction types.
pub const DEFAULT_DRAWS: usize = 1000;

/// Default interval level.
pub const DEFAULT_CI_LEVEL: f64 = 0.95;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Population-level predictions with confidence intervals.
    #[default]
    Fixed,
    /// Population-level predictions with prediction intervals that include
    /// the random-effect variance.
    Random,
    /// Expected response of a zero-inflated model.
    ZeroInflated,
    /// Zero-inflated expectation with random-effect uncertainty in the interval.
    ZiRandom,
    /// Simulated responses.
    Sim,
}

impl PredictionType {
    /// Optional model parts this type cannot run without.
    pub fn required_capabilities(self) -> &'static [Capability] {
        match self {
            PredictionType::Fixed => &[],
            PredictionType::Random => &[Capability::RandomEffects],
            PredictionType::ZeroInflated => &[Capability::ZeroInflation],
            PredictionType::ZiRandom => &[Capability::RandomEffects, Capability::ZeroInflation],
            PredictionType::Sim => &[Capability::Dispersion],
        }
    }

    pub fn is_simulated(self) -> bool {
        matches!(
            self,
            PredictionType::ZeroInflated | PredictionType::ZiRandom | PredictionType::Sim
        )
    }
}

impl FromStr for PredictionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fe" => Ok(PredictionType::Fixed),
            "random" | "re" => Ok(PredictionType::Random),
            "zero_inflated" | "zi" | "fe.zi" => Ok(PredictionType::ZeroInflated),
            "zi_random" | "re.zi" => Ok(PredictionType::ZiRandom),
            "sim" | "simulate" => Ok(PredictionType::Sim),
            other => Err(format!(
                "unknown prediction type '{other}' (use fixed, random, zero_inflated, zi_random or sim)"
            )),
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PredictionType::Fixed => "fixed",
            PredictionType::Random => "random",
            PredictionType::ZeroInflated => "zero_inflated",
            PredictionType::ZiRandom => "zi_random",
            PredictionType::Sim => "sim",
        };
        f.write_str(name)
    }
}

/// Per-call options. Every field has a default, so a partial TOML table works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    /// Interval level in (0, 1).
    pub ci_level: f64,
    /// Monte-Carlo draws for the simulated types.
    pub draws: usize,
    /// Seed for sampling and simulation; fresh entropy when absent.
    pub seed: Option<u64>,
    pub typical: Typical,
    pub categorical: CategoricalWeighting,
    /// Report `E[g⁻¹(η)]` over the random-effect distribution for `random`.
    pub bias_correction: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            ci_level: DEFAULT_CI_LEVEL,
            draws: DEFAULT_DRAWS,
            seed: None,
            typical: Typical::default(),
            categorical: CategoricalWeighting::default(),
            bias_correction: false,
        }
    }
}

impl PredictOptions {
    pub fn validate(&self) -> Result<(), PredictionError> {
        if !(self.ci_level > 0.0 && self.ci_level < 1.0) {
            return Err(PredictionError::InvalidOptions(format!(
                "ci_level must lie strictly between 0 and 1, found {}",
                self.ci_level
            )));
        }
        if self.draws == 0 {
            return Err(PredictionError::InvalidOptions(
                "draws must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Invalid term: '{0}' is not a variable of the model.")]
    InvalidTerm(String),
    #[error("Prediction type '{prediction_type}' requires {capability}, which the model does not have.")]
    UnsupportedModel {
        prediction_type: PredictionType,
        capability: Capability,
    },
    #[error("No values remain for '{0}' after filtering or sampling.")]
    EmptyLevelSet(String),
    #[error("Malformed term: {0}")]
    TermSyntax(#[from] TermError),
    #[error("'{value}' is not a valid value for '{name}'.")]
    InvalidValue { name: String, value: String },
    #[error("Selector '{selector}' cannot be applied to categorical variable '{name}'.")]
    InvalidSelector { name: String, selector: String },
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("Model description is inconsistent: {0}")]
    Model(#[from] ModelError),
    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
    #[error("Simulation failed: {0}")]
    Simulation(SimulationError),
}

impl From<GridError> for PredictionError {
    fn from(err: GridError) -> Self {
        match err {
            GridError::UnknownVariable(name) => PredictionError::InvalidTerm(name),
            GridError::EmptyLevelSet(name) => PredictionError::EmptyLevelSet(name),
            GridError::InvalidValue { name, value } => PredictionError::InvalidValue { name, value },
            GridError::SelectorKind { name, selector } => {
                PredictionError::InvalidSelector { name, selector }
            }
        }
    }
}

impl From<SimulationError> for PredictionError {
    fn from(err: SimulationError) -> Self {
        match err {
            SimulationError::Linalg(inner) => PredictionError::Linalg(inner),
            other => PredictionError::Simulation(other),
        }
    }
}

/// Computes adjusted predictions for `terms` under `prediction_type`.
///
/// Returns one row per grid row, in grid order (the first focal term varies
/// slowest).
pub fn predict_marginal(
    model: &FittedModel,
    terms: &TermSpec,
    prediction_type: PredictionType,
    condition: &Condition,
    options: &PredictOptions,
) -> Result<PredictionResult, PredictionError> {
    options.validate()?;
    model.validate()?;
    for &capability in prediction_type.required_capabilities() {
        if !model.has(capability) {
            return Err(PredictionError::UnsupportedModel {
                prediction_type,
                capability,
            });
        }
    }

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let grid = build_grid(
        model,
        terms,
        condition,
        options.typical,
        options.categorical,
        &mut rng,
    )?;

    log::info!(
        "Computing '{}' predictions for [{}] over {} grid rows",
        prediction_type,
        terms.names().join(", "),
        grid.len()
    );

    let rows = match prediction_type {
        PredictionType::Fixed | PredictionType::Random => {
            analytic_rows(model, &grid, prediction_type, options)?
        }
        PredictionType::ZeroInflated | PredictionType::ZiRandom => {
            zero_inflated_rows(model, &grid, prediction_type, options, &mut rng)?
        }
        PredictionType::Sim => simulated_rows(model, &grid, options, &mut rng)?,
    };

    Ok(PredictionResult {
        terms: terms.names(),
        prediction_type,
        ci_level: options.ci_level,
        rows,
    })
}

/// Random-effect contribution of one grouping factor to one grid row.
struct Effect<'m> {
    /// Index into the factors of the model part.
    factor: usize,
    /// Random-effect design row: 1 followed by the slope covariates.
    z: Vec<f64>,
    /// The level the grid fixes this factor to; `None` at the population level.
    level: Option<&'m GroupLevel>,
}

impl Effect<'_> {
    fn mode_offset(&self) -> f64 {
        self.level
            .map_or(0.0, |level| dot(&self.z, &level.modes))
    }

    /// One draw of `zᵀb` with `b ~ N(mode, conditional variance)`.
    fn conditional_draw(&self, level: &GroupLevel, rng: &mut StdRng) -> f64 {
        self.z
            .iter()
            .enumerate()
            .map(|(j, zj)| {
                let sd = level
                    .conditional_variance
                    .as_ref()
                    .map_or(0.0, |variances| variances[j].max(0.0).sqrt());
                let noise: f64 = if sd > 0.0 { rng.sample(StandardNormal) } else { 0.0 };
                zj * (level.modes[j] + sd * noise)
            })
            .sum()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn row_effects<'m>(
    factors: &'m [GroupingFactor],
    grid: &PredictionGrid,
    row: usize,
) -> Result<Vec<Effect<'m>>, PredictionError> {
    factors
        .iter()
        .enumerate()
        .map(|(index, factor)| {
            let mut z = Vec::with_capacity(factor.dim());
            z.push(1.0);
            for slope in &factor.slopes {
                match grid.setting(row, slope) {
                    Some(Setting::Number(x)) => z.push(*x),
                    Some(other) => {
                        return Err(ModelError::SettingMismatch {
                            name: slope.clone(),
                            found: other.to_string(),
                        }
                        .into());
                    }
                    None => return Err(ModelError::MissingSetting(slope.clone()).into()),
                }
            }
            let level = match grid.setting(row, &factor.name) {
                Some(Setting::Level(label)) => {
                    Some(factor.level(label).ok_or_else(|| PredictionError::InvalidValue {
                        name: factor.name.clone(),
                        value: label.clone(),
                    })?)
                }
                _ => None,
            };
            Ok(Effect {
                factor: index,
                z,
                level,
            })
        })
        .collect()
}

/// One linear predictor evaluated on every grid row.
struct PartRows<'m> {
    part: &'m LinearPredictor,
    x: Array2<f64>,
    /// `xβ̂` plus the conditional modes of fixed levels.
    eta: Array1<f64>,
    effects: Vec<Vec<Effect<'m>>>,
}

impl<'m> PartRows<'m> {
    fn new(
        part: &'m LinearPredictor,
        factors: &'m [GroupingFactor],
        grid: &PredictionGrid,
        model: &FittedModel,
    ) -> Result<Self, PredictionError> {
        let x = part.design_matrix(grid, &model.frame)?;
        let effects = (0..grid.len())
            .map(|row| row_effects(factors, grid, row))
            .collect::<Result<Vec<_>, _>>()?;
        let mut eta = x.dot(&part.coefficients);
        for (value, row) in eta.iter_mut().zip(&effects) {
            *value += row.iter().map(Effect::mode_offset).sum::<f64>();
        }
        Ok(Self {
            part,
            x,
            eta,
            effects,
        })
    }

    /// Whether the row conditions on a specific grouping level.
    fn is_level_row(&self, row: usize) -> bool {
        self.effects[row].iter().any(|e| e.level.is_some())
    }

    /// `xᵢᵀ V xᵢ` for every row.
    fn fixed_variance(&self) -> Array1<f64> {
        let xv = self.x.dot(&self.part.covariance);
        (&xv * &self.x).sum_axis(Axis(1))
    }

    /// `β_d x` for every draw `d` (rows of the result) and grid row (columns).
    fn linear_draws(&self, draws: usize, rng: &mut StdRng) -> Result<Array2<f64>, SimulationError> {
        let beta = draw_mvn(&self.part.coefficients, &self.part.covariance, draws, rng)?;
        Ok(beta.dot(&self.x.t()))
    }

    /// Random-effect offset of one draw for the zero-inflated types.
    ///
    /// Without `population_sd` the offset is the fixed conditional modes.
    /// With it, level rows draw around their modes and population rows add
    /// `N(0, population_sd²)` noise.
    fn noisy_offset(&self, row: usize, population_sd: Option<f64>, rng: &mut StdRng) -> f64 {
        let effects = &self.effects[row];
        match population_sd {
            None => effects.iter().map(Effect::mode_offset).sum(),
            Some(_) if self.is_level_row(row) => effects
                .iter()
                .filter_map(|e| e.level.map(|level| e.conditional_draw(level, rng)))
                .sum(),
            Some(sd) if sd > 0.0 => sd * rng.sample::<f64, _>(StandardNormal),
            Some(_) => 0.0,
        }
    }

    /// Random-effect offset of draw `draw` for the `sim` type: fixed levels
    /// draw around their modes, every other factor uses the shared
    /// population draw of that iteration.
    fn simulated_offset(
        &self,
        row: usize,
        draw: usize,
        population: &[Array2<f64>],
        rng: &mut StdRng,
    ) -> f64 {
        self.effects[row]
            .iter()
            .map(|effect| match effect.level {
                Some(level) => effect.conditional_draw(level, rng),
                None => {
                    let b = population[effect.factor].row(draw);
                    effect.z.iter().zip(b.iter()).map(|(z, b)| z * b).sum::<f64>()
                }
            })
            .sum()
    }
}

/// Two-sided critical value for `ci_level`: Student-t when residual degrees
/// of freedom are known, standard normal otherwise.
fn critical_value(residual_df: Option<f64>, ci_level: f64) -> Result<f64, PredictionError> {
    let p = (1.0 + ci_level) / 2.0;
    match residual_df {
        Some(df) => StudentsT::new(0.0, 1.0, df)
            .map(|t| t.inverse_cdf(p))
            .map_err(|_| PredictionError::Model(ModelError::InvalidResidualDf(df))),
        None => Ok(Normal::standard().inverse_cdf(p)),
    }
}

/// Orders an interval around its point estimate. Quantile intervals of skewed
/// draws can exclude the estimate computed at the coefficient estimates.
fn bracket(predicted: f64, lower: f64, upper: f64) -> (f64, f64) {
    (lower.min(predicted), upper.max(predicted))
}

fn analytic_rows(
    model: &FittedModel,
    grid: &PredictionGrid,
    prediction_type: PredictionType,
    options: &PredictOptions,
) -> Result<Vec<PredictionRow>, PredictionError> {
    let cond = PartRows::new(&model.conditional, model.conditional_factors(), grid, model)?;
    let link = model.conditional.link;

    let re_variance = match prediction_type {
        PredictionType::Random => {
            let variance = mean_random_effect_variance(model.conditional_factors(), &model.frame);
            log::debug!("Mean random-effect variance of the conditional model: {variance:.6}");
            variance
        }
        _ => 0.0,
    };
    let variance = cond.fixed_variance() + re_variance;
    let crit = critical_value(model.residual_df, options.ci_level)?;

    let population_point = if prediction_type == PredictionType::Random && options.bias_correction
    {
        bias_corrected_mean_batch(link, &cond.eta, re_variance)
    } else {
        cond.eta.mapv(|eta| link.inverse(eta))
    };

    let rows = (0..grid.len())
        .map(|row| {
            let eta = cond.eta[row];
            if cond.is_level_row(row) {
                return PredictionRow {
                    values: grid.focal_values(row),
                    predicted: link.inverse(eta),
                    std_error: None,
                    conf_low: None,
                    conf_high: None,
                };
            }
            let se = variance[row].max(0.0).sqrt();
            let predicted = population_point[row];
            let (low, high) = link.inverse_interval(eta - crit * se, eta + crit * se);
            let (low, high) = bracket(predicted, low, high);
            PredictionRow {
                values: grid.focal_values(row),
                predicted,
                std_error: Some(se),
                conf_low: Some(low),
                conf_high: Some(high),
            }
        })
        .collect();
    Ok(rows)
}

fn zero_inflated_rows(
    model: &FittedModel,
    grid: &PredictionGrid,
    prediction_type: PredictionType,
    options: &PredictOptions,
    rng: &mut StdRng,
) -> Result<Vec<PredictionRow>, PredictionError> {
    let zi_part = model
        .zero_inflation
        .as_ref()
        .ok_or(PredictionError::UnsupportedModel {
            prediction_type,
            capability: Capability::ZeroInflation,
        })?;
    let cond = PartRows::new(&model.conditional, model.conditional_factors(), grid, model)?;
    let zi = PartRows::new(zi_part, model.zero_inflation_factors(), grid, model)?;

    let (cond_sd, zi_sd) = match prediction_type {
        PredictionType::ZiRandom => {
            let cond_var = mean_random_effect_variance(model.conditional_factors(), &model.frame);
            let zi_var = mean_random_effect_variance(model.zero_inflation_factors(), &model.frame);
            log::debug!(
                "Random-effect variances: conditional {cond_var:.6}, zero-inflation {zi_var:.6}"
            );
            (Some(cond_var.sqrt()), Some(zi_var.sqrt()))
        }
        _ => (None, None),
    };

    let draws = options.draws;
    let cond_draws = cond.linear_draws(draws, rng)?;
    let zi_draws = zi.linear_draws(draws, rng)?;
    let seeds = row_seeds(rng, grid.len());

    let cond_link = cond.part.link;
    let zi_link = zi.part.link;
    let summaries = simulate_rows(&seeds, options.ci_level, |row, row_rng| {
        Ok((0..draws)
            .map(|d| {
                let mu = cond_link
                    .inverse(cond_draws[(d, row)] + cond.noisy_offset(row, cond_sd, row_rng));
                let pi =
                    zi_link.inverse(zi_draws[(d, row)] + zi.noisy_offset(row, zi_sd, row_rng));
                mu * (1.0 - pi)
            })
            .collect())
    })?;

    let rows = summaries
        .into_iter()
        .enumerate()
        .map(|(row, summary)| {
            let predicted =
                cond_link.inverse(cond.eta[row]) * (1.0 - zi_link.inverse(zi.eta[row]));
            let (low, high) = bracket(predicted, summary.lower, summary.upper);
            PredictionRow {
                values: grid.focal_values(row),
                predicted,
                std_error: None,
                conf_low: Some(low),
                conf_high: Some(high),
            }
        })
        .collect();
    Ok(rows)
}

/// Population-level random-effect draws, one `draws × dim` matrix per factor.
fn population_draws(
    factors: &[GroupingFactor],
    draws: usize,
    rng: &mut StdRng,
) -> Result<Vec<Array2<f64>>, SimulationError> {
    factors
        .iter()
        .map(|factor| draw_mvn(&Array1::zeros(factor.dim()), &factor.covariance, draws, rng))
        .collect()
}

fn simulated_rows(
    model: &FittedModel,
    grid: &PredictionGrid,
    options: &PredictOptions,
    rng: &mut StdRng,
) -> Result<Vec<PredictionRow>, PredictionError> {
    let draws = options.draws;
    let cond = PartRows::new(&model.conditional, model.conditional_factors(), grid, model)?;
    let zi = model
        .zero_inflation
        .as_ref()
        .map(|part| PartRows::new(part, model.zero_inflation_factors(), grid, model))
        .transpose()?;

    let cond_draws = cond.linear_draws(draws, rng)?;
    let zi_draws = zi
        .as_ref()
        .map(|zi| zi.linear_draws(draws, rng))
        .transpose()?;
    let cond_re = population_draws(model.conditional_factors(), draws, rng)?;
    let zi_re = population_draws(model.zero_inflation_factors(), draws, rng)?;
    let seeds = row_seeds(rng, grid.len());

    let family = model.family;
    let dispersion = model.dispersion;
    let summaries: Vec<DrawSummary> = simulate_rows(&seeds, options.ci_level, |row, row_rng| {
        (0..draws)
            .map(|d| {
                let eta = cond_draws[(d, row)] + cond.simulated_offset(row, d, &cond_re, row_rng);
                let mu = cond.part.link.inverse(eta);
                if let (Some(zi), Some(zi_draws)) = (&zi, &zi_draws) {
                    let eta_zi = zi_draws[(d, row)] + zi.simulated_offset(row, d, &zi_re, row_rng);
                    let pi = zi.part.link.inverse(eta_zi);
                    if row_rng.gen_range(0.0..1.0) < pi {
                        return Ok(0.0);
                    }
                }
                draw_response(family, mu, dispersion, row_rng)
            })
            .collect()
    })?;

    let rows = summaries
        .into_iter()
        .enumerate()
        .map(|(row, summary)| {
            let (low, high) = bracket(summary.mean, summary.lower, summary.upper);
            PredictionRow {
                values: grid.focal_values(row),
                predicted: summary.mean,
                std_error: None,
                conf_low: Some(low),
                conf_high: Some(high),
            }
        })
        .collect();
    Ok(rows)
}
