use crate::grid::{PredictionGrid, Setting};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of a fitted model
// when serialized to a TOML file. The model is produced by an external fitting
// library; this crate only reads it.

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    /// For continuous outcomes (e.g., Gaussian regression).
    Identity,
    /// For counts and positive outcomes. Maps (0, inf) to the real line.
    Log,
    /// For binary or proportional outcomes (e.g., logistic or beta regression).
    /// Maps probabilities (0, 1) to the real line (-inf, +inf).
    Logit,
    Probit,
    /// Complementary log-log.
    Cloglog,
    /// Canonical link of the Gamma family. Monotone decreasing.
    Inverse,
    Sqrt,
}

impl LinkFunction {
    /// Maps the linear predictor back onto the response scale.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Identity => eta,
            LinkFunction::Log => eta.clamp(-700.0, 700.0).exp(),
            LinkFunction::Logit => {
                // Clamp eta to prevent numerical overflow in exp()
                let eta_clamped = eta.clamp(-700.0, 700.0);
                let prob = 1.0 / (1.0 + f64::exp(-eta_clamped));
                prob.clamp(1e-8, 1.0 - 1e-8)
            }
            LinkFunction::Probit => standard_normal_cdf(eta).clamp(1e-8, 1.0 - 1e-8),
            LinkFunction::Cloglog => {
                let prob = 1.0 - f64::exp(-f64::exp(eta.clamp(-700.0, 700.0)));
                prob.clamp(1e-8, 1.0 - 1e-8)
            }
            LinkFunction::Inverse => 1.0 / eta,
            LinkFunction::Sqrt => eta.max(0.0).powi(2),
        }
    }

    /// Whether `inverse` preserves ordering. Interval bounds computed on the
    /// link scale must be swapped after back-transformation when it does not.
    pub fn is_increasing(self) -> bool {
        !matches!(self, LinkFunction::Inverse)
    }

    /// Back-transforms a link-scale interval, keeping `lower <= upper`.
    pub fn inverse_interval(self, lower_eta: f64, upper_eta: f64) -> (f64, f64) {
        let a = self.inverse(lower_eta);
        let b = self.inverse(upper_eta);
        if self.is_increasing() { (a, b) } else { (b, a) }
    }
}

impl fmt::Display for LinkFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkFunction::Identity => "identity",
            LinkFunction::Log => "log",
            LinkFunction::Logit => "logit",
            LinkFunction::Probit => "probit",
            LinkFunction::Cloglog => "cloglog",
            LinkFunction::Inverse => "inverse",
            LinkFunction::Sqrt => "sqrt",
        };
        f.write_str(name)
    }
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// The response distribution of the conditional model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Gaussian,
    /// Bernoulli trials; simulated responses are 0/1.
    Binomial,
    Poisson,
    /// NB2 parameterisation; `dispersion` holds the size parameter θ.
    NegativeBinomial,
    /// `dispersion` holds φ with Var(y) = φ μ².
    Gamma,
    /// Mean/precision parameterisation; `dispersion` holds the precision φ.
    Beta,
}

impl Family {
    pub fn canonical_link(self) -> LinkFunction {
        match self {
            Family::Gaussian => LinkFunction::Identity,
            Family::Binomial | Family::Beta => LinkFunction::Logit,
            Family::Poisson | Family::NegativeBinomial => LinkFunction::Log,
            Family::Gamma => LinkFunction::Inverse,
        }
    }

    /// Families whose response draws need a dispersion parameter.
    pub fn needs_dispersion(self) -> bool {
        matches!(
            self,
            Family::Gaussian | Family::NegativeBinomial | Family::Gamma | Family::Beta
        )
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Gaussian => "gaussian",
            Family::Binomial => "binomial",
            Family::Poisson => "poisson",
            Family::NegativeBinomial => "negative_binomial",
            Family::Gamma => "gamma",
            Family::Beta => "beta",
        };
        f.write_str(name)
    }
}

/// A value a predictor can be pinned to: a number for numeric variables or a
/// level label for categorical ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Level(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Level(label) => label.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(x) => f.write_str(&format_number(*x)),
            Value::Level(label) => f.write_str(label),
        }
    }
}

/// Formats integral values without a trailing `.0` so they match level labels
/// such as `"2"`.
pub(crate) fn format_number(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        let mut buffer = ryu::Buffer::new();
        buffer.format(x).to_string()
    }
}

/// Summary of one column of the data the model was fitted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Variable {
    /// Observed values, one per observation. Numeric columns of the same frame
    /// are aligned by observation index.
    Numeric { values: Vec<f64> },
    /// Ordered levels; the first level is the reference level.
    Categorical {
        levels: Vec<String>,
        #[serde(default)]
        counts: Vec<usize>,
    },
}

impl Variable {
    pub fn numeric(values: Vec<f64>) -> Self {
        Variable::Numeric { values }
    }

    /// Categorical variable with equal counts per level.
    pub fn categorical<S: Into<String>>(levels: impl IntoIterator<Item = S>) -> Self {
        let levels: Vec<String> = levels.into_iter().map(Into::into).collect();
        let counts = vec![1; levels.len()];
        Variable::Categorical { levels, counts }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Variable::Numeric { .. })
    }

    pub fn levels(&self) -> Option<&[String]> {
        match self {
            Variable::Categorical { levels, .. } => Some(levels),
            Variable::Numeric { .. } => None,
        }
    }

    /// Observed share of each level. Falls back to equal shares when counts
    /// are missing or do not line up with the levels.
    pub fn level_proportions(&self) -> Option<Vec<f64>> {
        let Variable::Categorical { levels, counts } = self else {
            return None;
        };
        let total: usize = counts.iter().sum();
        if counts.len() != levels.len() || total == 0 {
            let share = 1.0 / levels.len().max(1) as f64;
            return Some(vec![share; levels.len()]);
        }
        Some(
            counts
                .iter()
                .map(|&count| count as f64 / total as f64)
                .collect(),
        )
    }
}

/// The model frame: every variable the fixed-effect terms and random slopes
/// refer to, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelFrame {
    columns: BTreeMap<String, Variable>,
}

impl ModelFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, variable: Variable) -> Self {
        self.insert(name, variable);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, variable: Variable) {
        self.columns.insert(name.into(), variable);
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.columns.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Replaces or adds every column of `other`.
    ///
    /// Categorical variables already in the frame keep their level order, since
    /// it fixes the treatment coding of the fitted coefficients; only their
    /// counts are taken from `other`. Every stored level must be observed and
    /// every observed label must be a stored level.
    pub fn merge(&mut self, other: ModelFrame) -> Result<(), ModelError> {
        for (name, incoming) in other.columns {
            let merged = match self.columns.get(&name) {
                Some(Variable::Categorical { levels, .. }) => Variable::Categorical {
                    counts: recount_levels(&name, levels, &incoming)?,
                    levels: levels.clone(),
                },
                Some(Variable::Numeric { .. }) if !incoming.is_numeric() => {
                    return Err(ModelError::WrongVariableKind {
                        name,
                        expected: "numeric",
                    });
                }
                _ => incoming,
            };
            self.columns.insert(name, merged);
        }
        Ok(())
    }

    pub fn numeric_values(&self, name: &str) -> Result<&[f64], ModelError> {
        match self.columns.get(name) {
            Some(Variable::Numeric { values }) => Ok(values),
            Some(Variable::Categorical { .. }) => Err(ModelError::WrongVariableKind {
                name: name.to_string(),
                expected: "numeric",
            }),
            None => Err(ModelError::UnknownVariable(name.to_string())),
        }
    }

    pub fn levels(&self, name: &str) -> Result<&[String], ModelError> {
        match self.columns.get(name) {
            Some(Variable::Categorical { levels, .. }) => Ok(levels),
            Some(Variable::Numeric { .. }) => Err(ModelError::WrongVariableKind {
                name: name.to_string(),
                expected: "categorical",
            }),
            None => Err(ModelError::UnknownVariable(name.to_string())),
        }
    }
}

/// Counts of `incoming` per stored level. Numeric columns are read as labels,
/// so a column of `1`/`2` codes matches levels `"1"`/`"2"`.
fn recount_levels(
    name: &str,
    levels: &[String],
    incoming: &Variable,
) -> Result<Vec<usize>, ModelError> {
    let observed: Vec<(String, usize)> = match incoming {
        Variable::Categorical {
            levels: labels,
            counts,
        } => labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), counts.get(i).copied().unwrap_or(1)))
            .collect(),
        Variable::Numeric { values } => values.iter().map(|&x| (format_number(x), 1)).collect(),
    };

    let mut counts = vec![0; levels.len()];
    for (label, count) in observed {
        let slot = levels
            .iter()
            .position(|level| *level == label)
            .ok_or_else(|| ModelError::UnknownLevel {
                name: name.to_string(),
                level: label.clone(),
            })?;
        counts[slot] += count;
    }
    if let Some(empty) = counts.iter().position(|&count| count == 0) {
        return Err(ModelError::UnobservedLevel {
            name: name.to_string(),
            level: levels[empty].clone(),
        });
    }
    Ok(counts)
}

/// One block of fixed-effect design columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelTerm {
    Intercept,
    Numeric { var: String },
    Power { var: String, degree: u32 },
    Log { var: String },
    /// Treatment coding: one indicator column per non-reference level.
    Factor { var: String },
    /// Product of the component encodings; the first component varies slowest.
    Interaction { terms: Vec<ModelTerm> },
}

impl ModelTerm {
    pub fn numeric(var: impl Into<String>) -> Self {
        ModelTerm::Numeric { var: var.into() }
    }

    pub fn factor(var: impl Into<String>) -> Self {
        ModelTerm::Factor { var: var.into() }
    }

    /// Variables this term reads, in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        match self {
            ModelTerm::Intercept => Vec::new(),
            ModelTerm::Numeric { var }
            | ModelTerm::Power { var, .. }
            | ModelTerm::Log { var }
            | ModelTerm::Factor { var } => vec![var.as_str()],
            ModelTerm::Interaction { terms } => {
                terms.iter().flat_map(|term| term.variables()).collect()
            }
        }
    }

    /// Number of design columns this term expands to.
    pub fn width(&self, frame: &ModelFrame) -> Result<usize, ModelError> {
        match self {
            ModelTerm::Intercept => Ok(1),
            ModelTerm::Numeric { var } | ModelTerm::Power { var, .. } | ModelTerm::Log { var } => {
                frame.numeric_values(var)?;
                Ok(1)
            }
            ModelTerm::Factor { var } => Ok(frame.levels(var)?.len().saturating_sub(1)),
            ModelTerm::Interaction { terms } => {
                if terms.iter().any(|t| matches!(t, ModelTerm::Interaction { .. })) {
                    return Err(ModelError::NestedInteraction);
                }
                terms.iter().try_fold(1usize, |acc, term| {
                    Ok::<usize, ModelError>(acc * term.width(frame)?)
                })
            }
        }
    }

    /// Encodes this term for one grid row.
    fn encode<'s>(
        &self,
        frame: &ModelFrame,
        setting: &dyn Fn(&str) -> Option<&'s Setting>,
    ) -> Result<Vec<f64>, ModelError> {
        let number = |var: &str| -> Result<f64, ModelError> {
            match setting(var) {
                Some(Setting::Number(x)) => Ok(*x),
                Some(other) => Err(ModelError::SettingMismatch {
                    name: var.to_string(),
                    found: other.to_string(),
                }),
                None => Err(ModelError::MissingSetting(var.to_string())),
            }
        };

        match self {
            ModelTerm::Intercept => Ok(vec![1.0]),
            ModelTerm::Numeric { var } => Ok(vec![number(var)?]),
            ModelTerm::Power { var, degree } => Ok(vec![number(var)?.powi(*degree as i32)]),
            ModelTerm::Log { var } => {
                let x = number(var)?;
                if x <= 0.0 {
                    return Err(ModelError::NonPositiveLog {
                        name: var.clone(),
                        value: x,
                    });
                }
                Ok(vec![x.ln()])
            }
            ModelTerm::Factor { var } => {
                let levels = frame.levels(var)?;
                match setting(var) {
                    Some(Setting::Level(label)) => {
                        let index = levels.iter().position(|l| l == label).ok_or_else(|| {
                            ModelError::UnknownLevel {
                                name: var.clone(),
                                level: label.clone(),
                            }
                        })?;
                        let mut columns = vec![0.0; levels.len().saturating_sub(1)];
                        if index > 0 {
                            columns[index - 1] = 1.0;
                        }
                        Ok(columns)
                    }
                    Some(Setting::Proportions(shares)) if shares.len() == levels.len() => {
                        Ok(shares[1..].to_vec())
                    }
                    Some(other) => Err(ModelError::SettingMismatch {
                        name: var.clone(),
                        found: other.to_string(),
                    }),
                    None => Err(ModelError::MissingSetting(var.clone())),
                }
            }
            ModelTerm::Interaction { terms } => {
                let mut product = vec![1.0];
                for term in terms {
                    let block = term.encode(frame, setting)?;
                    product = product
                        .iter()
                        .flat_map(|&left| block.iter().map(move |&right| left * right))
                        .collect();
                }
                Ok(product)
            }
        }
    }
}

/// A linear predictor: its terms, estimated coefficients, their covariance
/// and the link mapping it onto the response scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub link: LinkFunction,
    pub terms: Vec<ModelTerm>,
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl LinearPredictor {
    pub fn width(&self, frame: &ModelFrame) -> Result<usize, ModelError> {
        self.terms.iter().try_fold(0usize, |acc, term| {
            Ok::<usize, ModelError>(acc + term.width(frame)?)
        })
    }

    pub fn variables(&self) -> Vec<&str> {
        self.terms.iter().flat_map(|term| term.variables()).collect()
    }

    fn validate(&self, frame: &ModelFrame, part: &'static str) -> Result<(), ModelError> {
        let width = self.width(frame)?;
        let p = self.coefficients.len();
        if width != p {
            return Err(ModelError::CoefficientCount {
                part,
                columns: width,
                coefficients: p,
            });
        }
        if self.covariance.dim() != (p, p) {
            return Err(ModelError::CovarianceShape {
                part,
                expected: p,
                found: self.covariance.dim(),
            });
        }
        if self.coefficients.iter().any(|b| !b.is_finite())
            || self.covariance.iter().any(|v| !v.is_finite())
        {
            return Err(ModelError::NonFiniteEstimates(part));
        }
        Ok(())
    }

    /// Constructs the design matrix for every row of the prediction grid,
    /// following the canonical term order.
    pub fn design_matrix(
        &self,
        grid: &PredictionGrid,
        frame: &ModelFrame,
    ) -> Result<Array2<f64>, ModelError> {
        let width = self.width(frame)?;
        let mut x = Array2::zeros((grid.len(), width));
        for (i, mut row) in x.rows_mut().into_iter().enumerate() {
            let lookup = |name: &str| grid.setting(i, name);
            let mut column = 0;
            for term in &self.terms {
                for value in term.encode(frame, &lookup)? {
                    row[column] = value;
                    column += 1;
                }
            }
        }
        Ok(x)
    }
}

/// The conditional mode of one grouping level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLevel {
    pub level: String,
    /// Conditional modes (BLUPs) for the intercept followed by each slope.
    pub modes: Vec<f64>,
    /// Diagonal of the conditional covariance, in the order of `modes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_variance: Option<Vec<f64>>,
}

/// One grouping factor of the random-effects structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingFactor {
    pub name: String,
    /// Numeric covariates with random slopes, after the intercept.
    #[serde(default)]
    pub slopes: Vec<String>,
    /// Covariance of (intercept, slopes...).
    pub covariance: Array2<f64>,
    pub levels: Vec<GroupLevel>,
}

impl GroupingFactor {
    /// Random-intercept factor with variance `variance` and the given modes.
    pub fn intercept(
        name: impl Into<String>,
        variance: f64,
        modes: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        Self {
            name: name.into(),
            slopes: Vec::new(),
            covariance: Array2::from_elem((1, 1), variance),
            levels: modes
                .into_iter()
                .map(|(level, mode)| GroupLevel {
                    level,
                    modes: vec![mode],
                    conditional_variance: None,
                })
                .collect(),
        }
    }

    /// Dimension of the random-effect vector: intercept plus slopes.
    pub fn dim(&self) -> usize {
        1 + self.slopes.len()
    }

    pub fn level(&self, label: &str) -> Option<&GroupLevel> {
        self.levels.iter().find(|l| l.level == label)
    }

    pub fn level_names(&self) -> Vec<String> {
        self.levels.iter().map(|l| l.level.clone()).collect()
    }

    fn validate(&self, frame: &ModelFrame) -> Result<(), ModelError> {
        let q = self.dim();
        if self.covariance.dim() != (q, q) {
            return Err(ModelError::RandomEffectShape {
                factor: self.name.clone(),
                detail: format!(
                    "covariance is {:?} but the factor has {} effects",
                    self.covariance.dim(),
                    q
                ),
            });
        }
        for slope in &self.slopes {
            frame.numeric_values(slope)?;
        }
        for level in &self.levels {
            if level.modes.len() != q {
                return Err(ModelError::RandomEffectShape {
                    factor: self.name.clone(),
                    detail: format!(
                        "level '{}' has {} modes, expected {}",
                        level.level,
                        level.modes.len(),
                        q
                    ),
                });
            }
            if let Some(variances) = &level.conditional_variance {
                if variances.len() != q {
                    return Err(ModelError::RandomEffectShape {
                        factor: self.name.clone(),
                        detail: format!(
                            "level '{}' has {} conditional variances, expected {}",
                            level.level,
                            variances.len(),
                            q
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Random-effects structure of the conditional and zero-inflation parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects {
    #[serde(default)]
    pub conditional: Vec<GroupingFactor>,
    #[serde(default)]
    pub zero_inflation: Vec<GroupingFactor>,
}

impl RandomEffects {
    pub fn is_empty(&self) -> bool {
        self.conditional.is_empty() && self.zero_inflation.is_empty()
    }

    /// All grouping factors, conditional part first.
    pub fn factors(&self) -> impl Iterator<Item = &GroupingFactor> {
        self.conditional.iter().chain(self.zero_inflation.iter())
    }

    pub fn factor(&self, name: &str) -> Option<&GroupingFactor> {
        self.factors().find(|f| f.name == name)
    }
}

/// Optional parts a model may carry. Prediction types declare which ones they
/// need before anything is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    RandomEffects,
    ZeroInflation,
    /// A dispersion parameter, when the family's response draws need one.
    Dispersion,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::RandomEffects => "random effects",
            Capability::ZeroInflation => "a zero-inflation component",
            Capability::Dispersion => "a dispersion parameter",
        };
        f.write_str(name)
    }
}

/// The complete description of a fitted model, as handed over by the fitting library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub family: Family,
    pub conditional: LinearPredictor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_inflation: Option<LinearPredictor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_effects: Option<RandomEffects>,
    /// Residual degrees of freedom; when present, analytic intervals use a t quantile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residual_df: Option<f64>,
    /// Residual SD (Gaussian), size θ (negative binomial), φ (Gamma) or precision φ (Beta).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispersion: Option<f64>,
    pub frame: ModelFrame,
}

/// Custom error type for model loading, saving, and validation.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Variable '{0}' is referenced by the model but missing from the model frame.")]
    UnknownVariable(String),
    #[error("Variable '{name}' must be {expected} for the way the model uses it.")]
    WrongVariableKind { name: String, expected: &'static str },
    #[error("Level '{level}' is not a level of '{name}'.")]
    UnknownLevel { name: String, level: String },
    #[error("Level '{level}' of '{name}' does not occur in the supplied data.")]
    UnobservedLevel { name: String, level: String },
    #[error(
        "The {part} part expands to {columns} design columns but carries {coefficients} coefficients."
    )]
    CoefficientCount {
        part: &'static str,
        columns: usize,
        coefficients: usize,
    },
    #[error("The {part} covariance matrix must be {expected}x{expected}, found {found:?}.")]
    CovarianceShape {
        part: &'static str,
        expected: usize,
        found: (usize, usize),
    },
    #[error("The {0} part contains non-finite coefficients or covariances.")]
    NonFiniteEstimates(&'static str),
    #[error("Interaction terms cannot contain other interaction terms.")]
    NestedInteraction,
    #[error("Random-effects factor '{factor}' is malformed: {detail}")]
    RandomEffectShape { factor: String, detail: String },
    #[error("Internal error: no grid value for '{0}' while building the design matrix.")]
    MissingSetting(String),
    #[error("Grid value '{found}' cannot be used for variable '{name}'.")]
    SettingMismatch { name: String, found: String },
    #[error("Cannot take the log of '{name}' at non-positive value {value}.")]
    NonPositiveLog { name: String, value: f64 },
    #[error("Dispersion parameter must be positive and finite, found {0}.")]
    InvalidDispersion(f64),
    #[error("Residual degrees of freedom must be positive and finite, found {0}.")]
    InvalidResidualDf(f64),
}

impl FittedModel {
    /// Checks that coefficients, covariances, terms and the random-effects
    /// structure agree with each other and with the model frame.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.conditional.validate(&self.frame, "conditional")?;
        if let Some(zi) = &self.zero_inflation {
            zi.validate(&self.frame, "zero-inflation")?;
        }
        if let Some(re) = &self.random_effects {
            for factor in re.factors() {
                factor.validate(&self.frame)?;
            }
        }
        if let Some(dispersion) = self.dispersion {
            if !(dispersion.is_finite() && dispersion > 0.0) {
                return Err(ModelError::InvalidDispersion(dispersion));
            }
        }
        if let Some(df) = self.residual_df {
            if !(df.is_finite() && df > 0.0) {
                return Err(ModelError::InvalidResidualDf(df));
            }
        }
        Ok(())
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::RandomEffects => self
                .random_effects
                .as_ref()
                .is_some_and(|re| !re.is_empty()),
            Capability::ZeroInflation => self.zero_inflation.is_some(),
            Capability::Dispersion => self.dispersion.is_some() || !self.family.needs_dispersion(),
        }
    }

    pub fn has_random_effects(&self) -> bool {
        self.has(Capability::RandomEffects)
    }

    pub fn has_zero_inflation(&self) -> bool {
        self.has(Capability::ZeroInflation)
    }

    /// Grouping factors of the conditional part (empty for plain GLMs).
    pub fn conditional_factors(&self) -> &[GroupingFactor] {
        self.random_effects
            .as_ref()
            .map(|re| re.conditional.as_slice())
            .unwrap_or(&[])
    }

    /// Grouping factors of the zero-inflation part.
    pub fn zero_inflation_factors(&self) -> &[GroupingFactor] {
        self.random_effects
            .as_ref()
            .map(|re| re.zero_inflation.as_slice())
            .unwrap_or(&[])
    }

    pub fn grouping_factor(&self, name: &str) -> Option<&GroupingFactor> {
        self.random_effects.as_ref().and_then(|re| re.factor(name))
    }

    /// Every frame variable the design rows need a value for, without duplicates.
    pub fn required_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        };
        for var in self.conditional.variables() {
            push(var);
        }
        if let Some(zi) = &self.zero_inflation {
            for var in zi.variables() {
                push(var);
            }
        }
        if let Some(re) = &self.random_effects {
            for factor in re.factors() {
                for slope in &factor.slopes {
                    push(slope);
                }
            }
        }
        names
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates a model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: FittedModel = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }
}
