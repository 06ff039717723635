//! # Prediction Grid
//!
//! Builds the synthetic data the predictions are computed on. Each row is one
//! combination of focal-term values (the first term varies slowest), completed
//! with a value for every other variable the model needs:
//!
//! - a `Condition` entry, when the caller pinned the variable;
//! - otherwise the variable's representative value, chosen by its kind:
//!   numeric covariates at their mean (or median), categorical covariates at
//!   their reference level (or weighted by observed level shares).
//!
//! Grouping factors of the random-effects structure only enter the grid when
//! they are focal or conditioned; everywhere else predictions stay at the
//! population level.

use crate::model::{FittedModel, Value, Variable, format_number};
use crate::simulate::quantile_sorted;
use crate::terms::{FocalTerm, Selector, TermSpec};
use ahash::AHashMap;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of intervals targeted by the default pretty range of the first
/// numeric focal term.
pub const DEFAULT_PRETTY_INTERVALS: usize = 10;

/// The value a grid cell holds for one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Number(f64),
    Level(String),
    /// Observed share of every level, in level order. Only used for
    /// non-focal categorical covariates under proportional weighting.
    Proportions(Vec<f64>),
}

impl Setting {
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Setting::Number(x) => Some(Value::Number(*x)),
            Setting::Level(label) => Some(Value::Level(label.clone())),
            Setting::Proportions(_) => None,
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Number(x) => f.write_str(&format_number(*x)),
            Setting::Level(label) => f.write_str(label),
            Setting::Proportions(shares) => {
                let joined = shares.iter().map(|s| format_number(*s)).join(",");
                write!(f, "proportions({joined})")
            }
        }
    }
}

/// Representative value of non-focal numeric covariates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Typical {
    #[default]
    Mean,
    Median,
}

impl FromStr for Typical {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Typical::Mean),
            "median" => Ok(Typical::Median),
            other => Err(format!("unknown typical value '{other}' (use mean or median)")),
        }
    }
}

/// How non-focal categorical covariates are held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalWeighting {
    /// At the reference (first) level.
    #[default]
    Reference,
    /// Averaged over levels, weighted by their observed shares.
    Proportional,
}

impl FromStr for CategoricalWeighting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" => Ok(CategoricalWeighting::Reference),
            "proportional" => Ok(CategoricalWeighting::Proportional),
            other => Err(format!(
                "unknown categorical weighting '{other}' (use reference or proportional)"
            )),
        }
    }
}

/// Non-focal variables pinned to a fixed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition {
    values: BTreeMap<String, Value>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parses `name=value`; values that parse as numbers become numbers.
    pub fn parse_assignment(text: &str) -> Result<(String, Value), String> {
        let (name, value) = text
            .split_once('=')
            .ok_or_else(|| format!("condition '{text}' must look like name=value"))?;
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() || value.is_empty() {
            return Err(format!("condition '{text}' must look like name=value"));
        }
        let value = match value.parse::<f64>() {
            Ok(x) if x.is_finite() => Value::Number(x),
            _ => Value::Level(value.to_string()),
        };
        Ok((name.to_string(), value))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("'{0}' is not a variable of the model.")]
    UnknownVariable(String),
    #[error("No usable values remain for '{0}' after filtering or sampling.")]
    EmptyLevelSet(String),
    #[error("'{value}' is not a valid value for '{name}'.")]
    InvalidValue { name: String, value: String },
    #[error("Selector '{selector}' cannot be applied to categorical variable '{name}'.")]
    SelectorKind { name: String, selector: String },
}

/// The rows predictions are computed for. Built once per call, read-only afterwards.
#[derive(Debug, Clone)]
pub struct PredictionGrid {
    focal: Vec<String>,
    index: AHashMap<String, usize>,
    rows: Vec<Vec<Setting>>,
}

impl PredictionGrid {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Names of the focal terms; these are the leading columns.
    pub fn focal(&self) -> &[String] {
        &self.focal
    }

    pub fn setting(&self, row: usize, name: &str) -> Option<&Setting> {
        self.index.get(name).map(|&column| &self.rows[row][column])
    }

    /// The realized focal values of one row.
    pub fn focal_values(&self, row: usize) -> Vec<Value> {
        self.rows[row][..self.focal.len()]
            .iter()
            .filter_map(Setting::to_value)
            .collect()
    }
}

/// Where the values of a variable come from.
enum Source<'a> {
    Numeric(&'a [f64]),
    Levels(Vec<String>),
}

fn lookup<'a>(model: &'a FittedModel, name: &str) -> Result<Source<'a>, GridError> {
    if let Some(variable) = model.frame.get(name) {
        return Ok(match variable {
            Variable::Numeric { values } => Source::Numeric(values),
            Variable::Categorical { levels, .. } => Source::Levels(levels.clone()),
        });
    }
    if let Some(factor) = model.grouping_factor(name) {
        return Ok(Source::Levels(factor.level_names()));
    }
    Err(GridError::UnknownVariable(name.to_string()))
}

/// Builds the Cartesian product of the focal values, crossed with the
/// conditioned and representative values of all other variables.
pub fn build_grid(
    model: &FittedModel,
    terms: &TermSpec,
    condition: &Condition,
    typical: Typical,
    categorical: CategoricalWeighting,
    rng: &mut StdRng,
) -> Result<PredictionGrid, GridError> {
    // --- 1. Focal values ---
    let mut focal_values: Vec<Vec<Setting>> = Vec::with_capacity(terms.len());
    for (position, term) in terms.terms().iter().enumerate() {
        let values = match lookup(model, &term.name)? {
            Source::Numeric(observed) => numeric_focal_values(term, observed, position, rng)?
                .into_iter()
                .map(Setting::Number)
                .collect::<Vec<_>>(),
            Source::Levels(levels) => level_focal_values(term, &levels, rng)?
                .into_iter()
                .map(Setting::Level)
                .collect(),
        };
        if values.is_empty() {
            return Err(GridError::EmptyLevelSet(term.name.clone()));
        }
        log::debug!("Focal term '{}' contributes {} values", term, values.len());
        focal_values.push(values);
    }

    // --- 2. Conditioned and representative values ---
    let mut columns = terms.names();
    let mut fixed: Vec<Setting> = Vec::new();
    for (name, value) in condition.iter() {
        if terms.contains(name) {
            log::warn!("Ignoring condition on '{name}' because it is a focal term");
            continue;
        }
        fixed.push(condition_setting(model, name, value)?);
        columns.push(name.clone());
    }
    for name in model.required_variables() {
        if columns.contains(&name) {
            continue;
        }
        let variable = model
            .frame
            .get(&name)
            .ok_or_else(|| GridError::UnknownVariable(name.clone()))?;
        fixed.push(typical_setting(&name, variable, typical, categorical)?);
        columns.push(name);
    }

    // --- 3. Cartesian product ---
    let rows: Vec<Vec<Setting>> = focal_values
        .into_iter()
        .map(Vec::into_iter)
        .multi_cartesian_product()
        .map(|mut row| {
            row.extend(fixed.iter().cloned());
            row
        })
        .collect();

    let index = columns
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect();

    log::debug!(
        "Prediction grid has {} rows over columns [{}]",
        rows.len(),
        columns.join(", ")
    );

    Ok(PredictionGrid {
        focal: terms.names(),
        index,
        rows,
    })
}

fn numeric_focal_values(
    term: &FocalTerm,
    observed: &[f64],
    position: usize,
    rng: &mut StdRng,
) -> Result<Vec<f64>, GridError> {
    let summary = NumericSummary::new(observed)
        .ok_or_else(|| GridError::EmptyLevelSet(term.name.clone()))?;

    let values = match &term.selector {
        None if position == 0 => pretty(summary.min, summary.max, DEFAULT_PRETTY_INTERVALS),
        None | Some(Selector::MeanSd) => vec![
            summary.mean - summary.sd,
            summary.mean,
            summary.mean + summary.sd,
        ],
        Some(Selector::Values(raw)) => raw
            .iter()
            .map(|v| {
                v.parse::<f64>()
                    .ok()
                    .filter(|x| x.is_finite())
                    .ok_or_else(|| GridError::InvalidValue {
                        name: term.name.clone(),
                        value: v.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(range @ Selector::Range { .. }) => range.range_values(),
        Some(Selector::Sample(n)) => {
            // Numeric variables are sampled from their distinct observed values.
            let distinct = summary.distinct();
            sample_in_order(&distinct, *n, rng)
        }
        Some(Selector::MinMax) => vec![summary.min, summary.max],
        Some(Selector::Quartiles) => vec![
            summary.quantile(0.25),
            summary.quantile(0.5),
            summary.quantile(0.75),
        ],
        Some(Selector::Quartiles2) => vec![
            summary.min,
            summary.quantile(0.25),
            summary.quantile(0.5),
            summary.quantile(0.75),
            summary.max,
        ],
        Some(Selector::ZeroMax) => vec![0.0, summary.max],
        Some(Selector::All) => summary.distinct(),
        Some(Selector::Pretty(n)) => {
            if *n == 0 {
                return Err(GridError::EmptyLevelSet(term.name.clone()));
            }
            pretty(summary.min, summary.max, *n)
        }
    };

    Ok(dedup_in_order(values, |a, b| a == b))
}

fn level_focal_values(
    term: &FocalTerm,
    levels: &[String],
    rng: &mut StdRng,
) -> Result<Vec<String>, GridError> {
    match &term.selector {
        None | Some(Selector::All) => Ok(levels.to_vec()),
        Some(Selector::Values(requested)) => {
            let kept: Vec<String> = requested
                .iter()
                .filter(|label| {
                    let known = levels.contains(label);
                    if !known {
                        log::warn!("Dropping unknown level '{}' of '{}'", label, term.name);
                    }
                    known
                })
                .cloned()
                .collect();
            Ok(dedup_in_order(kept, |a, b| a == b))
        }
        Some(Selector::Sample(n)) => Ok(sample_in_order(levels, *n, rng)),
        Some(other) => Err(GridError::SelectorKind {
            name: term.name.clone(),
            selector: other.to_string(),
        }),
    }
}

/// Draws `n` items without replacement (capped at the number available),
/// returned in their original order.
fn sample_in_order<T: Clone>(items: &[T], n: usize, rng: &mut StdRng) -> Vec<T> {
    let size = n.min(items.len());
    let mut picked = index::sample(rng, items.len(), size).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| items[i].clone()).collect()
}

fn condition_setting(
    model: &FittedModel,
    name: &str,
    value: &Value,
) -> Result<Setting, GridError> {
    let invalid = || GridError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    };
    match lookup(model, name)? {
        Source::Numeric(_) => value.as_number().map(Setting::Number).ok_or_else(invalid),
        Source::Levels(levels) => {
            let label = value.to_string();
            if levels.contains(&label) {
                Ok(Setting::Level(label))
            } else {
                Err(invalid())
            }
        }
    }
}

fn typical_setting(
    name: &str,
    variable: &Variable,
    typical: Typical,
    categorical: CategoricalWeighting,
) -> Result<Setting, GridError> {
    let empty = || GridError::EmptyLevelSet(name.to_string());
    match variable {
        Variable::Numeric { values } => {
            let summary = NumericSummary::new(values).ok_or_else(empty)?;
            Ok(Setting::Number(match typical {
                Typical::Mean => summary.mean,
                Typical::Median => summary.quantile(0.5),
            }))
        }
        Variable::Categorical { levels, .. } => match categorical {
            CategoricalWeighting::Reference => levels
                .first()
                .cloned()
                .map(Setting::Level)
                .ok_or_else(empty),
            CategoricalWeighting::Proportional => variable
                .level_proportions()
                .filter(|shares| !shares.is_empty())
                .map(Setting::Proportions)
                .ok_or_else(empty),
        },
    }
}

fn dedup_in_order<T>(values: Vec<T>, same: impl Fn(&T, &T) -> bool) -> Vec<T> {
    let mut kept: Vec<T> = Vec::with_capacity(values.len());
    for value in values {
        if !kept.iter().any(|k| same(k, &value)) {
            kept.push(value);
        }
    }
    kept
}

/// Descriptive statistics of a numeric column.
struct NumericSummary {
    sorted: Vec<f64>,
    min: f64,
    max: f64,
    mean: f64,
    sd: f64,
}

impl NumericSummary {
    fn new(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let sd = if sorted.len() > 1 {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        Some(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            sd,
            sorted,
        })
    }

    fn quantile(&self, p: f64) -> f64 {
        quantile_sorted(&self.sorted, p)
    }

    fn distinct(&self) -> Vec<f64> {
        dedup_in_order(self.sorted.clone(), |a, b| a == b)
    }
}

/// Round-number values covering `[lo, hi]`, about `intervals` steps apart.
/// The sequence is extended outward to the nearest multiple of the step.
pub fn pretty(lo: f64, hi: f64, intervals: usize) -> Vec<f64> {
    if !(hi > lo) {
        return vec![lo];
    }
    let raw = (hi - lo) / intervals.max(1) as f64;
    let magnitude = 10f64.powi(raw.log10().floor() as i32);
    let unit = [1.0, 2.0, 5.0, 10.0]
        .into_iter()
        .map(|m| m * magnitude)
        .find(|&u| u >= raw * (1.0 - 1e-9))
        .unwrap_or(10.0 * magnitude);
    let decimals = (-unit.log10().floor()).max(0.0) as i32;
    let scale = 10f64.powi(decimals);
    let start = (lo / unit + 1e-9).floor() as i64;
    let end = (hi / unit - 1e-9).ceil() as i64;
    (start..=end)
        .map(|k| (k as f64 * unit * scale).round() / scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Family, GroupingFactor, LinearPredictor, LinkFunction, ModelFrame, ModelTerm,
        RandomEffects,
    };
    use ndarray::{Array1, Array2};
    use rand::SeedableRng;

    fn model() -> FittedModel {
        let frame = ModelFrame::new()
            .with("temp", Variable::numeric(vec![15.0, 20.0, 25.0, 30.0]))
            .with(
                "batch",
                Variable::Categorical {
                    levels: vec!["A".into(), "B".into(), "C".into()],
                    counts: vec![2, 1, 1],
                },
            );
        FittedModel {
            family: Family::Gaussian,
            conditional: LinearPredictor {
                link: LinkFunction::Identity,
                terms: vec![
                    ModelTerm::Intercept,
                    ModelTerm::factor("batch"),
                    ModelTerm::numeric("temp"),
                ],
                coefficients: Array1::zeros(4),
                covariance: Array2::eye(4),
            },
            zero_inflation: None,
            random_effects: Some(RandomEffects {
                conditional: vec![GroupingFactor::intercept(
                    "site",
                    1.0,
                    (1..=6).map(|i| (format!("s{i}"), 0.0)),
                )],
                zero_inflation: Vec::new(),
            }),
            residual_df: None,
            dispersion: Some(1.0),
            frame,
        }
    }

    fn grid(terms: &[&str], condition: &Condition) -> Result<PredictionGrid, GridError> {
        let mut rng = StdRng::seed_from_u64(7);
        build_grid(
            &model(),
            &TermSpec::parse(terms).unwrap(),
            condition,
            Typical::Mean,
            CategoricalWeighting::Reference,
            &mut rng,
        )
    }

    #[test]
    fn pretty_extends_to_round_numbers() {
        assert_eq!(
            pretty(15.0, 30.0, 10),
            vec![14.0, 16.0, 18.0, 20.0, 22.0, 24.0, 26.0, 28.0, 30.0]
        );
        assert_eq!(pretty(0.0, 1.0, 5), vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0]);
        assert_eq!(pretty(3.0, 3.0, 10), vec![3.0]);
    }

    #[test]
    fn categorical_focal_term_yields_all_levels_and_mean_covariates() {
        let g = grid(&["batch"], &Condition::new()).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.setting(0, "batch"), Some(&Setting::Level("A".into())));
        assert_eq!(g.setting(2, "temp"), Some(&Setting::Number(22.5)));
        assert!(g.setting(0, "site").is_none());
    }

    #[test]
    fn explicit_levels_restrict_rows_in_caller_order() {
        let g = grid(&["temp [20]", "batch [C,A]"], &Condition::new()).unwrap();
        let labels: Vec<String> = (0..g.len())
            .map(|i| g.setting(i, "batch").unwrap().to_string())
            .collect();
        assert_eq!(labels, vec!["C", "A"]);
    }

    #[test]
    fn unknown_levels_are_dropped_and_empty_sets_fail() {
        let g = grid(&["batch [A,Z]"], &Condition::new()).unwrap();
        assert_eq!(g.len(), 1);
        assert_eq!(
            grid(&["batch [Z]"], &Condition::new()).unwrap_err(),
            GridError::EmptyLevelSet("batch".into())
        );
        assert_eq!(
            grid(&["site [sample=0]"], &Condition::new()).unwrap_err(),
            GridError::EmptyLevelSet("site".into())
        );
    }

    #[test]
    fn sampling_is_capped_and_without_repeats() {
        let g = grid(&["site [sample=4]"], &Condition::new()).unwrap();
        let mut labels: Vec<String> = (0..g.len())
            .map(|i| g.setting(i, "site").unwrap().to_string())
            .collect();
        assert_eq!(labels.len(), 4);
        labels.dedup();
        assert_eq!(labels.len(), 4);

        let capped = grid(&["site [sample=50]"], &Condition::new()).unwrap();
        assert_eq!(capped.len(), 6);
    }

    #[test]
    fn second_numeric_term_defaults_to_mean_and_sd() {
        let g = grid(&["batch", "temp"], &Condition::new()).unwrap();
        assert_eq!(g.len(), 9);
        let first_temp = g.setting(0, "temp").unwrap();
        let mean_temp = g.setting(1, "temp").unwrap();
        assert_eq!(mean_temp, &Setting::Number(22.5));
        assert!(matches!(first_temp, Setting::Number(x) if *x < 22.5));
        assert_eq!(g.focal_values(3)[0], Value::Level("B".into()));
    }

    #[test]
    fn conditions_pin_non_focal_variables() {
        let condition = Condition::new()
            .with("temp", Value::Number(18.0))
            .with("site", Value::Level("s2".into()));
        let g = grid(&["batch"], &condition).unwrap();
        assert_eq!(g.setting(1, "temp"), Some(&Setting::Number(18.0)));
        assert_eq!(g.setting(1, "site"), Some(&Setting::Level("s2".into())));

        let unknown = Condition::new().with("humidity", Value::Number(1.0));
        assert_eq!(
            grid(&["batch"], &unknown).unwrap_err(),
            GridError::UnknownVariable("humidity".into())
        );
        let bad_level = Condition::new().with("batch", Value::Level("Q".into()));
        assert!(matches!(
            grid(&["temp"], &bad_level),
            Err(GridError::InvalidValue { .. })
        ));
    }

    #[test]
    fn proportional_weighting_uses_level_shares() {
        let mut rng = StdRng::seed_from_u64(1);
        let g = build_grid(
            &model(),
            &TermSpec::parse(&["temp [20,25]"]).unwrap(),
            &Condition::new(),
            Typical::Median,
            CategoricalWeighting::Proportional,
            &mut rng,
        )
        .unwrap();
        assert_eq!(
            g.setting(0, "batch"),
            Some(&Setting::Proportions(vec![0.5, 0.25, 0.25]))
        );
    }

    #[test]
    fn unknown_terms_and_misapplied_selectors_fail() {
        assert_eq!(
            grid(&["humidity"], &Condition::new()).unwrap_err(),
            GridError::UnknownVariable("humidity".into())
        );
        assert_eq!(
            grid(&["batch [meansd]"], &Condition::new()).unwrap_err(),
            GridError::SelectorKind {
                name: "batch".into(),
                selector: "meansd".into(),
            }
        );
        assert_eq!(
            grid(&["batch [0:4 by=2]"], &Condition::new())
                .unwrap_err()
                .to_string(),
            "Selector '0:4 by=2' cannot be applied to categorical variable 'batch'."
        );
        assert!(matches!(
            grid(&["temp [warm]"], &Condition::new()),
            Err(GridError::InvalidValue { .. })
        ));
    }

    #[test]
    fn parse_assignment_types_values() {
        assert_eq!(
            Condition::parse_assignment("temp=21.5").unwrap(),
            ("temp".to_string(), Value::Number(21.5))
        );
        assert_eq!(
            Condition::parse_assignment("batch = B").unwrap(),
            ("batch".to_string(), Value::Level("B".into()))
        );
        assert!(Condition::parse_assignment("batch").is_err());
    }
}
