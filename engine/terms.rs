//! # Focal Term Grammar
//!
//! Parses the caller's term strings into a [`TermSpec`]. A term is a variable
//! name, optionally followed by a bracketed selector that decides which values
//! of that variable enter the prediction grid:
//!
//! - `x`: default values (pretty range for numerics, all levels for factors)
//! - `x [1,2,5]`, `group [A,B]`: explicit values or levels, in the given order
//! - `x [0:10]`, `x [0:1 by=0.25]`: arithmetic sequences
//! - `group [sample=5]`: random subset of levels, without replacement
//! - `x [meansd]`, `x [minmax]`, `x [quart]`, `x [quart2]`, `x [zeromax]`,
//!   `x [all]`, `x [n=5]`: representative-value shortcuts
//!
//! Parsing is purely syntactic; whether a selector makes sense for the kind of
//! variable is decided when the grid is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How the values of one focal term are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Explicit values or level labels, kept as written.
    Values(Vec<String>),
    Range { from: f64, to: f64, by: f64 },
    Sample(usize),
    MeanSd,
    MinMax,
    /// 25th, 50th and 75th percentile.
    Quartiles,
    /// Minimum, quartiles and maximum.
    Quartiles2,
    ZeroMax,
    All,
    /// About `n` round-number values across the observed range.
    Pretty(usize),
}

/// One requested predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocalTerm {
    pub name: String,
    #[serde(default)]
    pub selector: Option<Selector>,
}

impl FocalTerm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: None,
        }
    }
}

/// The ordered list of focal terms of one prediction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermSpec {
    terms: Vec<FocalTerm>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TermError {
    #[error("At least one focal term is required.")]
    Empty,
    #[error("Term '{0}' has no variable name.")]
    EmptyName(String),
    #[error("Term '{0}' has unbalanced or misplaced brackets.")]
    UnbalancedBrackets(String),
    #[error("Term '{term}' has an empty selector.")]
    EmptySelector { term: String },
    #[error("Unknown selector '{selector}' in term '{term}'.")]
    UnknownSelector { term: String, selector: String },
    #[error("'{value}' in term '{term}' is not a valid number.")]
    InvalidNumber { term: String, value: String },
    #[error("Range in term '{term}' must run upwards with a positive step.")]
    InvalidRange { term: String },
    #[error("Variable '{0}' is requested more than once.")]
    Duplicate(String),
}

/// Upper bound on the number of values an arithmetic range may expand to.
const MAX_RANGE_VALUES: usize = 10_000;

impl TermSpec {
    /// Parses every term string and checks that no variable repeats.
    pub fn parse<S: AsRef<str>>(terms: &[S]) -> Result<Self, TermError> {
        let parsed = terms
            .iter()
            .map(|t| t.as_ref().parse::<FocalTerm>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parsed)
    }

    pub fn new(terms: Vec<FocalTerm>) -> Result<Self, TermError> {
        if terms.is_empty() {
            return Err(TermError::Empty);
        }
        for (i, term) in terms.iter().enumerate() {
            if terms[..i].iter().any(|earlier| earlier.name == term.name) {
                return Err(TermError::Duplicate(term.name.clone()));
            }
        }
        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[FocalTerm] {
        &self.terms
    }

    pub fn names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.terms.iter().any(|t| t.name == name)
    }
}

impl FromStr for FocalTerm {
    type Err = TermError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let text = raw.trim();
        let (name, selector) = match text.find('[') {
            None => {
                if text.contains(']') {
                    return Err(TermError::UnbalancedBrackets(raw.to_string()));
                }
                (text, None)
            }
            Some(open) => {
                let close = text
                    .rfind(']')
                    .filter(|&close| close > open && close == text.len() - 1)
                    .ok_or_else(|| TermError::UnbalancedBrackets(raw.to_string()))?;
                let inner = &text[open + 1..close];
                if inner.contains('[') || inner.contains(']') {
                    return Err(TermError::UnbalancedBrackets(raw.to_string()));
                }
                (text[..open].trim_end(), Some(parse_selector(raw, inner)?))
            }
        };

        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(TermError::EmptyName(raw.to_string()));
        }

        Ok(FocalTerm {
            name: name.to_string(),
            selector,
        })
    }
}

fn parse_number(term: &str, value: &str) -> Result<f64, TermError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|x| x.is_finite())
        .ok_or_else(|| TermError::InvalidNumber {
            term: term.to_string(),
            value: value.trim().to_string(),
        })
}

fn parse_count(term: &str, value: &str) -> Result<usize, TermError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| TermError::InvalidNumber {
            term: term.to_string(),
            value: value.trim().to_string(),
        })
}

fn parse_selector(term: &str, inner: &str) -> Result<Selector, TermError> {
    let body = inner.trim();
    if body.is_empty() {
        return Err(TermError::EmptySelector {
            term: term.to_string(),
        });
    }

    match body {
        "meansd" => return Ok(Selector::MeanSd),
        "minmax" => return Ok(Selector::MinMax),
        "quart" => return Ok(Selector::Quartiles),
        "quart2" => return Ok(Selector::Quartiles2),
        "zeromax" => return Ok(Selector::ZeroMax),
        "all" => return Ok(Selector::All),
        _ => {}
    }

    if let Some((key, value)) = body.split_once('=') {
        if !body.contains(',') && !body.contains(':') {
            return match key.trim() {
                "sample" => Ok(Selector::Sample(parse_count(term, value)?)),
                "n" => Ok(Selector::Pretty(parse_count(term, value)?)),
                other => Err(TermError::UnknownSelector {
                    term: term.to_string(),
                    selector: other.to_string(),
                }),
            };
        }
    }

    if body.contains(':') && !body.contains(',') {
        return match parse_range(term, body) {
            // Without `by=`, text that is not an ascending numeric range is a
            // single label such as `10:00` or `a:b`.
            Err(TermError::InvalidNumber { .. } | TermError::InvalidRange { .. })
                if !body.contains("by") =>
            {
                Ok(Selector::Values(vec![body.to_string()]))
            }
            parsed => parsed,
        };
    }

    let values: Vec<String> = body
        .split(',')
        .map(|v| v.trim().to_string())
        .collect();
    if values.iter().any(String::is_empty) {
        return Err(TermError::EmptySelector {
            term: term.to_string(),
        });
    }
    Ok(Selector::Values(values))
}

fn parse_range(term: &str, body: &str) -> Result<Selector, TermError> {
    let (span, step) = match body.split_once("by") {
        Some((span, rest)) => {
            let step = rest
                .trim()
                .strip_prefix('=')
                .ok_or_else(|| TermError::UnknownSelector {
                    term: term.to_string(),
                    selector: body.to_string(),
                })?;
            (span.trim(), parse_number(term, step)?)
        }
        None => (body, 1.0),
    };
    let (from, to) = span
        .split_once(':')
        .ok_or_else(|| TermError::InvalidRange {
            term: term.to_string(),
        })?;
    let from = parse_number(term, from)?;
    let to = parse_number(term, to)?;
    if to < from || step <= 0.0 || (to - from) / step > MAX_RANGE_VALUES as f64 {
        return Err(TermError::InvalidRange {
            term: term.to_string(),
        });
    }
    Ok(Selector::Range { from, to, by: step })
}

impl Selector {
    /// Expands an arithmetic range into its values; empty for other selectors.
    pub fn range_values(&self) -> Vec<f64> {
        let Selector::Range { from, to, by } = *self else {
            return Vec::new();
        };
        let steps = ((to - from) / by + 1e-9).floor() as usize;
        (0..=steps).map(|i| from + i as f64 * by).collect()
    }
}

impl fmt::Display for Selector {
    /// The selector as written between the brackets of a term.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Values(values) => f.write_str(&values.join(",")),
            Selector::Range { from, to, by } => write!(f, "{from}:{to} by={by}"),
            Selector::Sample(n) => write!(f, "sample={n}"),
            Selector::MeanSd => f.write_str("meansd"),
            Selector::MinMax => f.write_str("minmax"),
            Selector::Quartiles => f.write_str("quart"),
            Selector::Quartiles2 => f.write_str("quart2"),
            Selector::ZeroMax => f.write_str("zeromax"),
            Selector::All => f.write_str("all"),
            Selector::Pretty(n) => write!(f, "n={n}"),
        }
    }
}

impl fmt::Display for FocalTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match &self.selector {
            Some(selector) => write!(f, " [{selector}]"),
            None => Ok(()),
        }
    }
}
