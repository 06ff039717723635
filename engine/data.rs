//! # Model Frame Loading
//!
//! Reads the data a model was fitted on from a tab-separated file with a
//! header line and summarizes every column into a [`Variable`]:
//!
//! - columns whose cells all parse as finite numbers become numeric;
//! - everything else, and any column named in `categorical`, becomes
//!   categorical with its distinct values as levels, sorted in natural order
//!   (`2` before `10`), the first level being the reference.
//!
//! Missing cells (`""`, `NA`) are rejected: the frame must describe exactly
//! the observations the model saw.

use crate::model::{ModelFrame, Variable};
use ahash::AHashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to read the data file: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The data file contains a header but no data rows.")]
    NoRows,
    #[error("Column '{column}' has a missing value on data row {row}.")]
    MissingValue { column: String, row: usize },
    #[error("Column '{0}' was requested as categorical but does not exist.")]
    ColumnNotFound(String),
    #[error("Column name '{0}' appears more than once.")]
    DuplicateColumn(String),
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || cell.eq_ignore_ascii_case("na")
}

/// Loads a TSV file into a model frame.
pub fn load_frame(
    path: impl AsRef<Path>,
    categorical: &[String],
) -> Result<ModelFrame, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    for (i, name) in headers.iter().enumerate() {
        if headers[..i].contains(name) {
            return Err(DataError::DuplicateColumn(name.clone()));
        }
    }
    for name in categorical {
        if !headers.contains(name) {
            return Err(DataError::ColumnNotFound(name.clone()));
        }
    }

    let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (column, cell) in record.iter().enumerate() {
            if is_missing(cell) {
                return Err(DataError::MissingValue {
                    column: headers[column].clone(),
                    row: row + 1,
                });
            }
            cells[column].push(cell.to_string());
        }
    }
    if cells.first().is_none_or(Vec::is_empty) {
        return Err(DataError::NoRows);
    }

    let mut frame = ModelFrame::new();
    for (name, column) in headers.into_iter().zip(cells) {
        let variable = if categorical.contains(&name) {
            summarize_levels(&column)
        } else {
            parse_numeric(&column).unwrap_or_else(|| summarize_levels(&column))
        };
        log::debug!(
            "Column '{}' loaded as {}",
            name,
            if variable.is_numeric() { "numeric" } else { "categorical" }
        );
        frame.insert(name, variable);
    }
    log::info!("Loaded model frame with {} columns", frame.len());
    Ok(frame)
}

fn parse_numeric(column: &[String]) -> Option<Variable> {
    column
        .iter()
        .map(|cell| cell.parse::<f64>().ok().filter(|x| x.is_finite()))
        .collect::<Option<Vec<f64>>>()
        .map(Variable::numeric)
}

fn summarize_levels(column: &[String]) -> Variable {
    let mut counts: AHashMap<&str, usize> = AHashMap::new();
    for cell in column {
        *counts.entry(cell.as_str()).or_insert(0) += 1;
    }
    let mut levels: Vec<&str> = counts.keys().copied().collect();
    levels.sort_by(|a, b| natord::compare(a, b));
    Variable::Categorical {
        counts: levels.iter().map(|level| counts[level]).collect(),
        levels: levels.into_iter().map(str::to_string).collect(),
    }
}
