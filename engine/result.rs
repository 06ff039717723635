//! The tidy prediction table returned by `predict_marginal`.

use crate::model::Value;
use crate::predict::PredictionType;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

/// Placeholder written for absent standard errors and interval bounds.
pub const MISSING: &str = "NA";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write prediction table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write prediction table: {0}")]
    Io(#[from] io::Error),
}

/// One row of the prediction table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRow {
    /// Realized focal values, in focal-term order.
    pub values: Vec<Value>,
    /// Predicted value on the response scale.
    pub predicted: f64,
    /// Standard error on the link scale; absent for simulated types and
    /// per-level rows.
    pub std_error: Option<f64>,
    pub conf_low: Option<f64>,
    pub conf_high: Option<f64>,
}

impl PredictionRow {
    /// Width of the interval, when the row has one.
    pub fn interval_width(&self) -> Option<f64> {
        Some(self.conf_high? - self.conf_low?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    /// Focal term names; the leading columns of the table.
    pub terms: Vec<String>,
    pub prediction_type: PredictionType,
    pub ci_level: f64,
    pub rows: Vec<PredictionRow>,
}

impl PredictionResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PredictionRow> {
        self.rows.iter()
    }

    pub fn predicted(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.predicted).collect()
    }

    /// Column headers: the focal terms followed by the estimate columns.
    pub fn header(&self) -> Vec<String> {
        self.terms
            .iter()
            .cloned()
            .chain(
                ["predicted", "std_error", "conf_low", "conf_high"]
                    .into_iter()
                    .map(String::from),
            )
            .collect()
    }

    fn records(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.rows.iter().map(|row| {
            row.values
                .iter()
                .map(Value::to_string)
                .chain(std::iter::once(format_float(row.predicted)))
                .chain(
                    [row.std_error, row.conf_low, row.conf_high]
                        .into_iter()
                        .map(|cell| cell.map_or_else(|| MISSING.to_string(), format_float)),
                )
                .collect()
        })
    }

    /// Writes the table as tab-separated values with a header line.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), OutputError> {
        let mut tsv = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        tsv.write_record(self.header())?;
        for record in self.records() {
            tsv.write_record(&record)?;
        }
        tsv.flush()?;
        Ok(())
    }

    pub fn save_tsv(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        let file = File::create(path)?;
        self.write_tsv(io::BufWriter::new(file))
    }
}

fn format_float(x: f64) -> String {
    let mut buffer = ryu::Buffer::new();
    buffer.format(x).to_string()
}

impl fmt::Display for PredictionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "# Predicted values (type = {}, {}% intervals)",
            self.prediction_type,
            self.ci_level * 100.0
        )?;

        let header = self.header();
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| {
                let number = |x: Option<f64>| x.map_or_else(|| MISSING.to_string(), |v| format!("{v:.3}"));
                row.values
                    .iter()
                    .map(Value::to_string)
                    .chain(std::iter::once(format!("{:.3}", row.predicted)))
                    .chain([number(row.std_error), number(row.conf_low), number(row.conf_high)])
                    .collect()
            })
            .collect();

        let widths: Vec<usize> = (0..header.len())
            .map(|column| {
                cells
                    .iter()
                    .map(|row| row[column].len())
                    .chain(std::iter::once(header[column].len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |f: &mut fmt::Formatter<'_>, row: &[String]| -> fmt::Result {
            let padded: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:>width$}"))
                .collect();
            writeln!(f, "{}", padded.join("  "))
        };

        line(f, &header)?;
        for row in &cells {
            line(f, row)?;
        }
        Ok(())
    }
}
