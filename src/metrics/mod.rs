//! Corrected-area metrics for a single result artifact.
//!
//! The engine reports a bounding-box style area per detected object. When a
//! circularity column is present the area is corrected as
//! `area * circularity` and the square root of the corrected value is the
//! filtered metric; otherwise the square root of the raw area is used.

pub mod columns;
pub mod table;

use crate::orchestrator::retry::Retryable;
use columns::{resolve, AREA_RULES, CIRCULARITY_RULES};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use table::Table;
use thiserror::Error;

pub const ADJUSTED_COLUMN: &str = "Adjusted_Real_Area";
pub const SQRT_COLUMN: &str = "Sqrt_Real_Area";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DerivationMode {
    /// `sqrt(area)`
    RawArea,
    /// `sqrt(area * circularity)`, written back into the artifact.
    CircularityCorrected,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactMetrics {
    pub file_name: String,
    pub count: usize,
    pub avg_sqrt_area: f64,
    pub mode: DerivationMode,
    pub area_column: String,
    pub circularity_column: Option<String>,
    /// Set when the corrected columns could not be saved back to the artifact.
    pub write_back_warning: Option<String>,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open workbook {}: {message}", .path.display())]
    Spreadsheet { path: PathBuf, message: String },
    #[error("artifact has no header row")]
    Empty,
    #[error("quoted field starting on line {line} is never closed")]
    UnterminatedQuote { line: usize },
    #[error("line {line} has {found} fields, header has {expected}")]
    Ragged {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("column '{column}' row {row}: '{value}' is not a number")]
    NotNumeric {
        column: String,
        row: usize,
        value: String,
    },
    #[error("column '{wanted}' not found (columns: {available})")]
    MissingColumn {
        wanted: &'static str,
        available: String,
    },
    #[error("negative value {value} in column '{column}' row {row}: square root undefined")]
    NegativeArea {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("metrics worker stopped: {0}")]
    Worker(String),
}

impl Retryable for MetricsError {
    /// Read failures and half-written tables may clear up once the engine
    /// finishes flushing; content errors will not.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetricsError::Io { .. }
                | MetricsError::Spreadsheet { .. }
                | MetricsError::Empty
                | MetricsError::UnterminatedQuote { .. }
                | MetricsError::Ragged { .. }
                | MetricsError::NotNumeric { .. }
        )
    }
}

pub type ComputedMetrics = Result<ArtifactMetrics, MetricsError>;

/// Compute the filtered corrected-area statistics for one artifact.
///
/// Never panics on bad input; every failure is returned as a [`MetricsError`].
pub fn compute(path: &Path, threshold: f64) -> ComputedMetrics {
    compute_with(path, threshold, Table::write)
}

/// [`compute`] with the write-back step supplied by the caller.
pub fn compute_with<W>(path: &Path, threshold: f64, write_back: W) -> ComputedMetrics
where
    W: FnOnce(&Table, &Path) -> io::Result<()>,
{
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut table = Table::read(path)?;

    let area = resolve(&table.headers, AREA_RULES).ok_or_else(|| MetricsError::MissingColumn {
        wanted: "area",
        available: table.headers.join(", "),
    })?;
    let circularity = resolve(&table.headers, CIRCULARITY_RULES);

    let area_values = table.numeric_column(area.index)?;

    let (mode, derived, write_back_warning) = match &circularity {
        None => (
            DerivationMode::RawArea,
            sqrt_checked(&area_values, &area.header)?,
            None,
        ),
        Some(circ) => {
            let circ_values = table.numeric_column(circ.index)?;
            let adjusted: Vec<f64> = area_values
                .iter()
                .zip(&circ_values)
                .map(|(a, c)| a * c)
                .collect();
            let sqrt_values = sqrt_checked(&adjusted, ADJUSTED_COLUMN)?;

            table.set_column(ADJUSTED_COLUMN, &adjusted);
            table.set_column(SQRT_COLUMN, &sqrt_values);
            let warning = match write_back(&table, path) {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Could not write corrected columns back");
                    Some(e.to_string())
                }
            };
            (DerivationMode::CircularityCorrected, sqrt_values, warning)
        }
    };

    let (count, avg_sqrt_area) = filter_mean(&derived, threshold);

    tracing::debug!(
        file = %file_name,
        mode = ?mode,
        area_rule = area.rule,
        rows = derived.len(),
        count,
        avg_sqrt_area,
        "Computed artifact metrics"
    );

    Ok(ArtifactMetrics {
        file_name,
        count,
        avg_sqrt_area,
        mode,
        area_column: area.header,
        circularity_column: circularity.map(|c| c.header),
        write_back_warning,
    })
}

fn sqrt_checked(values: &[f64], column: &str) -> Result<Vec<f64>, MetricsError> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if v < 0.0 {
                Err(MetricsError::NegativeArea {
                    column: column.to_string(),
                    row: i + 2,
                    value: v,
                })
            } else {
                Ok(v.sqrt())
            }
        })
        .collect()
}

/// Count and mean of the values at or above `threshold`; mean is 0.0 when nothing passes.
pub fn filter_mean(values: &[f64], threshold: f64) -> (usize, f64) {
    let kept: Vec<f64> = values.iter().copied().filter(|v| *v >= threshold).collect();
    if kept.is_empty() {
        return (0, 0.0);
    }
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    (kept.len(), mean)
}
