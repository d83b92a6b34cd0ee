//! Column-wise standardisation to zero mean and unit variance.

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Per-column mean and population standard deviation, fitted once and
/// reapplied to later matrices unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl StandardScaler {
    /// Fit on a row-major matrix. Constant columns get a scale of 1 so they
    /// transform to zero instead of NaN.
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self, ModelError> {
        let dim = check_rows(rows, None)?;
        let n = rows.len() as f64;

        let mut means = vec![0.0; dim];
        for row in rows {
            for (m, x) in means.iter_mut().zip(row) {
                *m += x;
            }
        }
        means.iter_mut().for_each(|m| *m /= n);

        let mut scales = vec![0.0; dim];
        for row in rows {
            for ((s, x), m) in scales.iter_mut().zip(row).zip(&means) {
                *s += (x - m).powi(2);
            }
        }
        for s in scales.iter_mut() {
            let std = (*s / n).sqrt();
            *s = if std > 0.0 && std.is_finite() { std } else { 1.0 };
        }

        Ok(Self { means, scales })
    }

    pub fn n_features(&self) -> usize {
        self.means.len()
    }

    /// Apply the fitted transform. An empty matrix maps to an empty matrix.
    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, ModelError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        check_rows(rows, Some(self.n_features()))?;
        Ok(rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.means)
                    .zip(&self.scales)
                    .map(|((x, m), s)| (x - m) / s)
                    .collect()
            })
            .collect())
    }

    pub fn fit_transform(rows: &[Vec<f64>]) -> Result<(Self, Vec<Vec<f64>>), ModelError> {
        let scaler = Self::fit(rows)?;
        let scaled = scaler.transform(rows)?;
        Ok((scaler, scaled))
    }
}

/// Validate that every row has the same width; returns that width.
pub(crate) fn check_rows(rows: &[Vec<f64>], expected: Option<usize>) -> Result<usize, ModelError> {
    let first = rows.first().ok_or(ModelError::EmptyInput)?;
    let dim = expected.unwrap_or(first.len());
    if let Some(bad) = rows.iter().find(|r| r.len() != dim) {
        return Err(ModelError::DimensionMismatch {
            expected: dim,
            got: bad.len(),
        });
    }
    Ok(dim)
}
