//! Common data types

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Dense row-major matrix of real-valued features.
///
/// Used for both confounders `W` and moderators `X`. A matrix with zero
/// columns is valid (an empty moderator set) and still carries a row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Build from a flat row-major buffer.
    pub fn new(n_rows: usize, n_cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n_rows * n_cols {
            return Err(Error::Validation(format!(
                "matrix buffer has wrong length: expected {}x{}={}, got {}",
                n_rows,
                n_cols,
                n_rows * n_cols,
                data.len()
            )));
        }
        Ok(Self { n_rows, n_cols, data })
    }

    /// Matrix with `n_rows` rows and no columns.
    pub fn empty(n_rows: usize) -> Self {
        Self { n_rows, n_cols: 0, data: Vec::new() }
    }

    /// Build from row vectors. All rows must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_cols {
                return Err(Error::Validation(format!(
                    "matrix must be rectangular: row {} has len {}, expected {}",
                    i,
                    row.len(),
                    n_cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { n_rows, n_cols, data })
    }

    /// Build from column slices of equal length.
    pub fn from_columns(columns: &[&[f64]], n_rows: usize) -> Result<Self> {
        let n_cols = columns.len();
        if let Some((j, c)) = columns.iter().enumerate().find(|(_, c)| c.len() != n_rows) {
            return Err(Error::Validation(format!(
                "column {} has len {}, expected {}",
                j,
                c.len(),
                n_rows
            )));
        }
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for i in 0..n_rows {
            for c in columns {
                data.push(c[i]);
            }
        }
        Ok(Self { n_rows, n_cols, data })
    }

    /// Number of rows.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Row `i` as a slice.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        let start = i * self.n_cols;
        &self.data[start..start + self.n_cols]
    }

    /// Element `(i, j)`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n_cols + j]
    }

    /// Copy of column `j`.
    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.n_rows).map(|i| self.get(i, j)).collect()
    }

    /// New matrix made of the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.n_cols);
        for &i in rows {
            data.extend_from_slice(self.row(i));
        }
        Self { n_rows: rows.len(), n_cols: self.n_cols, data }
    }

    /// Flat row-major buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Whether every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Two-sided confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower bound.
    pub lower: f64,
    /// Upper bound.
    pub upper: f64,
}

impl ConfidenceInterval {
    /// Interval with both bounds NaN.
    pub fn nan() -> Self {
        Self { lower: f64::NAN, upper: f64::NAN }
    }

    /// Whether `value` lies inside the closed interval.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Interval width.
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Average treatment effect with asymptotic normal inference.
///
/// Field names follow the persisted ATE record
/// `{ate, ci_lower, ci_upper, pvalue}`; the standard error and row count are
/// carried alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AteEstimate {
    /// Point estimate.
    pub ate: f64,
    /// Standard error.
    pub se: f64,
    /// Lower confidence bound.
    pub ci_lower: f64,
    /// Upper confidence bound.
    pub ci_upper: f64,
    /// Two-sided p-value against zero effect.
    pub pvalue: f64,
    /// Number of observations averaged over.
    pub n_obs: usize,
}

impl AteEstimate {
    /// Null record (all numeric fields NaN) for skipped units of work.
    pub fn nan() -> Self {
        Self {
            ate: f64::NAN,
            se: f64::NAN,
            ci_lower: f64::NAN,
            ci_upper: f64::NAN,
            pvalue: f64::NAN,
            n_obs: 0,
        }
    }

    /// Confidence interval view.
    pub fn interval(&self) -> ConfidenceInterval {
        ConfidenceInterval { lower: self.ci_lower, upper: self.ci_upper }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_and_columns_agree() {
        let a = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]])
            .unwrap();
        let c0 = [1.0, 3.0, 5.0];
        let c1 = [2.0, 4.0, 6.0];
        let b = FeatureMatrix::from_columns(&[&c0, &c1], 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.row(1), &[3.0, 4.0]);
        assert_eq!(a.column(1), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn ragged_rows_rejected() {
        assert!(FeatureMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(FeatureMatrix::new(2, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn zero_column_matrix_keeps_rows() {
        let m = FeatureMatrix::empty(4);
        assert_eq!(m.n_rows(), 4);
        assert_eq!(m.n_cols(), 0);
        assert!(m.row(3).is_empty());
        let s = m.select_rows(&[0, 2]);
        assert_eq!(s.n_rows(), 2);
    }

    #[test]
    fn select_rows_preserves_order() {
        let m = FeatureMatrix::from_rows(&[vec![0.0], vec![1.0], vec![2.0]]).unwrap();
        let s = m.select_rows(&[2, 0]);
        assert_eq!(s.as_slice(), &[2.0, 0.0]);
    }

    #[test]
    fn nan_ate_record() {
        let a = AteEstimate::nan();
        assert!(a.ate.is_nan() && a.pvalue.is_nan());
        assert!(!a.interval().contains(0.0));
    }
}
