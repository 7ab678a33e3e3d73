//! Matrix builder.
//!
//! Projects a [`Panel`] and a negotiated [`ActiveSchema`] into the aligned
//! numeric arrays every estimation stage consumes. Rows with a missing value
//! in any active role column are dropped before any model sees them.

use hte_core::{ActiveSchema, Error, FeatureMatrix, Panel, Result, RoleSchema};
use serde::Serialize;

/// Minimum usable row count used when none is configured.
pub const DEFAULT_MIN_ROWS: usize = 100;

/// Errors raised while projecting the panel.
#[derive(Debug, thiserror::Error)]
pub enum MatrixBuildError {
    /// Treatment column holds a value other than 0 or 1.
    #[error("treatment column '{column}' must be binary, found {value} at panel row {row}")]
    NonBinaryTreatment {
        /// Treatment column name.
        column: String,
        /// Offending panel row.
        row: usize,
        /// Offending value.
        value: f64,
    },

    /// A role column holds an infinite value.
    #[error("column '{column}' contains a non-finite value at panel row {row}")]
    NonFinite {
        /// Column name.
        column: String,
        /// Offending panel row.
        row: usize,
    },
}

impl From<MatrixBuildError> for Error {
    fn from(e: MatrixBuildError) -> Self {
        Error::Validation(e.to_string())
    }
}

/// Aligned arrays for one estimation run.
#[derive(Debug, Clone, Serialize)]
pub struct EstimationMatrices {
    /// Outcome `Y`.
    pub y: Vec<f64>,
    /// Binary treatment `T` (0.0 / 1.0).
    pub t: Vec<f64>,
    /// Moderators `X`, columns in [`ActiveSchema::moderators`] order.
    pub x: FeatureMatrix,
    /// Confounders `W`, columns in [`ActiveSchema::confounders`] order.
    pub w: FeatureMatrix,
    /// Dense cluster code per row (index into `cluster_names`).
    pub cluster_ids: Vec<usize>,
    /// Cluster names, sorted.
    pub cluster_names: Vec<String>,
    /// Panel row each matrix row came from.
    pub panel_rows: Vec<usize>,
    /// Schema the arrays were built under.
    pub schema: ActiveSchema,
}

impl EstimationMatrices {
    /// Number of complete rows.
    pub fn n_rows(&self) -> usize {
        self.y.len()
    }

    /// Share of treated rows.
    pub fn treated_share(&self) -> f64 {
        if self.t.is_empty() {
            return f64::NAN;
        }
        self.t.iter().sum::<f64>() / self.t.len() as f64
    }

    /// Cluster name of matrix row `i`.
    pub fn cluster_of(&self, i: usize) -> &str {
        &self.cluster_names[self.cluster_ids[i]]
    }

    /// Values of panel column `name` on the estimation rows, in row order.
    pub fn aligned_column(&self, panel: &Panel, name: &str) -> Result<Vec<f64>> {
        let col = panel.column(name).ok_or_else(|| Error::MissingColumn(name.to_string()))?;
        self.panel_rows
            .iter()
            .map(|&r| {
                col.get(r).copied().ok_or_else(|| {
                    Error::Validation(format!("panel row {r} out of range for column '{name}'"))
                })
            })
            .collect()
    }

    /// `[X | W]` side by side, the feature set seen by the nuisance models.
    pub fn nuisance_features(&self, include_moderators: bool) -> FeatureMatrix {
        if !include_moderators || self.x.n_cols() == 0 {
            return self.w.clone();
        }
        let n = self.n_rows();
        let p = self.x.n_cols() + self.w.n_cols();
        let mut data = Vec::with_capacity(n * p);
        for i in 0..n {
            data.extend_from_slice(self.x.row(i));
            data.extend_from_slice(self.w.row(i));
        }
        // Lengths agree by construction.
        FeatureMatrix::new(n, p, data).unwrap_or_else(|_| FeatureMatrix::empty(n))
    }
}

/// Negotiate `roles` against `panel`, then project.
pub fn build_matrices(panel: &Panel, roles: &RoleSchema, min_rows: usize) -> Result<EstimationMatrices> {
    let schema = roles.negotiate(panel)?;
    build_active(panel, &schema, min_rows)
}

/// Project `panel` under an already negotiated schema.
///
/// Fails with [`Error::InsufficientData`] when fewer than `min_rows` complete
/// rows remain; callers treat that as "skip this unit of work".
pub fn build_active(panel: &Panel, schema: &ActiveSchema, min_rows: usize) -> Result<EstimationMatrices> {
    let column = |name: &str| panel.column(name).ok_or_else(|| Error::MissingColumn(name.to_string()));

    let y_col = column(schema.outcome())?;
    let t_col = column(schema.treatment())?;
    let x_cols = schema.moderators().iter().map(|n| column(n.as_str())).collect::<Result<Vec<_>>>()?;
    let w_cols = schema.confounders().iter().map(|n| column(n.as_str())).collect::<Result<Vec<_>>>()?;

    let named: Vec<(&str, &[f64])> = schema
        .required_columns()
        .map(|n| (n, panel.column(n).unwrap_or(&[])))
        .collect();

    let mut panel_rows = Vec::with_capacity(panel.n_rows());
    for i in 0..panel.n_rows() {
        if named.iter().any(|(_, c)| c[i].is_nan()) {
            continue;
        }
        if let Some((name, _)) = named.iter().find(|(_, c)| !c[i].is_finite()) {
            return Err(MatrixBuildError::NonFinite { column: name.to_string(), row: i }.into());
        }
        let t = t_col[i];
        if t != 0.0 && t != 1.0 {
            return Err(MatrixBuildError::NonBinaryTreatment {
                column: schema.treatment().to_string(),
                row: i,
                value: t,
            }
            .into());
        }
        panel_rows.push(i);
    }

    let n = panel_rows.len();
    log::info!(
        "matrix builder: outcome '{}', {} of {} rows complete ({} moderators, {} confounders)",
        schema.outcome(),
        n,
        panel.n_rows(),
        x_cols.len(),
        w_cols.len()
    );
    if n < min_rows {
        return Err(Error::InsufficientData { rows: n, minimum: min_rows });
    }

    let pick = |c: &[f64]| -> Vec<f64> { panel_rows.iter().map(|&i| c[i]).collect() };
    let x_data: Vec<Vec<f64>> = x_cols.iter().map(|c| pick(c)).collect();
    let w_data: Vec<Vec<f64>> = w_cols.iter().map(|c| pick(c)).collect();
    let x_refs: Vec<&[f64]> = x_data.iter().map(|v| v.as_slice()).collect();
    let w_refs: Vec<&[f64]> = w_data.iter().map(|v| v.as_slice()).collect();

    let mut cluster_names: Vec<String> = panel_rows.iter().map(|&i| panel.clusters()[i].clone()).collect();
    cluster_names.sort();
    cluster_names.dedup();
    let cluster_ids = panel_rows
        .iter()
        .map(|&i| cluster_names.binary_search(&panel.clusters()[i]).unwrap_or(0))
        .collect();

    Ok(EstimationMatrices {
        y: pick(y_col),
        t: pick(t_col),
        x: FeatureMatrix::from_columns(&x_refs, n)?,
        w: FeatureMatrix::from_columns(&w_refs, n)?,
        cluster_ids,
        cluster_names,
        panel_rows,
        schema: schema.clone(),
    })
}
