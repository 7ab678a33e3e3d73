//! Heterogeneity diagnostics: best linear projection (BLP) and classification
//! analysis (CLAN).
//!
//! Both return `Result<_, ExtractionFailure>`; a failure is a typed, loggable
//! reason and never aborts the surrounding run.
//!
//! # References
//!
//! - Semenova & Chernozhukov (2021), "Debiased machine learning of conditional
//!   average treatment effects and other causal functions."
//! - Chernozhukov, Demirer, Duflo & Fernández-Val (2018), "Generic Machine
//!   Learning Inference on Heterogeneous Treatment Effects."

use hte_core::{ExtractionFailure, FeatureMatrix};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::stats::{ols_cluster_robust, quantile_linear, two_sided_pvalue, z_critical};

/// Quartile labels, least to most affected.
pub const QUARTILE_LABELS: [&str; 4] = ["Q1 (lowest)", "Q2", "Q3", "Q4 (highest)"];

/// One regression coefficient with normal-theory inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRow {
    /// Moderator name (`"(intercept)"` for the constant).
    pub moderator: String,
    /// Coefficient.
    pub coefficient: f64,
    /// Cluster-robust standard error.
    pub se: f64,
    /// Lower confidence bound.
    pub ci_lower: f64,
    /// Upper confidence bound.
    pub ci_upper: f64,
    /// Two-sided p-value.
    pub pvalue: f64,
}

/// Projection of doubly robust scores on the moderators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlpTable {
    /// Constant term.
    pub intercept: CoefficientRow,
    /// One row per moderator.
    pub rows: Vec<CoefficientRow>,
    /// Observations used.
    pub n_obs: usize,
    /// Clusters in the sandwich.
    pub n_clusters: usize,
}

/// Regress doubly robust scores `Γ` on `[1, X]` with cluster-robust errors.
pub fn best_linear_projection(
    scores: &[f64],
    x: &FeatureMatrix,
    names: &[String],
    cluster_ids: &[usize],
    conf_level: f64,
) -> Result<BlpTable, ExtractionFailure> {
    let p = x.n_cols();
    let n = x.n_rows();
    if p == 0 {
        return Err(ExtractionFailure::NoModerators);
    }
    if n <= p + 1 {
        return Err(ExtractionFailure::TooFewObservations { n, required: p + 2 });
    }
    if scores.iter().any(|v| !v.is_finite()) {
        return Err(ExtractionFailure::NonFinite("doubly robust scores".into()));
    }

    let design = DMatrix::from_fn(n, p + 1, |i, j| if j == 0 { 1.0 } else { x.get(i, j - 1) });
    let y = DVector::from_column_slice(scores);
    let fit = ols_cluster_robust(&design, &y, Some(cluster_ids)).map_err(|_| ExtractionFailure::SingularDesign)?;
    if fit.se.iter().any(|s| !s.is_finite()) {
        return Err(ExtractionFailure::NonFinite("projection standard errors".into()));
    }

    let z = z_critical(conf_level);
    let row = |name: &str, j: usize| {
        let (b, se) = (fit.coefficients[j], fit.se[j]);
        CoefficientRow {
            moderator: name.to_string(),
            coefficient: b,
            se,
            ci_lower: b - z * se,
            ci_upper: b + z * se,
            pvalue: two_sided_pvalue(b, se),
        }
    };

    Ok(BlpTable {
        intercept: row("(intercept)", 0),
        rows: names.iter().enumerate().map(|(j, name)| row(name, j + 1)).collect(),
        n_obs: n,
        n_clusters: fit.n_clusters,
    })
}

/// Moderator and effect means within one CATE quartile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClanRow {
    /// Quartile label.
    pub label: String,
    /// Rows in the quartile.
    pub n_obs: usize,
    /// Mean CATE.
    pub mean_cate: f64,
    /// Mean of each moderator, in [`ClanTable::moderator_names`] order.
    pub moderator_means: Vec<f64>,
}

/// CLAN table, quartiles ordered least to most affected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClanTable {
    /// Moderator names.
    pub moderator_names: Vec<String>,
    /// Quartile edges (25th, 50th, 75th percentile of CATE).
    pub edges: [f64; 3],
    /// Four rows.
    pub rows: Vec<ClanRow>,
}

/// Quartile (0..=3) of `value` given the three inner edges; the lowest
/// quartile is closed on both sides.
pub fn quartile_of(value: f64, edges: &[f64; 3]) -> usize {
    edges.iter().take_while(|&&e| value > e).count()
}

/// Inner quartile edges of `values`.
pub fn quartile_edges(values: &[f64]) -> [f64; 3] {
    [quantile_linear(values, 0.25), quantile_linear(values, 0.5), quantile_linear(values, 0.75)]
}

/// Group rows into CATE quartiles and report mean moderators and CATE.
///
/// Tied edges can leave a quartile empty; its means are `NaN`.
pub fn classification_analysis(
    cate: &[f64],
    x: &FeatureMatrix,
    names: &[String],
) -> Result<ClanTable, ExtractionFailure> {
    let n = cate.len();
    if n < 4 {
        return Err(ExtractionFailure::TooFewObservations { n, required: 4 });
    }
    if x.n_rows() != n {
        return Err(ExtractionFailure::TooFewObservations { n: x.n_rows(), required: n });
    }
    if cate.iter().any(|v| !v.is_finite()) {
        return Err(ExtractionFailure::NonFinite("CATE estimates".into()));
    }

    let edges = quartile_edges(cate);
    let p = x.n_cols();
    let mut counts = [0usize; 4];
    let mut cate_sum = [0.0; 4];
    let mut mod_sum = vec![vec![0.0; p]; 4];
    for (i, &c) in cate.iter().enumerate() {
        let q = quartile_of(c, &edges);
        counts[q] += 1;
        cate_sum[q] += c;
        for (s, v) in mod_sum[q].iter_mut().zip(x.row(i)) {
            *s += v;
        }
    }

    let rows = (0..4)
        .map(|q| {
            let k = counts[q] as f64;
            let div = |s: f64| if counts[q] == 0 { f64::NAN } else { s / k };
            ClanRow {
                label: QUARTILE_LABELS[q].to_string(),
                n_obs: counts[q],
                mean_cate: div(cate_sum[q]),
                moderator_means: mod_sum[q].iter().map(|&s| div(s)).collect(),
            }
        })
        .collect();

    Ok(ClanTable { moderator_names: names.to_vec(), edges, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn clan_orders_quartiles_and_averages() {
        let cate: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let x = FeatureMatrix::from_columns(&[&[10.0, 10.0, 20.0, 20.0, 30.0, 30.0, 40.0, 40.0]], 8).unwrap();
        let t = classification_analysis(&cate, &x, &["density".into()]).unwrap();
        assert_eq!(t.rows.len(), 4);
        assert_eq!(t.rows[0].label, "Q1 (lowest)");
        assert_eq!(t.rows[3].label, "Q4 (highest)");
        assert!(t.rows.iter().all(|r| r.n_obs == 2));
        assert_relative_eq!(t.rows[0].mean_cate, 0.5);
        assert_relative_eq!(t.rows[3].moderator_means[0], 40.0);
        assert!(t.rows.windows(2).all(|w| w[0].mean_cate < w[1].mean_cate));
    }

    #[test]
    fn clan_failures_are_typed() {
        let x = FeatureMatrix::empty(3);
        assert!(matches!(
            classification_analysis(&[1.0, 2.0, 3.0], &x, &[]),
            Err(ExtractionFailure::TooFewObservations { n: 3, required: 4 })
        ));
        let x = FeatureMatrix::empty(4);
        assert!(matches!(
            classification_analysis(&[1.0, f64::NAN, 3.0, 4.0], &x, &[]),
            Err(ExtractionFailure::NonFinite(_))
        ));
    }

    #[test]
    fn blp_recovers_linear_heterogeneity() {
        let n = 200;
        let xs: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let scores: Vec<f64> = xs.iter().enumerate().map(|(i, &x)| 1.0 + 2.0 * x + if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        let x = FeatureMatrix::from_columns(&[&xs], n).unwrap();
        let clusters: Vec<usize> = (0..n).map(|i| i % 10).collect();
        let t = best_linear_projection(&scores, &x, &["density".into()], &clusters, 0.95).unwrap();
        assert_relative_eq!(t.intercept.coefficient, 1.0, epsilon = 0.05);
        assert_relative_eq!(t.rows[0].coefficient, 2.0, epsilon = 0.05);
        assert!(t.rows[0].pvalue < 1e-6);
        assert_eq!(t.n_clusters, 10);
    }

    #[test]
    fn blp_failures_are_typed() {
        let x = FeatureMatrix::empty(10);
        assert_eq!(
            best_linear_projection(&[0.0; 10], &x, &[], &[0; 10], 0.95),
            Err(ExtractionFailure::NoModerators)
        );
        let c = [1.0; 10];
        let x = FeatureMatrix::from_columns(&[&c], 10).unwrap();
        assert_eq!(
            best_linear_projection(&[0.5; 10], &x, &["const".into()], &[0; 10], 0.95),
            Err(ExtractionFailure::SingularDesign)
        );
    }

    #[test]
    fn quartile_boundaries_are_right_closed() {
        let edges = [1.0, 2.0, 3.0];
        assert_eq!(quartile_of(1.0, &edges), 0);
        assert_eq!(quartile_of(1.5, &edges), 1);
        assert_eq!(quartile_of(3.0, &edges), 2);
        assert_eq!(quartile_of(3.1, &edges), 3);
    }
}
