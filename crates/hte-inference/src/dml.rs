//! Linear double machine learning, reported alongside the forest as a
//! parametric comparison.
//!
//! The final stage regresses `Ỹ` on `T̃ · [1, X - X̄]` without intercept.
//! Centering the moderators makes the first coefficient the average effect
//! over the estimation rows, so its standard error comes straight from the
//! sandwich diagonal.
//!
//! # References
//!
//! - Chernozhukov et al. (2018), "Double/debiased machine learning for
//!   treatment and structural parameters."

use hte_core::{AteEstimate, Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::heterogeneity::CoefficientRow;
use crate::inference::normal_estimate;
use crate::matrix::EstimationMatrices;
use crate::stats::{check_conf_level, ols_cluster_robust, two_sided_pvalue, z_critical};

/// Linear DML fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDmlResult {
    /// Average effect (coefficient on `T̃`).
    pub ate: AteEstimate,
    /// Effect-modification slope per moderator.
    pub interactions: Vec<CoefficientRow>,
    /// Clusters in the sandwich.
    pub n_clusters: usize,
}

/// Fit the linear DML final stage on cross-fitted residuals.
pub fn linear_dml(
    matrices: &EstimationMatrices,
    y_residual: &[f64],
    t_residual: &[f64],
    conf_level: f64,
) -> Result<LinearDmlResult> {
    check_conf_level(conf_level)?;
    let n = matrices.n_rows();
    if y_residual.len() != n || t_residual.len() != n {
        return Err(Error::Validation(format!(
            "linear_dml: {} rows but {} outcome and {} treatment residuals",
            n,
            y_residual.len(),
            t_residual.len()
        )));
    }
    let x = &matrices.x;
    let p = x.n_cols();
    if n <= p + 1 {
        return Err(Error::InsufficientData { rows: n, minimum: p + 2 });
    }

    let centers: Vec<f64> = (0..p).map(|j| x.column(j).iter().sum::<f64>() / n as f64).collect();
    let design = DMatrix::from_fn(n, p + 1, |i, j| {
        let dt = t_residual[i];
        if j == 0 { dt } else { dt * (x.get(i, j - 1) - centers[j - 1]) }
    });
    let y = DVector::from_column_slice(y_residual);
    let fit = ols_cluster_robust(&design, &y, Some(&matrices.cluster_ids))?;

    let ate = normal_estimate(fit.coefficients[0], fit.se[0] * fit.se[0], n, conf_level);
    let z = z_critical(conf_level);
    let interactions = matrices
        .schema
        .moderators()
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let (b, se) = (fit.coefficients[j + 1], fit.se[j + 1]);
            CoefficientRow {
                moderator: name.clone(),
                coefficient: b,
                se,
                ci_lower: b - z * se,
                ci_upper: b + z * se,
                pvalue: two_sided_pvalue(b, se),
            }
        })
        .collect();

    log::info!("linear DML: ATE = {:.4} (se {:.4}, {} clusters)", ate.ate, ate.se, fit.n_clusters);
    Ok(LinearDmlResult { ate, interactions, n_clusters: fit.n_clusters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::build_matrices;
    use approx::assert_relative_eq;
    use hte_core::{Panel, RoleSchema};

    #[test]
    fn recovers_constant_and_linear_effect() {
        let n = 400;
        let clusters: Vec<String> = (0..n).map(|i| format!("c{}", i % 8)).collect();
        let periods: Vec<i64> = (0..n as i64).collect();
        let m: Vec<f64> = (0..n).map(|i| (i % 10) as f64).collect();
        let t: Vec<f64> = (0..n).map(|i| ((i / 3) % 2) as f64).collect();
        let y: Vec<f64> = (0..n).map(|i| t[i] * (1.0 + 0.5 * m[i])).collect();
        let panel = Panel::new(clusters, periods)
            .unwrap()
            .with_column("y", y)
            .unwrap()
            .with_column("t", t.clone())
            .unwrap()
            .with_column("m", m.clone())
            .unwrap();
        let roles = RoleSchema {
            outcome: "y".into(),
            treatment: "t".into(),
            confounders: vec![],
            moderators: vec!["m".into()],
        };
        let mats = build_matrices(&panel, &roles, 10).unwrap();
        let t_res: Vec<f64> = t.iter().map(|v| v - 0.5).collect();
        // Residuals of y = T (1 + 0.5 m).
        let y_res: Vec<f64> = (0..n).map(|i| t_res[i] * (1.0 + 0.5 * m[i])).collect();

        let r = linear_dml(&mats, &y_res, &t_res, 0.95).unwrap();
        let mean_effect = 1.0 + 0.5 * m.iter().sum::<f64>() / n as f64;
        assert_relative_eq!(r.ate.ate, mean_effect, epsilon = 1e-9);
        assert_relative_eq!(r.interactions[0].coefficient, 0.5, epsilon = 1e-9);
        assert_eq!(r.interactions[0].moderator, "m");
        assert_eq!(r.n_clusters, 8);
    }
}
