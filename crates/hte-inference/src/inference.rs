//! Inference layer: ATE and per-row CATE records from a fitted forest.

use hte_core::{AteEstimate, Error, Result};
use serde::{Deserialize, Serialize};

use crate::forest::{AverageEffect, CatePrediction, CausalForest};
use crate::matrix::EstimationMatrices;
use crate::stats::{check_conf_level, mean, sample_variance, two_sided_pvalue, z_critical};

/// Inference settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Two-sided confidence level.
    pub conf_level: f64,
    /// Propensities are clipped to `[clip, 1 - clip]` in doubly robust scores.
    pub propensity_clip: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self { conf_level: 0.95, propensity_clip: 0.01 }
    }
}

impl InferenceConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        check_conf_level(self.conf_level)?;
        if !(self.propensity_clip > 0.0 && self.propensity_clip < 0.5) {
            return Err(Error::Validation(format!(
                "propensity_clip must be in (0,0.5), got {}",
                self.propensity_clip
            )));
        }
        Ok(())
    }
}

/// Normal-theory record from an estimate and its variance.
pub fn normal_estimate(estimate: f64, variance: f64, n_obs: usize, conf_level: f64) -> AteEstimate {
    let se = if variance.is_finite() && variance >= 0.0 { variance.sqrt() } else { f64::NAN };
    let z = z_critical(conf_level);
    AteEstimate {
        ate: estimate,
        se,
        ci_lower: estimate - z * se,
        ci_upper: estimate + z * se,
        pvalue: two_sided_pvalue(estimate, se),
        n_obs,
    }
}

/// Population ATE over the training rows, scored out-of-bag.
pub fn estimate_ate(forest: &CausalForest, conf_level: f64) -> Result<AteEstimate> {
    check_conf_level(conf_level)?;
    let AverageEffect { estimate, variance, n_obs } = forest.oob_average_effect(None)?;
    let ate = normal_estimate(estimate, variance, n_obs, conf_level);
    log::info!(
        "ATE = {:.4} [{:.4}, {:.4}], p={:.4e} (n={})",
        ate.ate,
        ate.ci_lower,
        ate.ci_upper,
        ate.pvalue,
        n_obs
    );
    Ok(ate)
}

/// One row of the CATE table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CateRecord {
    /// Panel row the estimate belongs to.
    pub panel_row: usize,
    /// Cluster of the row.
    pub cluster: String,
    /// Moderator values, in [`CateTable::moderator_names`] order.
    pub moderators: Vec<f64>,
    /// Point estimate.
    pub cate: f64,
    /// Standard error.
    pub se: f64,
    /// Lower confidence bound.
    pub cate_ci_lower: f64,
    /// Upper confidence bound.
    pub cate_ci_upper: f64,
}

/// Per-observation CATE estimates with intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CateTable {
    /// Moderator column names.
    pub moderator_names: Vec<String>,
    /// One record per estimation row.
    pub rows: Vec<CateRecord>,
}

impl CateTable {
    /// Build from out-of-bag predictions aligned with `matrices`.
    pub fn from_predictions(
        matrices: &EstimationMatrices,
        predictions: &[CatePrediction],
        conf_level: f64,
    ) -> Result<Self> {
        check_conf_level(conf_level)?;
        if predictions.len() != matrices.n_rows() {
            return Err(Error::Validation(format!(
                "{} predictions for {} rows",
                predictions.len(),
                matrices.n_rows()
            )));
        }
        let z = z_critical(conf_level);
        let rows = predictions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let se = p.se();
                CateRecord {
                    panel_row: matrices.panel_rows[i],
                    cluster: matrices.cluster_of(i).to_string(),
                    moderators: matrices.x.row(i).to_vec(),
                    cate: p.estimate,
                    se,
                    cate_ci_lower: p.estimate - z * se,
                    cate_ci_upper: p.estimate + z * se,
                }
            })
            .collect();
        Ok(Self { moderator_names: matrices.schema.moderators().to_vec(), rows })
    }

    /// Point estimates in row order.
    pub fn cates(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.cate).collect()
    }
}

/// Doubly robust (AIPW) scores
/// `Γ_i = τ̂_i + (T_i - ê_i) / (ê_i (1 - ê_i)) · (Ỹ_i - (T_i - ê_i) τ̂_i)`
/// with `ê` clipped to `[clip, 1 - clip]`.
pub fn doubly_robust_scores(
    cate: &[f64],
    y_residual: &[f64],
    t_residual: &[f64],
    propensity: &[f64],
    clip: f64,
) -> Result<Vec<f64>> {
    let n = cate.len();
    if y_residual.len() != n || t_residual.len() != n || propensity.len() != n {
        return Err(Error::Validation("doubly robust score inputs have different lengths".into()));
    }
    Ok((0..n)
        .map(|i| {
            let e = propensity[i].clamp(clip, 1.0 - clip);
            let dt = t_residual[i];
            cate[i] + dt / (e * (1.0 - e)) * (y_residual[i] - dt * cate[i])
        })
        .collect())
}

/// AIPW average effect: mean of doubly robust scores with standard error
/// `sd(Γ) / √n`. Used as a cross-check on the forest ATE.
pub fn aipw_ate(scores: &[f64], conf_level: f64) -> Result<AteEstimate> {
    check_conf_level(conf_level)?;
    let finite: Vec<f64> = scores.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return Err(Error::InsufficientData { rows: finite.len(), minimum: 2 });
    }
    let n = finite.len();
    Ok(normal_estimate(mean(&finite), sample_variance(&finite) / n as f64, n, conf_level))
}
