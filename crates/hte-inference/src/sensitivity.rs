//! Sensitivity and robustness checks.
//!
//! 1. Placebo: exposure `k` periods in the future as treatment; expect no effect.
//! 2. Threshold sweep: re-derive treatment at alternative exposure limits.
//! 3. Leave-one-cluster-out jackknife of the ATE.
//! 4. Omitted-variable bound: how strong an unobserved confounder would have
//!    to be. This is a diagnostic bound, not an identification result.
//!
//! Each check runs behind its own error boundary in [`run_suite`]; a failing
//! check becomes a [`SkippedUnit`] and the rest still run.
//!
//! # References
//!
//! - Cinelli & Hazlett (2020), "Making sense of sensitivity: extending omitted
//!   variable bias."

use hte_core::{AteEstimate, Error, FittedModel, Panel, Result, RoleSchema};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::matrix::build_matrices;
use crate::nuisance::linear::{LogisticRegression, RidgeRegression, bernoulli_ll};
use crate::pipeline::{SkippedUnit, fit_effect};
use crate::stats::{mean, sample_variance};

const PLACEBO_EXPOSURE: &str = "__placebo_exposure";
const PLACEBO_TREATMENT: &str = "__placebo_treatment";
const SWEEP_TREATMENT: &str = "__sweep_treatment";

/// Stage offsets for [`AnalysisConfig::stage_seed`].
const PLACEBO_STAGE: u64 = 10;
const SWEEP_STAGE: u64 = 11;
const JACKKNIFE_STAGE: u64 = 12;

/// Sensitivity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    /// Periods the placebo exposure is shifted into the future.
    pub placebo_lead: usize,
    /// The placebo passes when its p-value exceeds this.
    pub placebo_alpha: f64,
    /// Exposure limits for the threshold sweep.
    pub thresholds: Vec<f64>,
    /// Treatment prevalence band a sweep threshold must fall in to be fitted.
    pub prevalence_band: (f64, f64),
    /// Trees for placebo and sweep forests.
    pub quick_trees: usize,
    /// Trees for each jackknife forest.
    pub jackknife_trees: usize,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            placebo_lead: 7,
            placebo_alpha: 0.05,
            thresholds: vec![15.0, 25.0, 35.0, 50.0],
            prevalence_band: (0.01, 0.99),
            quick_trees: 500,
            jackknife_trees: 300,
        }
    }
}

impl SensitivityConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.prevalence_band;
        if !(0.0..1.0).contains(&lo) || !(lo < hi && hi <= 1.0) {
            return Err(Error::Validation(format!("prevalence_band must satisfy 0 <= lo < hi <= 1, got ({lo}, {hi})")));
        }
        if !(self.placebo_alpha > 0.0 && self.placebo_alpha < 1.0) {
            return Err(Error::Validation(format!("placebo_alpha must be in (0,1), got {}", self.placebo_alpha)));
        }
        if self.placebo_lead == 0 {
            return Err(Error::Validation("placebo_lead must be >= 1".into()));
        }
        if self.quick_trees == 0 || self.jackknife_trees == 0 {
            return Err(Error::Validation("sensitivity forests need at least one tree".into()));
        }
        Ok(())
    }
}

/// One sensitivity check's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum SensitivityResult {
    /// Future exposure as treatment.
    Placebo(PlaceboResult),
    /// Alternative exposure limits.
    ThresholdSweep(ThresholdSweep),
    /// Leave-one-cluster-out refits.
    Jackknife(ClusterJackknife),
    /// Robustness value against unobserved confounding.
    OmittedVariableBound(OmittedVariableBound),
}

/// Placebo ATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceboResult {
    /// Periods of lead.
    pub lead: usize,
    /// Exposure limit defining placebo treatment.
    pub threshold: f64,
    /// Placebo ATE.
    pub ate: f64,
    /// Lower bound.
    pub ci_lower: f64,
    /// Upper bound.
    pub ci_upper: f64,
    /// Two-sided p-value.
    pub pvalue: f64,
    /// Rows fitted.
    pub n_obs: usize,
    /// `pvalue > placebo_alpha`.
    pub passed: bool,
}

/// One threshold of the sweep. Effect fields are `NaN` when not fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRow {
    /// Exposure limit.
    pub threshold: f64,
    /// `100 ·` share of rows with known exposure above the limit.
    pub treat_pct: f64,
    /// ATE.
    pub ate: f64,
    /// Lower bound.
    pub ci_lower: f64,
    /// Upper bound.
    pub ci_upper: f64,
    /// Two-sided p-value.
    pub pvalue: f64,
    /// Rows fitted (0 when skipped).
    pub n_obs: usize,
    /// Why the threshold was not fitted.
    pub skipped: Option<String>,
}

/// Threshold sweep table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSweep {
    /// Exposure column swept.
    pub exposure: String,
    /// One row per configured threshold, in configured order.
    pub rows: Vec<ThresholdRow>,
}

/// ATE with one cluster left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JackknifeRow {
    /// Cluster excluded.
    pub excluded_cluster: String,
    /// ATE.
    pub ate: f64,
    /// Lower bound.
    pub ci_lower: f64,
    /// Upper bound.
    pub ci_upper: f64,
    /// Two-sided p-value.
    pub pvalue: f64,
    /// Rows fitted.
    pub n_rows: usize,
}

/// Leave-one-cluster-out table and stability summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterJackknife {
    /// Fitted refits, clusters in sorted order.
    pub rows: Vec<JackknifeRow>,
    /// Clusters skipped, with the reason.
    pub skipped: Vec<SkippedUnit>,
    /// `max - min` of the refit ATEs.
    pub ate_range: f64,
    /// Mean refit ATE.
    pub ate_mean: f64,
    /// `sd / |mean|` (`NaN` when the mean is 0 or fewer than two refits).
    pub ate_cv: f64,
}

/// Omitted-variable robustness value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmittedVariableBound {
    /// `R²` of the linear outcome model on confounders.
    pub r2_y_given_w: f64,
    /// McFadden pseudo-`R²` of the logistic treatment model on confounders.
    pub pseudo_r2_t_given_w: f64,
    /// `1 - r2_y_given_w`, clamped to `[0, 1]`.
    pub residual_var_y: f64,
    /// `1 - pseudo_r2_t_given_w`, clamped to `[0, 1]`.
    pub residual_var_t: f64,
    /// `sqrt(residual_var_y · residual_var_t)`.
    pub robustness_value: f64,
    /// Plain-language reading.
    pub interpretation: String,
}

/// Everything the suite produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    /// Completed checks, in run order.
    pub results: Vec<SensitivityResult>,
    /// Checks that failed at their boundary.
    pub skipped: Vec<SkippedUnit>,
}

fn quick_ate(panel: &Panel, roles: &RoleSchema, config: &AnalysisConfig, n_trees: usize, seed: u64) -> Result<(AteEstimate, usize)> {
    let matrices = build_matrices(panel, roles, config.min_rows)?;
    let forest = config.forest.with_trees(n_trees);
    let fitted = fit_effect(&matrices, config, &forest, seed)?;
    Ok((fitted.ate, matrices.n_rows()))
}

// ---------------------------------------------------------------------------
// Placebo
// ---------------------------------------------------------------------------

/// Refit with treatment `exposure(t + lead) > threshold` within each cluster.
///
/// A p-value at or below `placebo_alpha` is reported as a failed check; it is
/// never corrected.
pub fn placebo_test(
    panel: &Panel,
    roles: &RoleSchema,
    exposure: &str,
    threshold: f64,
    config: &AnalysisConfig,
) -> Result<PlaceboResult> {
    let sens = &config.sensitivity;
    let lead = sens.placebo_lead;
    let mut shifted = panel.clone();
    shifted.insert_column(PLACEBO_EXPOSURE, panel.lead_within_cluster(exposure, lead)?)?;
    let indicator = shifted.exceedance_indicator(PLACEBO_EXPOSURE, threshold)?;
    shifted.insert_column(PLACEBO_TREATMENT, indicator)?;

    let (ate, n_obs) = quick_ate(
        &shifted,
        &roles.with_treatment(PLACEBO_TREATMENT),
        config,
        sens.quick_trees,
        config.stage_seed(PLACEBO_STAGE),
    )?;
    let passed = ate.pvalue > sens.placebo_alpha;
    if passed {
        log::info!("placebo (lead {}): ATE = {:.4}, p = {:.4}, passed", lead, ate.ate, ate.pvalue);
    } else {
        log::warn!(
            "placebo (lead {}) FAILED: ATE = {:.4} [{:.4}, {:.4}], p = {:.4} <= {}",
            lead,
            ate.ate,
            ate.ci_lower,
            ate.ci_upper,
            ate.pvalue,
            sens.placebo_alpha
        );
    }
    Ok(PlaceboResult {
        lead,
        threshold,
        ate: ate.ate,
        ci_lower: ate.ci_lower,
        ci_upper: ate.ci_upper,
        pvalue: ate.pvalue,
        n_obs,
        passed,
    })
}

// ---------------------------------------------------------------------------
// Threshold sweep
// ---------------------------------------------------------------------------

fn unfitted_row(threshold: f64, treat_pct: f64, reason: String) -> ThresholdRow {
    ThresholdRow {
        threshold,
        treat_pct,
        ate: f64::NAN,
        ci_lower: f64::NAN,
        ci_upper: f64::NAN,
        pvalue: f64::NAN,
        n_obs: 0,
        skipped: Some(reason),
    }
}

/// Re-estimate the ATE with treatment `exposure > threshold` for every
/// configured threshold.
///
/// Thresholds whose prevalence falls outside the configured band, or whose
/// fit fails with a skippable error, keep their row with `NaN` effects.
pub fn threshold_sweep(panel: &Panel, roles: &RoleSchema, exposure: &str, config: &AnalysisConfig) -> Result<ThresholdSweep> {
    let sens = &config.sensitivity;
    let (lo, hi) = sens.prevalence_band;
    let seed = config.stage_seed(SWEEP_STAGE);
    let mut rows = Vec::with_capacity(sens.thresholds.len());

    for &threshold in &sens.thresholds {
        let indicator = panel.exceedance_indicator(exposure, threshold)?;
        let known: Vec<f64> = indicator.iter().copied().filter(|v| !v.is_nan()).collect();
        let prevalence = if known.is_empty() { 0.0 } else { mean(&known) };
        let treat_pct = 100.0 * prevalence;

        if prevalence < lo || prevalence > hi {
            let err = Error::DegenerateTreatment { prevalence, lower: lo, upper: hi };
            log::warn!("threshold {}: {}, not fitted", threshold, err);
            rows.push(unfitted_row(threshold, treat_pct, err.to_string()));
            continue;
        }

        let mut treated = panel.clone();
        treated.insert_column(SWEEP_TREATMENT, indicator)?;
        match quick_ate(&treated, &roles.with_treatment(SWEEP_TREATMENT), config, sens.quick_trees, seed) {
            Ok((ate, n_obs)) => {
                log::info!(
                    "threshold {}: treat_pct {:.1}%, ATE = {:.4} [{:.4}, {:.4}], p = {:.4e}",
                    threshold,
                    treat_pct,
                    ate.ate,
                    ate.ci_lower,
                    ate.ci_upper,
                    ate.pvalue
                );
                rows.push(ThresholdRow {
                    threshold,
                    treat_pct,
                    ate: ate.ate,
                    ci_lower: ate.ci_lower,
                    ci_upper: ate.ci_upper,
                    pvalue: ate.pvalue,
                    n_obs,
                    skipped: None,
                });
            }
            Err(e) if e.is_skippable() => {
                log::warn!("threshold {}: skipped: {}", threshold, e);
                rows.push(unfitted_row(threshold, treat_pct, e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ThresholdSweep { exposure: exposure.to_string(), rows })
}

// ---------------------------------------------------------------------------
// Jackknife
// ---------------------------------------------------------------------------

/// Range, mean and coefficient of variation of refit ATEs.
pub fn stability_summary(ates: &[f64]) -> (f64, f64, f64) {
    if ates.is_empty() {
        return (f64::NAN, f64::NAN, f64::NAN);
    }
    let max = ates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = ates.iter().copied().fold(f64::INFINITY, f64::min);
    let m = mean(ates);
    let cv = if m == 0.0 { f64::NAN } else { sample_variance(ates).sqrt() / m.abs() };
    (max - min, m, cv)
}

/// Refit the ATE once per cluster with that cluster removed.
///
/// A cluster whose removal leaves fewer than `min_rows` complete rows, or whose
/// refit fails with a skippable error, is skipped and logged.
pub fn cluster_jackknife(panel: &Panel, roles: &RoleSchema, config: &AnalysisConfig) -> Result<ClusterJackknife> {
    let seed = config.stage_seed(JACKKNIFE_STAGE);
    let mut rows = Vec::new();
    let mut skipped = Vec::new();

    for cluster in panel.cluster_values() {
        let rest = panel.exclude_cluster(&cluster);
        match quick_ate(&rest, roles, config, config.sensitivity.jackknife_trees, seed) {
            Ok((ate, n_rows)) => {
                log::info!("jackknife without {}: ATE = {:.4} [{:.4}, {:.4}] ({} rows)", cluster, ate.ate, ate.ci_lower, ate.ci_upper, n_rows);
                rows.push(JackknifeRow {
                    excluded_cluster: cluster,
                    ate: ate.ate,
                    ci_lower: ate.ci_lower,
                    ci_upper: ate.ci_upper,
                    pvalue: ate.pvalue,
                    n_rows,
                });
            }
            Err(e) if e.is_skippable() => {
                log::warn!("jackknife: skipping cluster {}: {}", cluster, e);
                skipped.push(SkippedUnit { unit: cluster, reason: e.to_string() });
            }
            Err(e) => return Err(e),
        }
    }

    let ates: Vec<f64> = rows.iter().map(|r| r.ate).collect();
    let (ate_range, ate_mean, ate_cv) = stability_summary(&ates);
    log::info!("jackknife: {} refits, ATE range {:.4}, mean {:.4}, CV {:.3}", rows.len(), ate_range, ate_mean, ate_cv);
    Ok(ClusterJackknife { rows, skipped, ate_range, ate_mean, ate_cv })
}

// ---------------------------------------------------------------------------
// Omitted-variable bound
// ---------------------------------------------------------------------------

/// `sqrt((1 - r2_y)(1 - r2_t))` with both residual fractions clamped to `[0, 1]`.
pub fn robustness_value(r2_y: f64, r2_t: f64) -> f64 {
    let ry = (1.0 - r2_y).clamp(0.0, 1.0);
    let rt = (1.0 - r2_t).clamp(0.0, 1.0);
    (ry * rt).sqrt()
}

/// Omitted-variable robustness value from confounder-only models.
///
/// The outcome model is a near-unpenalized linear regression, the treatment
/// model a logistic regression scored by McFadden's pseudo-`R²`.
pub fn omitted_variable_bound(panel: &Panel, roles: &RoleSchema, config: &AnalysisConfig) -> Result<OmittedVariableBound> {
    let m = build_matrices(panel, &roles.without_moderators(), config.min_rows)?;
    let (y, t, w) = (&m.y, &m.t, &m.w);

    let ridge = RidgeRegression::new(0.0).fit_model(w, y)?;
    let y_bar = mean(y);
    let tss: f64 = y.iter().map(|v| (v - y_bar) * (v - y_bar)).sum();
    let rss: f64 = y.iter().zip(ridge.predict(w)).map(|(v, p)| (v - p) * (v - p)).sum();
    let r2_y = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    let t_bar = mean(t);
    let ll_null: f64 = t.iter().map(|&v| bernoulli_ll(v, t_bar)).sum();
    let logistic = LogisticRegression { lambda: 1e-4, max_iter: 100, tol: 1e-8 };
    let ll_model = logistic.fit_model(w, t)?.log_likelihood(w, t);
    let r2_t = if ll_null != 0.0 { 1.0 - ll_model / ll_null } else { 0.0 };

    let rv = robustness_value(r2_y, r2_t);
    let out = OmittedVariableBound {
        r2_y_given_w: r2_y,
        pseudo_r2_t_given_w: r2_t,
        residual_var_y: (1.0 - r2_y).clamp(0.0, 1.0),
        residual_var_t: (1.0 - r2_t).clamp(0.0, 1.0),
        robustness_value: rv,
        interpretation: format!(
            "An unobserved confounder would need partial R^2 of at least {rv:.3} with both Y and T \
             (after controlling for observed confounders) to reduce the ATE to zero."
        ),
    };
    log::info!(
        "OVB: R2(Y|W) = {:.4}, pseudo-R2(T|W) = {:.4}, robustness value = {:.4}",
        out.r2_y_given_w,
        out.pseudo_r2_t_given_w,
        out.robustness_value
    );
    Ok(out)
}

// ---------------------------------------------------------------------------
// Suite
// ---------------------------------------------------------------------------

fn guarded<T>(name: &str, skipped: &mut Vec<SkippedUnit>, run: impl FnOnce() -> Result<T>) -> Option<T> {
    match run() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("sensitivity check '{}' skipped: {}", name, e);
            skipped.push(SkippedUnit { unit: name.to_string(), reason: e.to_string() });
            None
        }
    }
}

/// Run every check. A failure in one check never stops the others.
///
/// The placebo and the sweep need `exposure`; without it they are skipped.
pub fn run_suite(panel: &Panel, roles: &RoleSchema, exposure: Option<&str>, config: &AnalysisConfig) -> SensitivityReport {
    let mut results = Vec::new();
    let mut skipped = Vec::new();

    match exposure {
        Some(exposure) if panel.has_column(exposure) => {
            let limit = config.policy.reference_limit;
            if let Some(r) = guarded("placebo", &mut skipped, || placebo_test(panel, roles, exposure, limit, config)) {
                results.push(SensitivityResult::Placebo(r));
            }
            if let Some(r) = guarded("threshold_sweep", &mut skipped, || threshold_sweep(panel, roles, exposure, config)) {
                results.push(SensitivityResult::ThresholdSweep(r));
            }
        }
        _ => {
            let reason = format!("exposure column {:?} not available", exposure);
            log::warn!("placebo and threshold sweep skipped: {}", reason);
            skipped.push(SkippedUnit { unit: "placebo".into(), reason: reason.clone() });
            skipped.push(SkippedUnit { unit: "threshold_sweep".into(), reason });
        }
    }
    if let Some(r) = guarded("jackknife", &mut skipped, || cluster_jackknife(panel, roles, config)) {
        results.push(SensitivityResult::Jackknife(r));
    }
    if let Some(r) = guarded("omitted_variable_bound", &mut skipped, || omitted_variable_bound(panel, roles, config)) {
        results.push(SensitivityResult::OmittedVariableBound(r));
    }
    SensitivityReport { results, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    use crate::nuisance::NuisanceConfig;
    use crate::synthetic::{SyntheticConfig, TreatmentAssignment, generate_panel};

    fn refit_config() -> AnalysisConfig {
        let mut c = AnalysisConfig::default();
        c.nuisance = NuisanceConfig::linear();
        c.forest.min_leaf_size = 10;
        c.sensitivity.jackknife_trees = 50;
        c
    }

    fn bernoulli_panel(n_clusters: usize, n_periods: usize, seed: u64) -> (Panel, RoleSchema) {
        let sp = generate_panel(&SyntheticConfig {
            n_clusters,
            n_periods,
            treatment: TreatmentAssignment::Bernoulli { prob: 0.5 },
            seed,
            ..Default::default()
        })
        .unwrap();
        (sp.panel, sp.roles)
    }

    fn confounder_panel(w: Vec<f64>, y: Vec<f64>, t: Vec<f64>) -> (Panel, RoleSchema) {
        let n = w.len();
        let clusters = (0..n).map(|i| format!("c{}", i % 4)).collect();
        let periods = (0..n as i64).collect();
        let x: Vec<f64> = (0..n).map(|i| (i % 7) as f64).collect();
        let panel = Panel::new(clusters, periods)
            .unwrap()
            .with_column("y", y)
            .unwrap()
            .with_column("t", t)
            .unwrap()
            .with_column("w", w)
            .unwrap()
            .with_column("x", x)
            .unwrap();
        let roles = RoleSchema {
            outcome: "y".into(),
            treatment: "t".into(),
            confounders: vec!["w".into()],
            moderators: vec!["x".into()],
        };
        (panel, roles)
    }

    #[test]
    fn robustness_value_vanishes_when_confounders_explain_everything() {
        assert_eq!(robustness_value(1.0, 1.0), 0.0);
        assert_relative_eq!(robustness_value(0.0, 0.0), 1.0);
        assert_relative_eq!(robustness_value(0.75, 0.0), 0.5);
        // Negative R² (worse than the mean) clamps to a full residual.
        assert_relative_eq!(robustness_value(-0.5, 0.0), 1.0);
    }

    #[test]
    fn stability_summary_matches_hand_computation() {
        let (range, m, cv) = stability_summary(&[1.0, 2.0, 3.0]);
        assert_relative_eq!(range, 2.0);
        assert_relative_eq!(m, 2.0);
        assert_relative_eq!(cv, 0.5);
        assert!(stability_summary(&[1.0, -1.0]).2.is_nan());
    }

    #[test]
    fn jackknife_skips_cluster_whose_removal_leaves_too_few_rows() {
        // cluster_00 keeps 140 rows, cluster_01 only 60.
        let (full, roles) = bernoulli_panel(2, 140, 5);
        let rows: Vec<usize> = (0..200).collect();
        let panel = full.take_rows(&rows);
        let config = refit_config();

        let jk = cluster_jackknife(&panel, &roles, &config).unwrap();

        assert_eq!(jk.rows.len(), 1);
        assert_eq!(jk.rows[0].excluded_cluster, "cluster_01");
        assert_eq!(jk.rows[0].n_rows, 140);
        assert_eq!(jk.skipped.len(), 1);
        assert_eq!(jk.skipped[0].unit, "cluster_00");
        assert!(
            jk.skipped[0].reason.contains("insufficient data: 60 usable rows, at least 100 required"),
            "{}",
            jk.skipped[0].reason
        );
        assert_eq!(jk.ate_range, 0.0);
        assert_eq!(jk.ate_mean, jk.rows[0].ate);
        assert!(jk.ate_cv.is_nan());
    }

    #[test]
    fn jackknife_summary_is_computed_from_refit_rows() {
        let (panel, roles) = bernoulli_panel(4, 120, 9);
        let config = refit_config();

        let jk = cluster_jackknife(&panel, &roles, &config).unwrap();

        assert!(jk.skipped.is_empty());
        let excluded: Vec<&str> = jk.rows.iter().map(|r| r.excluded_cluster.as_str()).collect();
        assert_eq!(excluded, ["cluster_00", "cluster_01", "cluster_02", "cluster_03"]);
        assert!(jk.rows.iter().all(|r| r.n_rows == 360 && r.ate.is_finite()));

        let ates: Vec<f64> = jk.rows.iter().map(|r| r.ate).collect();
        let n = ates.len() as f64;
        let m = ates.iter().sum::<f64>() / n;
        let sd = (ates.iter().map(|a| (a - m) * (a - m)).sum::<f64>() / (n - 1.0)).sqrt();
        let hi = ates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let lo = ates.iter().copied().fold(f64::INFINITY, f64::min);
        assert_relative_eq!(jk.ate_mean, m, epsilon = 1e-12);
        assert_relative_eq!(jk.ate_range, hi - lo, epsilon = 1e-12);
        assert_relative_eq!(jk.ate_cv, sd / m.abs(), epsilon = 1e-9);
    }

    #[test]
    fn ovb_near_zero_when_confounder_determines_outcome() {
        let n = 400;
        let mut rng = StdRng::seed_from_u64(3);
        let w: Vec<f64> = (0..n).map(|i| -1.0 + 2.0 * (i as f64 + 0.5) / n as f64).collect();
        let y: Vec<f64> = w.iter().map(|v| 3.0 + 2.0 * v).collect();
        let t: Vec<f64> = w
            .iter()
            .map(|v| {
                let p = 1.0 / (1.0 + (-6.0 * v).exp());
                if rng.random::<f64>() < p { 1.0 } else { 0.0 }
            })
            .collect();
        let (panel, roles) = confounder_panel(w, y, t);

        let ovb = omitted_variable_bound(&panel, &roles, &refit_config()).unwrap();

        assert!(ovb.r2_y_given_w > 1.0 - 1e-6, "R2(Y|W) = {}", ovb.r2_y_given_w);
        assert!(ovb.pseudo_r2_t_given_w > 0.2, "pseudo-R2 = {}", ovb.pseudo_r2_t_given_w);
        assert!(ovb.robustness_value < 1e-3, "RV = {}", ovb.robustness_value);
    }

    #[test]
    fn ovb_near_one_when_confounder_is_noise() {
        let n = 2000;
        let mut rng = StdRng::seed_from_u64(17);
        let w: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
        let t: Vec<f64> = (0..n).map(|_| if rng.random::<f64>() < 0.5 { 1.0 } else { 0.0 }).collect();
        let (panel, roles) = confounder_panel(w, y, t);

        let ovb = omitted_variable_bound(&panel, &roles, &refit_config()).unwrap();

        assert!(ovb.r2_y_given_w.abs() < 0.02, "R2(Y|W) = {}", ovb.r2_y_given_w);
        assert!(ovb.pseudo_r2_t_given_w.abs() < 0.02, "pseudo-R2 = {}", ovb.pseudo_r2_t_given_w);
        assert!(ovb.robustness_value > 0.95, "RV = {}", ovb.robustness_value);
    }

    #[test]
    fn config_validation() {
        SensitivityConfig::default().validate().unwrap();
        let bad = SensitivityConfig { prevalence_band: (0.5, 0.2), ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn result_is_tagged_by_check() {
        let r = SensitivityResult::OmittedVariableBound(OmittedVariableBound {
            r2_y_given_w: 0.5,
            pseudo_r2_t_given_w: 0.5,
            residual_var_y: 0.5,
            residual_var_t: 0.5,
            robustness_value: 0.5,
            interpretation: String::new(),
        });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["check"], "omitted_variable_bound");
    }
}
