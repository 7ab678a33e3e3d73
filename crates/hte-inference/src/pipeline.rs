//! Staged estimation pipeline.
//!
//! matrix build → cross-fit → forest → inference, then the independent
//! consumers (heterogeneity, linear DML, policy, sensitivity). Each stage
//! starts only after its predecessor has returned.

use std::time::Instant;

use hte_core::{AteEstimate, Error, ExtractionFailure, Panel, Result, RoleSchema};
use serde::{Deserialize, Serialize};

use crate::attribution::{ShapleyValues, shapley_values};
use crate::config::AnalysisConfig;
use crate::crossfit::{CrossFitResult, FoldDiagnostics, cross_fit};
use crate::dml::{LinearDmlResult, linear_dml};
use crate::forest::{CausalForest, ForestConfig};
use crate::heterogeneity::{BlpTable, ClanTable, best_linear_projection, classification_analysis};
use crate::inference::{CateTable, aipw_ate, doubly_robust_scores, estimate_ate};
use crate::matrix::{EstimationMatrices, build_matrices};
use crate::policy::{PolicyReport, policy_report};
use crate::sensitivity::{SensitivityReport, run_suite};

/// Forest seeds start this far above the cross-fitting seeds.
const FOREST_SEED_OFFSET: u64 = 1 << 20;
/// Stage offset of the policy bootstrap.
const BOOTSTRAP_STAGE: u64 = 2;
/// Stage offset of the Shapley attribution.
const ATTRIBUTION_STAGE: u64 = 3;
/// Depth cut-off for variable importance.
const IMPORTANCE_DEPTH: usize = 4;

/// A unit of work (outcome, cluster, threshold, check) that was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedUnit {
    /// What was skipped.
    pub unit: String,
    /// Why.
    pub reason: String,
}

/// Cross-fitted residuals, forest and out-of-bag ATE for one set of matrices.
#[derive(Debug, Clone)]
pub struct FittedEffect {
    /// Nuisance predictions and residuals.
    pub crossfit: CrossFitResult,
    /// Forest on the residuals.
    pub forest: CausalForest,
    /// Out-of-bag ATE.
    pub ate: AteEstimate,
}

/// Cross-fit, grow the forest and estimate the ATE.
///
/// Fails with [`Error::DegenerateTreatment`] when every row is treated or
/// every row is control.
pub fn fit_effect(
    matrices: &EstimationMatrices,
    config: &AnalysisConfig,
    forest: &ForestConfig,
    seed: u64,
) -> Result<FittedEffect> {
    let share = matrices.treated_share();
    if !(share > 0.0 && share < 1.0) {
        return Err(Error::DegenerateTreatment { prevalence: share, lower: 0.0, upper: 1.0 });
    }
    let features = matrices.nuisance_features(config.cross_fit.include_moderators);
    let crossfit = cross_fit(&features, &matrices.y, &matrices.t, &config.nuisance, &config.cross_fit, seed)?;
    let forest = CausalForest::fit(
        &matrices.x,
        &crossfit.y_residual,
        &crossfit.t_residual,
        &matrices.t,
        forest,
        seed.wrapping_add(FOREST_SEED_OFFSET),
    )?;
    let ate = estimate_ate(&forest, config.inference.conf_level)?;
    Ok(FittedEffect { crossfit, forest, ate })
}

/// Serializable estimates for one outcome.
#[derive(Debug, Clone, Serialize)]
pub struct EffectReport {
    /// Outcome column.
    pub outcome: String,
    /// Rows after the completeness filter.
    pub n_obs: usize,
    /// Clusters present.
    pub n_clusters: usize,
    /// Share of treated rows.
    pub treated_share: f64,
    /// Role columns dropped during schema negotiation.
    pub dropped_columns: Vec<String>,
    /// Forest ATE (out-of-bag).
    pub ate: AteEstimate,
    /// AIPW cross-check.
    pub aipw_ate: Option<AteEstimate>,
    /// Linear DML comparison.
    pub linear_dml: Option<LinearDmlResult>,
    /// Per-row CATE.
    pub cate: CateTable,
    /// Best linear projection, or the reason it is missing.
    pub blp: std::result::Result<BlpTable, ExtractionFailure>,
    /// Classification analysis, or the reason it is missing.
    pub clan: std::result::Result<ClanTable, ExtractionFailure>,
    /// `(moderator, importance)` pairs.
    pub variable_importance: Vec<(String, f64)>,
    /// Shapley values of the CATE; `None` when disabled, without moderators or
    /// when no row could be attributed.
    pub attribution: Option<ShapleyValues>,
    /// Per-fold nuisance diagnostics.
    pub crossfit: Vec<FoldDiagnostics>,
}

/// Everything produced for one outcome, including the fitted state consumers
/// need.
#[derive(Debug, Clone)]
pub struct EffectRun {
    /// Arrays the run was fitted on.
    pub matrices: EstimationMatrices,
    /// Fitted stages.
    pub fitted: FittedEffect,
    /// Serializable estimates.
    pub report: EffectReport,
}

fn finite_rows(cate: &[f64], scores: &[f64]) -> Vec<usize> {
    (0..cate.len()).filter(|&i| cate[i].is_finite() && scores[i].is_finite()).collect()
}

/// Run matrix build, cross-fitting, forest and inference for one outcome.
pub fn estimate_effects(panel: &Panel, roles: &RoleSchema, config: &AnalysisConfig) -> Result<EffectRun> {
    let t0 = Instant::now();
    let matrices = build_matrices(panel, roles, config.min_rows)?;
    let fitted = fit_effect(&matrices, config, &config.forest, config.seed)?;
    let conf = config.inference.conf_level;

    let predictions = fitted.forest.predict_oob();
    let cate = CateTable::from_predictions(&matrices, &predictions, conf)?;
    let cates = cate.cates();
    let scores = doubly_robust_scores(
        &cates,
        &fitted.crossfit.y_residual,
        &fitted.crossfit.t_residual,
        &fitted.crossfit.t_hat,
        config.inference.propensity_clip,
    )?;

    let keep = finite_rows(&cates, &scores);
    if keep.len() < cates.len() {
        log::debug!("{} rows without an out-of-bag estimate excluded from BLP/CLAN", cates.len() - keep.len());
    }
    let x_kept = matrices.x.select_rows(&keep);
    let pick = |v: &[f64]| keep.iter().map(|&i| v[i]).collect::<Vec<f64>>();
    let clusters_kept: Vec<usize> = keep.iter().map(|&i| matrices.cluster_ids[i]).collect();
    let names = matrices.schema.moderators();

    let aipw = match aipw_ate(&pick(&scores), conf) {
        Ok(a) => Some(a),
        Err(e) => {
            log::warn!("AIPW cross-check unavailable: {}", e);
            None
        }
    };
    let blp = best_linear_projection(&pick(&scores), &x_kept, names, &clusters_kept, conf);
    if let Err(reason) = &blp {
        log::warn!("BLP extraction failed: {}", reason);
    }
    let clan = classification_analysis(&pick(&cates), &x_kept, names);
    if let Err(reason) = &clan {
        log::warn!("CLAN extraction failed: {}", reason);
    }
    let dml = match linear_dml(&matrices, &fitted.crossfit.y_residual, &fitted.crossfit.t_residual, conf) {
        Ok(d) => Some(d),
        Err(e) if e.is_skippable() => {
            log::warn!("linear DML skipped: {}", e);
            None
        }
        Err(e) => return Err(e),
    };

    let importance = fitted.forest.variable_importance(IMPORTANCE_DEPTH);
    let attribution = if !config.attribution.enabled {
        None
    } else if names.is_empty() {
        log::info!("attribution skipped: no moderators");
        None
    } else {
        match shapley_values(&fitted.forest, &matrices.x, names, &config.attribution, config.stage_seed(ATTRIBUTION_STAGE)) {
            Ok(a) => Some(a),
            Err(e) if e.is_skippable() => {
                log::warn!("attribution skipped: {}", e);
                None
            }
            Err(e) => return Err(e),
        }
    };
    let report = EffectReport {
        outcome: matrices.schema.outcome().to_string(),
        n_obs: matrices.n_rows(),
        n_clusters: matrices.cluster_names.len(),
        treated_share: matrices.treated_share(),
        dropped_columns: matrices.schema.dropped().to_vec(),
        ate: fitted.ate.clone(),
        aipw_ate: aipw,
        linear_dml: dml,
        cate,
        blp,
        clan,
        variable_importance: names.iter().cloned().zip(importance).collect(),
        attribution,
        crossfit: fitted.crossfit.diagnostics.clone(),
    };
    log::info!(
        "outcome '{}': ATE = {:.4} [{:.4}, {:.4}] on {} rows in {:.1}s",
        report.outcome,
        report.ate.ate,
        report.ate.ci_lower,
        report.ate.ci_upper,
        report.n_obs,
        t0.elapsed().as_secs_f64()
    );
    Ok(EffectRun { matrices, fitted, report })
}

/// Full analysis of the primary outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    /// Estimates.
    pub effects: EffectReport,
    /// Policy tables.
    pub policy: Option<PolicyReport>,
    /// Sensitivity checks.
    pub sensitivity: Option<SensitivityReport>,
}

/// Which downstream consumers to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumers {
    /// Policy tables and bootstrap.
    pub policy: bool,
    /// Sensitivity suite.
    pub sensitivity: bool,
}

impl Default for Consumers {
    fn default() -> Self {
        Self { policy: true, sensitivity: true }
    }
}

/// Run `f` inside a pool of `threads` workers (0 = Rayon default).
pub fn with_thread_pool<T: Send>(threads: usize, f: impl FnOnce() -> Result<T> + Send) -> Result<T> {
    if threads == 0 {
        return f();
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;
    pool.install(f)
}

/// Estimate effects for the outcome in `roles`, then run the requested
/// consumers on the fitted forest.
pub fn run_analysis(panel: &Panel, roles: &RoleSchema, config: &AnalysisConfig, consumers: Consumers) -> Result<AnalysisReport> {
    config.validate()?;
    with_thread_pool(config.threads, || {
        let run = estimate_effects(panel, roles, config)?;
        let exposure = config.exposure_column.as_deref();

        let policy = if consumers.policy {
            let cates = run.report.cate.cates();
            match policy_report(
                panel,
                &run.matrices,
                &cates,
                exposure,
                &config.policy,
                &config.bootstrap,
                config.stage_seed(BOOTSTRAP_STAGE),
            ) {
                Ok(p) => Some(p),
                Err(e) if e.is_skippable() => {
                    log::warn!("policy analysis skipped: {}", e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let sensitivity = consumers.sensitivity.then(|| run_suite(panel, roles, exposure, config));
        Ok(AnalysisReport { effects: run.report, policy, sensitivity })
    })
}

/// One line of the multi-outcome summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummaryRow {
    /// Outcome column.
    pub outcome: String,
    /// Rows fitted.
    pub n_obs: usize,
    /// ATE.
    pub ate: f64,
    /// Lower bound.
    pub ci_lower: f64,
    /// Upper bound.
    pub ci_upper: f64,
    /// Two-sided p-value.
    pub pvalue: f64,
}

/// Results across outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Fitted outcomes, in request order.
    pub reports: Vec<EffectReport>,
    /// ATE summary table.
    pub summary: Vec<OutcomeSummaryRow>,
    /// Outcomes that could not be fitted.
    pub skipped: Vec<SkippedUnit>,
}

/// Estimate effects for each outcome column under the same treatment,
/// confounders and moderators.
///
/// Outcomes that fail with a skippable error are logged and listed in
/// [`BatchReport::skipped`]; fatal errors abort the batch.
pub fn analyze_outcomes(panel: &Panel, roles: &RoleSchema, outcomes: &[String], config: &AnalysisConfig) -> Result<BatchReport> {
    config.validate()?;
    with_thread_pool(config.threads, || {
        let mut reports = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for outcome in outcomes {
            if !panel.has_column(outcome) {
                log::warn!("outcome '{}' not in panel, skipping", outcome);
                skipped.push(SkippedUnit { unit: outcome.clone(), reason: Error::MissingColumn(outcome.clone()).to_string() });
                continue;
            }
            match estimate_effects(panel, &roles.with_outcome(outcome.as_str()), config) {
                Ok(run) => reports.push(run.report),
                Err(e) if e.is_skippable() => {
                    log::warn!("outcome '{}' skipped: {}", outcome, e);
                    skipped.push(SkippedUnit { unit: outcome.clone(), reason: e.to_string() });
                }
                Err(e) => return Err(e),
            }
        }
        let summary = reports
            .iter()
            .map(|r| OutcomeSummaryRow {
                outcome: r.outcome.clone(),
                n_obs: r.n_obs,
                ate: r.ate.ate,
                ci_lower: r.ate.ci_lower,
                ci_upper: r.ate.ci_upper,
                pvalue: r.ate.pvalue,
            })
            .collect();
        Ok(BatchReport { reports, summary, skipped })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticConfig, generate_panel};

    fn small_config() -> AnalysisConfig {
        let mut c = AnalysisConfig::default();
        c.nuisance = crate::nuisance::NuisanceConfig::linear();
        c.forest.n_trees = 100;
        c.forest.min_leaf_size = 10;
        c.bootstrap.n_bootstrap = 50;
        c.sensitivity.quick_trees = 50;
        c.sensitivity.jackknife_trees = 50;
        c.attribution.max_rows = 30;
        c.attribution.n_permutations = 4;
        c
    }

    #[test]
    fn degenerate_treatment_is_skippable() {
        let data = generate_panel(&SyntheticConfig { n_clusters: 4, n_periods: 60, ..Default::default() }).unwrap();
        let mut panel = data.panel.clone();
        panel.insert_column("all_treated", vec![1.0; panel.n_rows()]).unwrap();
        let roles = data.roles.with_treatment("all_treated");
        let err = estimate_effects(&panel, &roles, &small_config()).unwrap_err();
        assert!(matches!(err, Error::DegenerateTreatment { .. }));
        assert!(err.is_skippable());
    }

    #[test]
    fn batch_skips_missing_and_small_outcomes() {
        let data = generate_panel(&SyntheticConfig { n_clusters: 4, n_periods: 100, ..Default::default() }).unwrap();
        let mut panel = data.panel.clone();
        let sparse: Vec<f64> = (0..panel.n_rows()).map(|i| if i < 20 { 1.0 } else { f64::NAN }).collect();
        panel.insert_column("rare_outcome", sparse).unwrap();
        let outcomes = vec![data.roles.outcome.clone(), "rare_outcome".to_string(), "absent".to_string()];
        let batch = analyze_outcomes(&panel, &data.roles, &outcomes, &small_config()).unwrap();
        assert_eq!(batch.reports.len(), 1);
        assert_eq!(batch.summary[0].outcome, data.roles.outcome);
        let skipped: Vec<&str> = batch.skipped.iter().map(|s| s.unit.as_str()).collect();
        assert_eq!(skipped, vec!["rare_outcome", "absent"]);
    }

    #[test]
    fn policy_counts_rows_without_oob_estimates() {
        let data = generate_panel(&SyntheticConfig { n_clusters: 3, n_periods: 100, ..Default::default() }).unwrap();
        let mut config = small_config();
        // So few trees that some rows are in-bag everywhere.
        config.forest.n_trees = 10;
        let report =
            run_analysis(&data.panel, &data.roles, &config, Consumers { policy: true, sensitivity: false }).unwrap();
        let unscored = report.effects.cate.cates().iter().filter(|c| !c.is_finite()).count();
        let policy = report.policy.unwrap();
        assert_eq!(policy.summary.unscored_rows, unscored);
        assert_eq!(policy.summary.n_obs, report.effects.n_obs);
        assert!(policy.summary.prevented.is_finite());
        let stratified: usize = policy.by_vulnerability.iter().map(|s| s.n_obs).sum();
        assert_eq!(stratified, report.effects.n_obs - unscored);
    }

    #[test]
    fn missing_treatment_column_is_fatal() {
        let data = generate_panel(&SyntheticConfig { n_clusters: 2, n_periods: 100, ..Default::default() }).unwrap();
        let roles = data.roles.with_treatment("not_there");
        let err = run_analysis(&data.panel, &roles, &small_config(), Consumers::default()).unwrap_err();
        assert!(matches!(err, Error::MissingColumn(_)));
        assert!(!err.is_skippable());
    }
}
