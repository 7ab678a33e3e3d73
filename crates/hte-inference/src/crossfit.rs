//! Cross-fitting orchestrator.
//!
//! Rows are shuffled with a seeded RNG and dealt into `K` folds. For each fold
//! the outcome and treatment learners are trained on the complement and used
//! to score the held-out rows, so every residual comes from models that never
//! saw that row. Folds are fitted in parallel; results are assembled in fold
//! order.

use hte_core::{ConstantModel, Error, FeatureMatrix, FittedModel, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::nuisance::NuisanceConfig;

/// Cross-fitting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossFitConfig {
    /// Number of folds `K`.
    pub n_folds: usize,
    /// Treated/control count in a training complement below which a warning is
    /// logged.
    pub min_class_count: usize,
    /// Feed moderators to the nuisance models alongside confounders.
    pub include_moderators: bool,
}

impl Default for CrossFitConfig {
    fn default() -> Self {
        Self { n_folds: 5, min_class_count: 5, include_moderators: true }
    }
}

impl CrossFitConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.n_folds < 2 {
            return Err(Error::Validation(format!("n_folds must be >= 2, got {}", self.n_folds)));
        }
        Ok(())
    }
}

/// What happened while fitting one fold.
#[derive(Debug, Clone, Serialize)]
pub struct FoldDiagnostics {
    /// Fold index.
    pub fold: usize,
    /// Rows in the training complement.
    pub n_train: usize,
    /// Held-out rows.
    pub n_test: usize,
    /// Treated rows in the training complement.
    pub n_treated_train: usize,
    /// Control rows in the training complement.
    pub n_control_train: usize,
    /// Whether the treatment model produced a constant probability.
    pub treatment_model_degenerate: bool,
}

/// Out-of-fold nuisance predictions and residuals.
#[derive(Debug, Clone, Serialize)]
pub struct CrossFitResult {
    /// Fold of each row.
    pub folds: Vec<usize>,
    /// Out-of-fold `E[Y | W]`.
    pub y_hat: Vec<f64>,
    /// Out-of-fold `P(T = 1 | W)`.
    pub t_hat: Vec<f64>,
    /// `Y - y_hat`.
    pub y_residual: Vec<f64>,
    /// `T - t_hat`.
    pub t_residual: Vec<f64>,
    /// Per-fold diagnostics, in fold order.
    pub diagnostics: Vec<FoldDiagnostics>,
}

impl CrossFitResult {
    /// Whether any fold's treatment model degenerated.
    pub fn any_degenerate(&self) -> bool {
        self.diagnostics.iter().any(|d| d.treatment_model_degenerate)
    }
}

/// Deterministic fold assignment: seeded shuffle, then position modulo `k`.
///
/// Every index lands in exactly one fold and fold sizes differ by at most one.
pub fn assign_folds(n: usize, k: usize, seed: u64) -> Result<Vec<usize>> {
    if k < 2 {
        return Err(Error::Validation(format!("n_folds must be >= 2, got {k}")));
    }
    if n < k {
        return Err(Error::InsufficientData { rows: n, minimum: k });
    }
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    let mut folds = vec![0usize; n];
    for (pos, &i) in order.iter().enumerate() {
        folds[i] = pos % k;
    }
    Ok(folds)
}

struct FoldFit {
    test_rows: Vec<usize>,
    y_pred: Vec<f64>,
    t_pred: Vec<f64>,
    diagnostics: FoldDiagnostics,
}

/// Cross-fit outcome and treatment models on `features`.
///
/// Fold `k` uses seeds `seed + 2k` (outcome) and `seed + 2k + 1` (treatment).
pub fn cross_fit(
    features: &FeatureMatrix,
    y: &[f64],
    t: &[f64],
    nuisance: &NuisanceConfig,
    config: &CrossFitConfig,
    seed: u64,
) -> Result<CrossFitResult> {
    let n = features.n_rows();
    if y.len() != n || t.len() != n {
        return Err(Error::Validation(format!(
            "cross_fit: features have {} rows, y {}, t {}",
            n,
            y.len(),
            t.len()
        )));
    }
    let folds = assign_folds(n, config.n_folds, seed)?;
    let outcome_learner = nuisance.outcome.regressor()?;
    let treatment_learner = nuisance.treatment.classifier()?;

    let fits: Vec<Result<FoldFit>> = (0..config.n_folds)
        .into_par_iter()
        .map(|k| {
            let train: Vec<usize> = (0..n).filter(|&i| folds[i] != k).collect();
            let test: Vec<usize> = (0..n).filter(|&i| folds[i] == k).collect();
            let x_train = features.select_rows(&train);
            let x_test = features.select_rows(&test);
            let y_train: Vec<f64> = train.iter().map(|&i| y[i]).collect();
            let t_train: Vec<f64> = train.iter().map(|&i| t[i]).collect();

            let n_treated = t_train.iter().filter(|&&v| v == 1.0).count();
            let n_control = t_train.len() - n_treated;
            if n_treated < config.min_class_count || n_control < config.min_class_count {
                log::warn!(
                    "cross-fit fold {}: training complement has {} treated / {} control rows (min {})",
                    k,
                    n_treated,
                    n_control,
                    config.min_class_count
                );
            }

            let k64 = k as u64;
            let outcome_model = outcome_learner.fit(&x_train, &y_train, seed.wrapping_add(2 * k64))?;
            let treatment_model: Box<dyn FittedModel> = if n_treated == 0 || n_control == 0 {
                Box::new(ConstantModel(if n_treated == 0 { 0.0 } else { 1.0 }))
            } else {
                treatment_learner.fit(&x_train, &t_train, seed.wrapping_add(2 * k64 + 1))?
            };

            let y_pred = outcome_model.predict(&x_test);
            let t_pred: Vec<f64> = treatment_model.predict(&x_test).into_iter().map(|p| p.clamp(0.0, 1.0)).collect();

            let degenerate = is_constant(&t_pred);
            if degenerate {
                log::warn!(
                    "cross-fit fold {}: treatment model '{}' predicts a constant probability {:.4}",
                    k,
                    treatment_learner.name(),
                    t_pred.first().copied().unwrap_or(f64::NAN)
                );
            }

            Ok(FoldFit {
                diagnostics: FoldDiagnostics {
                    fold: k,
                    n_train: train.len(),
                    n_test: test.len(),
                    n_treated_train: n_treated,
                    n_control_train: n_control,
                    treatment_model_degenerate: degenerate,
                },
                test_rows: test,
                y_pred,
                t_pred,
            })
        })
        .collect();

    let mut y_hat = vec![f64::NAN; n];
    let mut t_hat = vec![f64::NAN; n];
    let mut diagnostics = Vec::with_capacity(config.n_folds);
    for fit in fits {
        let fit = fit?;
        for (pos, &i) in fit.test_rows.iter().enumerate() {
            y_hat[i] = fit.y_pred[pos];
            t_hat[i] = fit.t_pred[pos];
        }
        diagnostics.push(fit.diagnostics);
    }
    if y_hat.iter().chain(&t_hat).any(|v| !v.is_finite()) {
        return Err(Error::Computation("cross-fit produced non-finite nuisance predictions".into()));
    }

    let y_residual = y.iter().zip(&y_hat).map(|(a, b)| a - b).collect();
    let t_residual = t.iter().zip(&t_hat).map(|(a, b)| a - b).collect();
    log::debug!("cross-fit: {} rows, {} folds", n, config.n_folds);

    Ok(CrossFitResult { folds, y_hat, t_hat, y_residual, t_residual, diagnostics })
}

fn is_constant(v: &[f64]) -> bool {
    match v.first() {
        Some(&first) => v.len() > 1 && v.iter().all(|&p| (p - first).abs() < 1e-12),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nuisance::LearnerSpec;
    use rand::Rng;

    fn data(n: usize, seed: u64) -> (FeatureMatrix, Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows: Vec<Vec<f64>> = (0..n).map(|_| vec![rng.random::<f64>(), rng.random::<f64>()]).collect();
        let t: Vec<f64> = rows.iter().map(|r| if rng.random::<f64>() < 0.3 + 0.4 * r[0] { 1.0 } else { 0.0 }).collect();
        let y: Vec<f64> = rows.iter().zip(&t).map(|(r, &ti)| 1.0 + 2.0 * r[1] + ti + rng.random::<f64>()).collect();
        (FeatureMatrix::from_rows(&rows).unwrap(), y, t)
    }

    #[test]
    fn every_row_in_exactly_one_fold() {
        let folds = assign_folds(103, 5, 42).unwrap();
        let mut counts = [0usize; 5];
        for &f in &folds {
            counts[f] += 1;
        }
        assert_eq!(counts.iter().sum::<usize>(), 103);
        assert!(counts.iter().all(|&c| c == 20 || c == 21));
        assert_eq!(folds, assign_folds(103, 5, 42).unwrap());
        assert!(assign_folds(3, 5, 42).is_err());
    }

    #[test]
    fn residuals_cover_every_row() {
        let (x, y, t) = data(300, 1);
        let r = cross_fit(&x, &y, &t, &NuisanceConfig::default(), &CrossFitConfig::default(), 42).unwrap();
        assert_eq!(r.y_residual.len(), 300);
        assert!(r.t_hat.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(r.diagnostics.len(), 5);
        assert_eq!(r.diagnostics.iter().map(|d| d.n_test).sum::<usize>(), 300);
        assert!(!r.any_degenerate());
    }

    #[test]
    fn prediction_never_uses_own_record() {
        let (x, y, t) = data(250, 2);
        let cfg = CrossFitConfig::default();
        let nuisance = NuisanceConfig { outcome: LearnerSpec::ridge(), treatment: LearnerSpec::logistic() };
        let base = cross_fit(&x, &y, &t, &nuisance, &cfg, 42).unwrap();

        // Corrupt one row: predictions for every row in its fold must be unchanged.
        let victim = 17;
        let mut y2 = y.clone();
        y2[victim] += 1e6;
        let mut t2 = t.clone();
        t2[victim] = 1.0 - t2[victim];
        let perturbed = cross_fit(&x, &y2, &t2, &nuisance, &cfg, 42).unwrap();

        let fold = base.folds[victim];
        for i in (0..250).filter(|&i| base.folds[i] == fold) {
            assert_eq!(base.y_hat[i].to_bits(), perturbed.y_hat[i].to_bits(), "row {i}");
            assert_eq!(base.t_hat[i].to_bits(), perturbed.t_hat[i].to_bits(), "row {i}");
        }
        let other = (0..250).find(|&i| base.folds[i] != fold).unwrap();
        assert_ne!(base.y_hat[other], perturbed.y_hat[other]);
    }

    #[test]
    fn all_treated_complement_is_flagged() {
        let (x, y, _) = data(60, 3);
        let t = vec![1.0; 60];
        let r = cross_fit(&x, &y, &t, &NuisanceConfig::default(), &CrossFitConfig::default(), 0).unwrap();
        assert!(r.any_degenerate());
        assert!(r.t_residual.iter().all(|&v| v == 0.0));
    }
}
