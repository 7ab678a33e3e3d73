//! Nuisance learners for outcome and treatment.
//!
//! A [`LearnerSpec`] is the serializable description of a first-stage model;
//! [`LearnerSpec::regressor`] and [`LearnerSpec::classifier`] turn it into a
//! boxed [`Learner`] for the outcome and treatment tasks respectively.

use hte_core::{Error, Learner, Result};
use serde::{Deserialize, Serialize};

/// Gradient-boosted regression trees.
pub mod boosting;
/// Ridge and logistic regression.
pub mod linear;

pub use boosting::{BoostingLoss, GradientBoosting};
pub use linear::{LogisticRegression, RidgeRegression};

/// Serializable first-stage model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearnerSpec {
    /// Closed-form ridge on standardized features with an unpenalized intercept.
    Ridge {
        /// Ridge penalty on standardized coefficients.
        #[serde(default = "default_ridge_lambda")]
        lambda: f64,
    },
    /// Ridge-stabilized logistic regression fitted by IRLS.
    Logistic {
        /// Ridge penalty on standardized coefficients.
        #[serde(default = "default_logistic_lambda")]
        lambda: f64,
        /// Maximum Newton iterations.
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        /// Convergence tolerance on the coefficient step.
        #[serde(default = "default_tol")]
        tol: f64,
    },
    /// Stochastic gradient boosting with depth-limited regression trees.
    GradientBoosting {
        /// Number of boosting rounds.
        #[serde(default = "default_n_estimators")]
        n_estimators: usize,
        /// Maximum tree depth.
        #[serde(default = "default_max_depth")]
        max_depth: usize,
        /// Shrinkage.
        #[serde(default = "default_learning_rate")]
        learning_rate: f64,
        /// Row subsampling fraction per round.
        #[serde(default = "default_subsample")]
        subsample: f64,
        /// Minimum rows per leaf.
        #[serde(default = "default_gb_min_leaf")]
        min_leaf_size: usize,
    },
}

fn default_ridge_lambda() -> f64 {
    1.0
}
fn default_logistic_lambda() -> f64 {
    1e-4
}
fn default_max_iter() -> usize {
    100
}
fn default_tol() -> f64 {
    1e-8
}
fn default_n_estimators() -> usize {
    200
}
fn default_max_depth() -> usize {
    5
}
fn default_learning_rate() -> f64 {
    0.05
}
fn default_subsample() -> f64 {
    0.8
}
fn default_gb_min_leaf() -> usize {
    1
}

impl LearnerSpec {
    /// Default ridge regressor.
    pub fn ridge() -> Self {
        LearnerSpec::Ridge { lambda: default_ridge_lambda() }
    }

    /// Default logistic classifier.
    pub fn logistic() -> Self {
        LearnerSpec::Logistic {
            lambda: default_logistic_lambda(),
            max_iter: default_max_iter(),
            tol: default_tol(),
        }
    }

    /// Boosting with 200 rounds of depth-5 trees, rate 0.05, subsample 0.8.
    pub fn gradient_boosting() -> Self {
        LearnerSpec::GradientBoosting {
            n_estimators: default_n_estimators(),
            max_depth: default_max_depth(),
            learning_rate: default_learning_rate(),
            subsample: default_subsample(),
            min_leaf_size: default_gb_min_leaf(),
        }
    }

    /// Learner for a continuous target.
    pub fn regressor(&self) -> Result<Box<dyn Learner>> {
        self.validate()?;
        match *self {
            LearnerSpec::Ridge { lambda } => Ok(Box::new(RidgeRegression::new(lambda))),
            LearnerSpec::Logistic { .. } => Err(Error::Validation(
                "logistic learner cannot model a continuous outcome".into(),
            )),
            LearnerSpec::GradientBoosting { n_estimators, max_depth, learning_rate, subsample, min_leaf_size } => {
                Ok(Box::new(GradientBoosting {
                    n_estimators,
                    max_depth,
                    learning_rate,
                    subsample,
                    min_leaf_size,
                    loss: BoostingLoss::Squared,
                }))
            }
        }
    }

    /// Learner for a binary target, predicting `P(target = 1)`.
    ///
    /// Ridge acts as a linear probability model; its predictions are clamped
    /// to `[0, 1]`.
    pub fn classifier(&self) -> Result<Box<dyn Learner>> {
        self.validate()?;
        match *self {
            LearnerSpec::Ridge { lambda } => Ok(Box::new(RidgeRegression::new(lambda).clamped(0.0, 1.0))),
            LearnerSpec::Logistic { lambda, max_iter, tol } => {
                Ok(Box::new(LogisticRegression { lambda, max_iter, tol }))
            }
            LearnerSpec::GradientBoosting { n_estimators, max_depth, learning_rate, subsample, min_leaf_size } => {
                Ok(Box::new(GradientBoosting {
                    n_estimators,
                    max_depth,
                    learning_rate,
                    subsample,
                    min_leaf_size,
                    loss: BoostingLoss::Logistic,
                }))
            }
        }
    }

    /// Check hyperparameter ranges.
    pub fn validate(&self) -> Result<()> {
        match *self {
            LearnerSpec::Ridge { lambda } | LearnerSpec::Logistic { lambda, .. } if !(lambda >= 0.0) => {
                Err(Error::Validation(format!("lambda must be >= 0, got {lambda}")))
            }
            LearnerSpec::Logistic { max_iter: 0, .. } => Err(Error::Validation("max_iter must be >= 1".into())),
            LearnerSpec::GradientBoosting { n_estimators, learning_rate, subsample, .. } => {
                if n_estimators == 0 {
                    return Err(Error::Validation("n_estimators must be >= 1".into()));
                }
                if !(learning_rate > 0.0 && learning_rate <= 1.0) {
                    return Err(Error::Validation(format!("learning_rate must be in (0,1], got {learning_rate}")));
                }
                if !(subsample > 0.0 && subsample <= 1.0) {
                    return Err(Error::Validation(format!("subsample must be in (0,1], got {subsample}")));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Outcome and treatment learner pair used by cross-fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NuisanceConfig {
    /// Model for `E[Y | W]`.
    pub outcome: LearnerSpec,
    /// Model for `P(T = 1 | W)`.
    pub treatment: LearnerSpec,
}

impl Default for NuisanceConfig {
    /// Gradient boosting for both tasks.
    fn default() -> Self {
        Self { outcome: LearnerSpec::gradient_boosting(), treatment: LearnerSpec::gradient_boosting() }
    }
}

impl NuisanceConfig {
    /// Ridge outcome model and logistic treatment model. Much cheaper than the
    /// default; suited to large sweeps and quick refits.
    pub fn linear() -> Self {
        Self { outcome: LearnerSpec::ridge(), treatment: LearnerSpec::logistic() }
    }

    /// Check both learners fit their role.
    pub fn validate(&self) -> Result<()> {
        self.outcome.regressor()?;
        self.treatment.classifier()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_roundtrips_through_json_with_defaults() {
        let spec: LearnerSpec = serde_json::from_str(r#"{"kind":"gradient_boosting","n_estimators":50}"#).unwrap();
        match spec {
            LearnerSpec::GradientBoosting { n_estimators, max_depth, learning_rate, .. } => {
                assert_eq!(n_estimators, 50);
                assert_eq!(max_depth, 5);
                assert!((learning_rate - 0.05).abs() < 1e-15);
            }
            other => panic!("unexpected spec {other:?}"),
        }
        let cfg: NuisanceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, NuisanceConfig::default());
    }

    #[test]
    fn logistic_is_not_a_regressor() {
        assert!(LearnerSpec::logistic().regressor().is_err());
        assert!(LearnerSpec::logistic().classifier().is_ok());
        assert!(LearnerSpec::Ridge { lambda: -1.0 }.regressor().is_err());
        assert_eq!(LearnerSpec::gradient_boosting().classifier().unwrap().name(), "gradient_boosting");
    }

    #[test]
    fn default_learners_are_boosted() {
        let cfg = NuisanceConfig::default();
        let expected = LearnerSpec::GradientBoosting {
            n_estimators: 200,
            max_depth: 5,
            learning_rate: 0.05,
            subsample: 0.8,
            min_leaf_size: 1,
        };
        assert_eq!(cfg.outcome, expected);
        assert_eq!(cfg.treatment, expected);
        assert_eq!(cfg.outcome.regressor().unwrap().name(), "gradient_boosting");
        cfg.validate().unwrap();

        let linear = NuisanceConfig::linear();
        assert_eq!(linear.outcome.regressor().unwrap().name(), "ridge");
        assert_eq!(linear.treatment.classifier().unwrap().name(), "logistic");
    }
}
