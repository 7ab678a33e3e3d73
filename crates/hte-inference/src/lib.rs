//! # hte-inference
//!
//! Heterogeneous treatment effect estimation on clustered panels.
//!
//! This crate provides:
//! - the matrix builder that projects a [`hte_core::Panel`] into aligned arrays,
//! - cross-fitted nuisance models (ridge, logistic, gradient boosting),
//! - an honest causal forest with little-bags variance estimates,
//! - ATE / CATE inference, best linear projection and classification analysis,
//! - a linear DML comparison, a seeded bootstrap engine,
//! - the sensitivity suite (placebo, threshold sweep, cluster jackknife, OVB),
//! - the policy counterfactual engine.
//!
//! ## Architecture
//!
//! Stages run strictly in order (matrices → cross-fit → forest → inference)
//! and every consumer reads the immutable outputs of the stage before it.
//! Randomness is threaded through explicit seeds, so any run is reproducible
//! regardless of the Rayon thread count.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Resampling engine: percentile and BCa intervals.
pub mod attribution;
pub mod bootstrap;
/// Run-level configuration.
pub mod config;
/// K-fold cross-fitting of the nuisance models.
pub mod crossfit;
/// Linear double machine learning comparison.
pub mod dml;
/// Honest causal forest.
pub mod forest;
/// Best linear projection and classification analysis.
pub mod heterogeneity;
/// ATE / CATE inference and doubly robust scores.
pub mod inference;
/// Panel to estimation matrices.
pub mod matrix;
/// Outcome and propensity learners.
pub mod nuisance;
/// Staged pipeline and multi-outcome batch.
pub mod pipeline;
/// Policy counterfactuals.
pub mod policy;
/// Robustness checks.
pub mod sensitivity;
/// Normal-theory helpers and cluster-robust OLS.
pub mod stats;
/// Seeded synthetic panels.
pub mod synthetic;

pub use attribution::{AttributionConfig, RowAttribution, ShapleyValues, shapley_values};
pub use bootstrap::{BootstrapCiMethod, BootstrapConfig, PreventedFractionBootstrap, prevented_fraction_bootstrap};
pub use config::AnalysisConfig;
pub use crossfit::{CrossFitConfig, CrossFitResult, FoldDiagnostics, cross_fit};
pub use dml::{LinearDmlResult, linear_dml};
pub use forest::{CatePrediction, CausalForest, ForestConfig};
pub use heterogeneity::{BlpTable, ClanTable, CoefficientRow, best_linear_projection, classification_analysis};
pub use inference::{CateTable, InferenceConfig, estimate_ate};
pub use matrix::{EstimationMatrices, build_matrices};
pub use nuisance::{LearnerSpec, NuisanceConfig};
pub use pipeline::{
    AnalysisReport, BatchReport, Consumers, EffectReport, EffectRun, SkippedUnit, analyze_outcomes,
    estimate_effects, fit_effect, run_analysis,
};
pub use policy::{PolicyConfig, PolicyReport, policy_report};
pub use sensitivity::{SensitivityConfig, SensitivityReport, SensitivityResult, run_suite};
pub use synthetic::{SyntheticConfig, SyntheticPanel, generate_panel};
