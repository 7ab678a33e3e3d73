//! Run-level configuration aggregating every stage's settings.

use hte_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::attribution::AttributionConfig;
use crate::bootstrap::BootstrapConfig;
use crate::crossfit::CrossFitConfig;
use crate::forest::ForestConfig;
use crate::inference::InferenceConfig;
use crate::matrix::DEFAULT_MIN_ROWS;
use crate::nuisance::NuisanceConfig;
use crate::policy::PolicyConfig;
use crate::sensitivity::SensitivityConfig;

/// Settings for one analysis run. Every section falls back to its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Root seed; every stage derives its own seed from it.
    pub seed: u64,
    /// Rows below which a unit of work is skipped.
    pub min_rows: usize,
    /// Worker threads (0 = Rayon default).
    pub threads: usize,
    /// Raw exposure column behind the binary treatment.
    pub exposure_column: Option<String>,
    /// Cross-fitting.
    pub cross_fit: CrossFitConfig,
    /// Nuisance learners.
    pub nuisance: NuisanceConfig,
    /// Causal forest.
    pub forest: ForestConfig,
    /// Interval construction.
    pub inference: InferenceConfig,
    /// Bootstrap engine.
    pub bootstrap: BootstrapConfig,
    /// Sensitivity suite.
    pub sensitivity: SensitivityConfig,
    /// Policy engine.
    pub policy: PolicyConfig,
    /// Shapley attribution of the CATE.
    pub attribution: AttributionConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            min_rows: DEFAULT_MIN_ROWS,
            threads: 0,
            exposure_column: Some("pm25".to_string()),
            cross_fit: CrossFitConfig::default(),
            nuisance: NuisanceConfig::default(),
            forest: ForestConfig::default(),
            inference: InferenceConfig::default(),
            bootstrap: BootstrapConfig::default(),
            sensitivity: SensitivityConfig::default(),
            policy: PolicyConfig::default(),
            attribution: AttributionConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        if self.min_rows == 0 {
            return Err(Error::Validation("min_rows must be >= 1".into()));
        }
        self.cross_fit.validate()?;
        self.nuisance.validate()?;
        self.forest.validate()?;
        self.inference.validate()?;
        self.bootstrap.validate()?;
        self.sensitivity.validate()?;
        self.attribution.validate()?;
        Ok(())
    }

    /// Seed for stage `stage` of the run, kept apart from the others.
    pub(crate) fn stage_seed(&self, stage: u64) -> u64 {
        self.seed.wrapping_add(stage.wrapping_mul(1_000_003))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = AnalysisConfig::default();
        assert_eq!(c.seed, 42);
        assert_eq!(c.min_rows, 100);
        assert_eq!(c.cross_fit.n_folds, 5);
        assert_eq!(c.forest.n_trees, 2000);
        assert_eq!(c.forest.min_leaf_size, 20);
        assert_eq!(c.bootstrap.n_bootstrap, 1000);
        assert_eq!(c.sensitivity.placebo_lead, 7);
        assert_eq!(c.policy.scenario_thresholds, vec![15.0, 25.0, 35.0, 50.0]);
        assert!(c.attribution.enabled);
        assert_eq!((c.attribution.max_rows, c.attribution.n_background), (1000, 50));
        c.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: AnalysisConfig =
            serde_json::from_str(r#"{"seed": 7, "forest": {"n_trees": 100}}"#).unwrap();
        assert_eq!(c.seed, 7);
        assert_eq!(c.forest.n_trees, 100);
        assert_eq!(c.forest.min_leaf_size, 20);
        assert_eq!(c.inference, InferenceConfig::default());
    }

    #[test]
    fn invalid_section_is_rejected() {
        let mut c = AnalysisConfig::default();
        c.cross_fit.n_folds = 1;
        assert!(c.validate().is_err());
        let mut c = AnalysisConfig::default();
        c.attribution.n_background = 0;
        assert!(c.validate().is_err());
    }
}
