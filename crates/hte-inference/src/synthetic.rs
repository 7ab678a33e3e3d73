//! Seeded synthetic panels with a known treatment effect.
//!
//! One row per (cluster, period). Column layout:
//!
//! - `w0..` confounders, standard normal, shifting the outcome;
//! - `x0..` moderators, standard normal, driving the effect when it is linear;
//! - `pm25` exposure series (optionally confounded through `w0`);
//! - `treated` binary treatment, exposure above a limit or Bernoulli;
//! - `outcome` baseline + confounders + cluster level + `τ(x)·T` + noise;
//! - `total_cost` per-row cost proportional to the outcome.

use hte_core::{Error, Panel, Result, RoleSchema};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Outcome column written by the generator.
pub const OUTCOME: &str = "outcome";
/// Treatment column.
pub const TREATMENT: &str = "treated";
/// Exposure column.
pub const EXPOSURE: &str = "pm25";
/// Cost column.
pub const COST: &str = "total_cost";

/// How treatment is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreatmentAssignment {
    /// `treated = pm25 > limit`.
    Exposure {
        /// Exceedance limit.
        limit: f64,
    },
    /// Independent coin flips, unrelated to every covariate.
    Bernoulli {
        /// Treatment probability.
        prob: f64,
    },
}

/// Shape of the true effect `τ(x)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectShape {
    /// `τ(x) = value`.
    Constant {
        /// Effect size.
        value: f64,
    },
    /// `τ(x) = intercept + Σ_j slopes[j]·x_j`.
    Linear {
        /// Effect at `x = 0`.
        intercept: f64,
        /// One slope per leading moderator.
        slopes: Vec<f64>,
    },
}

impl EffectShape {
    fn at(&self, x: &[f64]) -> f64 {
        match self {
            EffectShape::Constant { value } => *value,
            EffectShape::Linear { intercept, slopes } => {
                intercept + slopes.iter().zip(x).map(|(b, v)| b * v).sum::<f64>()
            }
        }
    }
}

/// Generator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of clusters.
    pub n_clusters: usize,
    /// Periods per cluster.
    pub n_periods: usize,
    /// Confounder columns.
    pub n_confounders: usize,
    /// Moderator columns.
    pub n_moderators: usize,
    /// Mean of the exposure series.
    pub exposure_mean: f64,
    /// Standard deviation of the exposure series.
    pub exposure_sd: f64,
    /// Loading of `w0` on the exposure.
    pub confounding: f64,
    /// Treatment assignment.
    pub treatment: TreatmentAssignment,
    /// True effect.
    pub effect: EffectShape,
    /// Outcome level without treatment.
    pub baseline: f64,
    /// Outcome noise standard deviation.
    pub noise_sd: f64,
    /// Standard deviation of the per-cluster outcome level.
    pub cluster_sd: f64,
    /// Cost per unit of outcome.
    pub cost_per_event: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            n_clusters: 10,
            n_periods: 200,
            n_confounders: 2,
            n_moderators: 2,
            exposure_mean: 20.0,
            exposure_sd: 10.0,
            confounding: 0.0,
            treatment: TreatmentAssignment::Exposure { limit: 15.0 },
            effect: EffectShape::Constant { value: 2.0 },
            baseline: 10.0,
            noise_sd: 1.0,
            cluster_sd: 0.5,
            cost_per_event: 250.0,
            seed: 42,
        }
    }
}

impl SyntheticConfig {
    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.n_clusters == 0 || self.n_periods == 0 {
            return Err(Error::Validation("n_clusters and n_periods must be >= 1".into()));
        }
        if !(self.noise_sd >= 0.0 && self.cluster_sd >= 0.0 && self.exposure_sd >= 0.0) {
            return Err(Error::Validation("standard deviations must be >= 0".into()));
        }
        if let TreatmentAssignment::Bernoulli { prob } = self.treatment
            && !(prob > 0.0 && prob < 1.0)
        {
            return Err(Error::Validation(format!("treatment probability must be in (0,1), got {prob}")));
        }
        if let EffectShape::Linear { slopes, .. } = &self.effect
            && slopes.len() > self.n_moderators
        {
            return Err(Error::Validation(format!(
                "{} effect slopes for {} moderators",
                slopes.len(),
                self.n_moderators
            )));
        }
        Ok(())
    }
}

/// A generated panel with its ground truth.
#[derive(Debug, Clone)]
pub struct SyntheticPanel {
    /// The data.
    pub panel: Panel,
    /// Roles matching the generated columns.
    pub roles: RoleSchema,
    /// True `τ(x)` per row.
    pub true_cate: Vec<f64>,
    /// Mean of `true_cate`.
    pub true_ate: f64,
}

/// Generate a panel from `config`.
pub fn generate_panel(config: &SyntheticConfig) -> Result<SyntheticPanel> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let n = config.n_clusters * config.n_periods;
    let normal = |rng: &mut StdRng| -> f64 { rng.sample(StandardNormal) };

    let cluster_level: Vec<f64> = (0..config.n_clusters).map(|_| config.cluster_sd * normal(&mut rng)).collect();

    let mut clusters = Vec::with_capacity(n);
    let mut periods = Vec::with_capacity(n);
    let mut w = vec![Vec::with_capacity(n); config.n_confounders];
    let mut x = vec![Vec::with_capacity(n); config.n_moderators];
    let mut exposure = Vec::with_capacity(n);
    let mut treated = Vec::with_capacity(n);
    let mut outcome = Vec::with_capacity(n);
    let mut cost = Vec::with_capacity(n);
    let mut true_cate = Vec::with_capacity(n);

    let mut w_row = vec![0.0; config.n_confounders];
    let mut x_row = vec![0.0; config.n_moderators];
    for c in 0..config.n_clusters {
        for t in 0..config.n_periods {
            w_row.iter_mut().for_each(|v| *v = normal(&mut rng));
            x_row.iter_mut().for_each(|v| *v = normal(&mut rng));
            let w0 = w_row.first().copied().unwrap_or(0.0);
            let pm = (config.exposure_mean + config.exposure_sd * normal(&mut rng) + config.confounding * w0).max(0.0);
            let d = match config.treatment {
                TreatmentAssignment::Exposure { limit } => pm > limit,
                TreatmentAssignment::Bernoulli { prob } => rng.random::<f64>() < prob,
            };
            let d = if d { 1.0 } else { 0.0 };
            let tau = config.effect.at(&x_row);
            let confounded: f64 = w_row.iter().enumerate().map(|(j, v)| v / (j + 1) as f64).sum();
            let y = config.baseline + confounded + cluster_level[c] + tau * d + config.noise_sd * normal(&mut rng);

            clusters.push(format!("cluster_{c:02}"));
            periods.push(t as i64);
            for (col, v) in w.iter_mut().zip(&w_row) {
                col.push(*v);
            }
            for (col, v) in x.iter_mut().zip(&x_row) {
                col.push(*v);
            }
            exposure.push(pm);
            treated.push(d);
            outcome.push(y);
            cost.push(config.cost_per_event * y.max(0.0));
            true_cate.push(tau);
        }
    }

    let confounders: Vec<String> = (0..config.n_confounders).map(|j| format!("w{j}")).collect();
    let moderators: Vec<String> = (0..config.n_moderators).map(|j| format!("x{j}")).collect();

    let mut panel = Panel::new(clusters, periods)?
        .with_column(OUTCOME, outcome)?
        .with_column(TREATMENT, treated)?
        .with_column(EXPOSURE, exposure)?
        .with_column(COST, cost)?;
    for (name, col) in confounders.iter().zip(w) {
        panel.insert_column(name.as_str(), col)?;
    }
    for (name, col) in moderators.iter().zip(x) {
        panel.insert_column(name.as_str(), col)?;
    }

    let true_ate = true_cate.iter().sum::<f64>() / n as f64;
    log::debug!("synthetic panel: {} rows, {} clusters, true ATE {:.4}", n, config.n_clusters, true_ate);
    Ok(SyntheticPanel {
        panel,
        roles: RoleSchema {
            outcome: OUTCOME.to_string(),
            treatment: TREATMENT.to_string(),
            confounders,
            moderators,
        },
        true_cate,
        true_ate,
    })
}
