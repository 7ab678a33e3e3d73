//! Policy counterfactuals: outcomes prevented if exposure never exceeded the
//! reference limit.
//!
//! On every treated row the CATE is the excess outcome attributable to the
//! exceedance, so the prevented count under compliance is the sum of CATE over
//! treated rows. Every ratio returns 0 when its denominator is 0.
//!
//! Rows whose CATE is not finite (no out-of-bag trees) are unscored: they add
//! to outcome totals and treated counts but never to prevented counts, mean
//! CATEs or vulnerability strata.

use std::collections::BTreeMap;

use hte_core::{Error, Panel, Result};
use serde::{Deserialize, Serialize};

use crate::bootstrap::{BootstrapConfig, PreventedFractionBootstrap, prevented_fraction_bootstrap};
use crate::heterogeneity::{quartile_edges, quartile_of};
use crate::matrix::EstimationMatrices;

/// Vulnerability strata labels, ordered by CATE.
pub const VULNERABILITY_LABELS: [&str; 4] =
    ["Q1 (least vulnerable)", "Q2", "Q3", "Q4 (most vulnerable)"];

/// Policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Exposure limit whose exceedance defines treatment.
    pub reference_limit: f64,
    /// Limits evaluated as alternative compliance scenarios.
    pub scenario_thresholds: Vec<f64>,
    /// Per-row cost column used for the savings estimate, if present.
    pub cost_column: Option<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reference_limit: 15.0,
            scenario_thresholds: vec![15.0, 25.0, 35.0, 50.0],
            cost_column: Some("total_cost".to_string()),
        }
    }
}

#[inline]
fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 { 0.0 } else { num / den }
}

fn check_lengths(cate: &[f64], treated: &[f64], outcome: &[f64]) -> Result<()> {
    if treated.len() != cate.len() || outcome.len() != cate.len() {
        return Err(Error::Validation(format!(
            "policy inputs disagree: cate {}, treated {}, outcome {}",
            cate.len(),
            treated.len(),
            outcome.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Population-level prevented outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreventedSummary {
    /// `Σ_{treated} CATE`.
    pub prevented: f64,
    /// `Σ outcome`.
    pub total_outcome: f64,
    /// `prevented / total_outcome`.
    pub prevented_fraction: f64,
    /// Treated rows.
    pub treated_days: usize,
    /// Rows.
    pub n_obs: usize,
    /// Rows without a finite CATE.
    pub unscored_rows: usize,
}

/// Prevented count and fraction under compliance.
pub fn prevented_outcomes(cate: &[f64], treated: &[f64], outcome: &[f64]) -> Result<PreventedSummary> {
    check_lengths(cate, treated, outcome)?;
    let mut s = Stratum::default();
    for i in 0..cate.len() {
        s.add(cate[i], treated[i], outcome[i]);
    }
    Ok(PreventedSummary {
        prevented: s.prevented,
        total_outcome: s.total_outcome,
        prevented_fraction: ratio(s.prevented, s.total_outcome),
        treated_days: s.treated_days,
        n_obs: s.n_obs,
        unscored_rows: s.n_obs - s.n_scored,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct Stratum {
    n_obs: usize,
    n_scored: usize,
    total_outcome: f64,
    treated_days: usize,
    prevented: f64,
    cate_sum: f64,
}

impl Stratum {
    fn add(&mut self, cate: f64, treated: f64, outcome: f64) {
        self.n_obs += 1;
        self.total_outcome += outcome;
        if treated == 1.0 {
            self.treated_days += 1;
        }
        if cate.is_finite() {
            self.n_scored += 1;
            self.cate_sum += cate;
            if treated == 1.0 {
                self.prevented += cate;
            }
        }
    }

    fn mean_cate(&self) -> f64 {
        ratio(self.cate_sum, self.n_scored as f64)
    }

    fn prevented_pct(&self) -> f64 {
        100.0 * ratio(self.prevented, self.total_outcome)
    }
}

/// Prevented outcomes within one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterImpact {
    /// Cluster key.
    pub cluster: String,
    /// Rows.
    pub n_obs: usize,
    /// `Σ outcome`.
    pub total_outcome: f64,
    /// Treated rows.
    pub treated_days: usize,
    /// `Σ_{treated} CATE`.
    pub prevented: f64,
    /// Mean CATE over the scored rows of the cluster.
    pub mean_cate: f64,
    /// `100 · prevented / total_outcome`.
    pub prevented_pct: f64,
}

/// Per-cluster prevented outcomes, sorted by `prevented_pct` descending
/// (ties by cluster name).
pub fn impact_by_cluster(
    cate: &[f64],
    treated: &[f64],
    outcome: &[f64],
    clusters: &[&str],
) -> Result<Vec<ClusterImpact>> {
    check_lengths(cate, treated, outcome)?;
    if clusters.len() != cate.len() {
        return Err(Error::Validation(format!(
            "{} cluster keys for {} rows",
            clusters.len(),
            cate.len()
        )));
    }
    let mut by: BTreeMap<&str, Stratum> = BTreeMap::new();
    for i in 0..cate.len() {
        by.entry(clusters[i]).or_default().add(cate[i], treated[i], outcome[i]);
    }
    let mut rows: Vec<ClusterImpact> = by
        .into_iter()
        .map(|(cluster, s)| ClusterImpact {
            cluster: cluster.to_string(),
            n_obs: s.n_obs,
            total_outcome: s.total_outcome,
            treated_days: s.treated_days,
            prevented: s.prevented,
            mean_cate: s.mean_cate(),
            prevented_pct: s.prevented_pct(),
        })
        .collect();
    rows.sort_by(|a, b| b.prevented_pct.total_cmp(&a.prevented_pct).then_with(|| a.cluster.cmp(&b.cluster)));
    Ok(rows)
}

/// Prevented outcomes within one CATE quartile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityStratum {
    /// Quartile label.
    pub label: String,
    /// Rows.
    pub n_obs: usize,
    /// `Σ outcome`.
    pub total_outcome: f64,
    /// Treated rows.
    pub treated_days: usize,
    /// `Σ_{treated} CATE`.
    pub prevented: f64,
    /// Mean CATE.
    pub mean_cate: f64,
    /// `100 · prevented / total_outcome`.
    pub prevented_pct: f64,
}

/// Prevented outcomes by CATE quartile, least to most vulnerable.
///
/// Only rows with a finite CATE are stratified; quartile edges come from those
/// rows alone.
pub fn impact_by_vulnerability(cate: &[f64], treated: &[f64], outcome: &[f64]) -> Result<Vec<VulnerabilityStratum>> {
    check_lengths(cate, treated, outcome)?;
    let scored: Vec<usize> = (0..cate.len()).filter(|&i| cate[i].is_finite()).collect();
    if scored.is_empty() {
        return Err(Error::InsufficientData { rows: 0, minimum: 1 });
    }
    let finite: Vec<f64> = scored.iter().map(|&i| cate[i]).collect();
    let edges = quartile_edges(&finite);
    let mut strata = [Stratum::default(); 4];
    for &i in &scored {
        strata[quartile_of(cate[i], &edges)].add(cate[i], treated[i], outcome[i]);
    }
    Ok(strata
        .iter()
        .zip(VULNERABILITY_LABELS)
        .map(|(s, label)| VulnerabilityStratum {
            label: label.to_string(),
            n_obs: s.n_obs,
            total_outcome: s.total_outcome,
            treated_days: s.treated_days,
            prevented: s.prevented,
            mean_cate: s.mean_cate(),
            prevented_pct: s.prevented_pct(),
        })
        .collect())
}

/// Monetary value of prevented outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// `Σ cost`.
    pub total_cost: f64,
    /// `Σ outcome`.
    pub total_outcome: f64,
    /// `total_cost / total_outcome`.
    pub avg_cost_per_event: f64,
    /// Prevented count.
    pub prevented: f64,
    /// `prevented · avg_cost_per_event`.
    pub saved_cost: f64,
    /// `100 · saved_cost / total_cost`.
    pub saved_pct: f64,
}

/// Savings from `prevented` outcomes at the average recorded unit cost.
/// Missing costs are ignored.
pub fn cost_estimate(cost: &[f64], outcome: &[f64], prevented: f64) -> CostEstimate {
    let total_cost: f64 = cost.iter().filter(|c| c.is_finite()).sum();
    let total_outcome: f64 = outcome.iter().sum();
    let avg_cost_per_event = ratio(total_cost, total_outcome);
    let saved_cost = prevented * avg_cost_per_event;
    CostEstimate {
        total_cost,
        total_outcome,
        avg_cost_per_event,
        prevented,
        saved_cost,
        saved_pct: 100.0 * ratio(saved_cost, total_cost),
    }
}

/// Compliance at an alternative exposure limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdScenario {
    /// Exposure limit.
    pub threshold: f64,
    /// Rows with exposure above the limit.
    pub exceed_days: usize,
    /// `100 · exceed_days / rows`.
    pub exceed_pct: f64,
    /// `Σ CATE` over exceeding scored rows.
    pub prevented: f64,
    /// `100 · prevented / Σ outcome`.
    pub prevented_pct: f64,
}

/// Prevented outcomes if exposure were capped at each threshold.
pub fn threshold_scenarios(
    exposure: &[f64],
    cate: &[f64],
    outcome: &[f64],
    thresholds: &[f64],
) -> Result<Vec<ThresholdScenario>> {
    check_lengths(cate, exposure, outcome)?;
    let n = cate.len();
    let total_outcome: f64 = outcome.iter().sum();
    Ok(thresholds
        .iter()
        .map(|&threshold| {
            let (exceed_days, prevented) = exposure
                .iter()
                .zip(cate)
                .filter(|(e, _)| **e > threshold)
                .fold((0usize, 0.0), |(k, s), (_, c)| (k + 1, if c.is_finite() { s + c } else { s }));
            ThresholdScenario {
                threshold,
                exceed_days,
                exceed_pct: 100.0 * ratio(exceed_days as f64, n as f64),
                prevented,
                prevented_pct: 100.0 * ratio(prevented, total_outcome),
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Every policy table for one fitted outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyReport {
    /// Reference exposure limit.
    pub reference_limit: f64,
    /// Population totals.
    pub summary: PreventedSummary,
    /// Per-cluster rows.
    pub by_cluster: Vec<ClusterImpact>,
    /// Per-quartile rows.
    pub by_vulnerability: Vec<VulnerabilityStratum>,
    /// Savings, when a cost column is available.
    pub cost: Option<CostEstimate>,
    /// Prevented-fraction bootstrap, `None` if it could not be computed.
    pub bootstrap: Option<PreventedFractionBootstrap>,
    /// Alternative limits, empty without an exposure column.
    pub scenarios: Vec<ThresholdScenario>,
}

/// Build the policy tables for `cate` aligned with `matrices`.
///
/// `exposure_column` and the configured cost column are optional: absent
/// columns skip the scenarios and the cost estimate with a log entry.
pub fn policy_report(
    panel: &Panel,
    matrices: &EstimationMatrices,
    cate: &[f64],
    exposure_column: Option<&str>,
    config: &PolicyConfig,
    bootstrap: &BootstrapConfig,
    seed: u64,
) -> Result<PolicyReport> {
    let treated = &matrices.t;
    let outcome = &matrices.y;
    let summary = prevented_outcomes(cate, treated, outcome)?;
    log::info!(
        "prevented: {:.1} / {:.1} = {:.2}% of outcomes",
        summary.prevented,
        summary.total_outcome,
        100.0 * summary.prevented_fraction
    );
    if summary.unscored_rows > 0 {
        log::warn!("policy: {} rows have no finite CATE and are left out of prevented counts", summary.unscored_rows);
    }

    let clusters: Vec<&str> = (0..matrices.n_rows()).map(|i| matrices.cluster_of(i)).collect();
    let by_cluster = impact_by_cluster(cate, treated, outcome, &clusters)?;
    let by_vulnerability = impact_by_vulnerability(cate, treated, outcome)?;

    let cost = match config.cost_column.as_deref() {
        Some(name) if panel.has_column(name) => {
            let costs = matrices.aligned_column(panel, name)?;
            Some(cost_estimate(&costs, outcome, summary.prevented))
        }
        Some(name) => {
            log::info!("policy: cost column '{}' not in panel, skipping cost estimate", name);
            None
        }
        None => None,
    };

    let bootstrap = match prevented_fraction_bootstrap(cate, treated, outcome, bootstrap, seed) {
        Ok(b) => Some(b),
        Err(e) if e.is_skippable() => {
            log::warn!("policy: prevented-fraction bootstrap skipped: {}", e);
            None
        }
        Err(e) => return Err(e),
    };

    let scenarios = match exposure_column {
        Some(name) if panel.has_column(name) => {
            let exposure = matrices.aligned_column(panel, name)?;
            threshold_scenarios(&exposure, cate, outcome, &config.scenario_thresholds)?
        }
        Some(name) => {
            log::info!("policy: exposure column '{}' not in panel, skipping scenarios", name);
            Vec::new()
        }
        None => Vec::new(),
    };

    Ok(PolicyReport {
        reference_limit: config.reference_limit,
        summary,
        by_cluster,
        by_vulnerability,
        cost,
        bootstrap,
        scenarios,
    })
}
