//! Bootstrap engine and confidence interval utilities.
//!
//! This module provides:
//! - a seeded, Rayon-parallel resampling runner for arbitrary statistics,
//! - percentile intervals,
//! - BCa (bias-corrected and accelerated) intervals,
//! - reusable diagnostics (`z0`, `a`, adjusted alphas),
//! - the prevented-fraction bootstrap used by the policy engine.
//!
//! BCa references:
//! - Efron (1987), "Better Bootstrap Confidence Intervals"

use hte_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::stats::{check_conf_level, clip_prob, inv_norm_cdf, mean, norm_cdf, quantile_linear};

/// Bootstrap CI method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapCiMethod {
    /// Percentile interval from bootstrap quantiles.
    #[default]
    Percentile,
    /// Bias-corrected and accelerated interval (BCa).
    Bca,
}

/// Bootstrap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Nominal replicate count.
    pub n_bootstrap: usize,
    /// Two-sided confidence level.
    pub conf_level: f64,
    /// Interval construction.
    pub method: BootstrapCiMethod,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { n_bootstrap: 1000, conf_level: 0.95, method: BootstrapCiMethod::Percentile }
    }
}

impl BootstrapConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.n_bootstrap < 2 {
            return Err(Error::Validation(format!(
                "n_bootstrap must be >= 2, got {}",
                self.n_bootstrap
            )));
        }
        check_conf_level(self.conf_level)
    }
}

/// BCa diagnostics for observability and debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BcaDiagnostics {
    /// Bias-correction constant.
    pub z0: f64,
    /// Acceleration constant.
    pub acceleration: f64,
    /// Requested lower alpha (`(1-conf_level)/2`).
    pub alpha_low: f64,
    /// Requested upper alpha (`1 - (1-conf_level)/2`).
    pub alpha_high: f64,
    /// BCa-adjusted lower alpha.
    pub alpha_low_adj: f64,
    /// BCa-adjusted upper alpha.
    pub alpha_high_adj: f64,
    /// Number of bootstrap samples used.
    pub n_bootstrap: usize,
    /// Number of jackknife estimates used.
    pub n_jackknife: usize,
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Replicate statistics in replicate order, with degenerate draws removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapDistribution {
    /// Finite replicate values, ordered by replicate index.
    pub samples: Vec<f64>,
    /// Replicates requested.
    pub n_nominal: usize,
    /// Replicates kept.
    pub n_realized: usize,
}

/// Draw `n_bootstrap` resamples of `0..n` with replacement and evaluate
/// `statistic` on each.
///
/// Replicate `b` uses its own `StdRng` seeded with `seed + b`, so the result
/// is identical for any thread count. A replicate whose statistic is `None`
/// or non-finite is dropped and counted.
pub fn resample_statistic<F>(n: usize, n_bootstrap: usize, seed: u64, statistic: F) -> Result<BootstrapDistribution>
where
    F: Fn(&[usize]) -> Option<f64> + Sync,
{
    if n == 0 {
        return Err(Error::InsufficientData { rows: 0, minimum: 1 });
    }
    let draws: Vec<Option<f64>> = (0..n_bootstrap)
        .into_par_iter()
        .map(|b| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(b as u64));
            let idx: Vec<usize> = (0..n).map(|_| rng.random_range(0..n)).collect();
            statistic(&idx).filter(|v| v.is_finite())
        })
        .collect();

    let samples: Vec<f64> = draws.into_iter().flatten().collect();
    let n_realized = samples.len();
    if n_realized < n_bootstrap {
        log::warn!(
            "bootstrap: dropped {} of {} replicates with a degenerate statistic",
            n_bootstrap - n_realized,
            n_bootstrap
        );
    }
    Ok(BootstrapDistribution { samples, n_nominal: n_bootstrap, n_realized })
}

// ---------------------------------------------------------------------------
// Intervals
// ---------------------------------------------------------------------------

/// Percentile bootstrap interval.
pub fn percentile_interval(samples: &[f64], conf_level: f64) -> Result<(f64, f64)> {
    if samples.len() < 2 {
        return Err(Error::Validation(format!("percentile interval needs at least 2 replicates, got {}", samples.len())));
    }
    check_conf_level(conf_level)?;

    let alpha = (1.0 - conf_level) / 2.0;
    let lo = quantile_linear(samples, alpha);
    let hi = quantile_linear(samples, 1.0 - alpha);
    Ok((lo.min(hi), lo.max(hi)))
}

/// Estimate BCa bias correction constant `z0` from bootstrap samples.
///
/// Uses mid-rank ties: `p = (n_lt + 0.5*n_eq) / n`.
pub fn estimate_bias_correction_z0(theta_hat: f64, bootstrap_samples: &[f64]) -> Result<f64> {
    if bootstrap_samples.is_empty() {
        return Err(Error::Validation("bias correction needs at least one replicate".into()));
    }
    if !theta_hat.is_finite() {
        return Err(Error::Validation(format!("full-sample estimate must be finite, got {theta_hat}")));
    }

    let mut n_lt = 0usize;
    let mut n_eq = 0usize;
    for &x in bootstrap_samples {
        if !x.is_finite() {
            return Err(Error::Validation("bootstrap replicates must be finite".into()));
        }
        if x < theta_hat {
            n_lt += 1;
        } else if x == theta_hat {
            n_eq += 1;
        }
    }

    let p = (n_lt as f64 + 0.5 * n_eq as f64) / bootstrap_samples.len() as f64;
    Ok(inv_norm_cdf(p))
}

/// Estimate BCa acceleration from jackknife leave-one-out estimates.
///
/// `a = sum((mean_jk - jk_i)^3) / (6 * (sum((mean_jk - jk_i)^2))^(3/2))`
pub fn estimate_acceleration_from_jackknife(jackknife_estimates: &[f64]) -> Result<f64> {
    if jackknife_estimates.len() < 3 {
        return Err(Error::Validation(format!(
            "acceleration needs at least 3 leave-one-out estimates, got {}",
            jackknife_estimates.len()
        )));
    }
    if jackknife_estimates.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("leave-one-out estimates must be finite".into()));
    }

    let m = mean(jackknife_estimates);
    let (sum2, sum3) = jackknife_estimates.iter().fold((0.0, 0.0), |(s2, s3), &v| {
        let d = m - v;
        (s2 + d * d, s3 + d * d * d)
    });
    if !(sum2.is_finite() && sum2 > 0.0) {
        // No variation across leave-one-out estimates.
        return Ok(0.0);
    }
    let a = sum3 / (6.0 * sum2.powf(1.5));
    if !a.is_finite() {
        return Err(Error::Computation("acceleration is non-finite".into()));
    }
    Ok(a)
}

/// BCa-adjusted alpha from raw alpha, `z0`, and acceleration `a`.
pub fn bca_adjusted_alpha(alpha: f64, z0: f64, acceleration: f64) -> f64 {
    let z_alpha = inv_norm_cdf(alpha);
    let denom = 1.0 - acceleration * (z0 + z_alpha);
    if !denom.is_finite() || denom.abs() < 1e-12 {
        return if denom.is_sign_negative() { clip_prob(0.0) } else { clip_prob(1.0) };
    }
    clip_prob(norm_cdf(z0 + (z0 + z_alpha) / denom))
}

/// BCa interval from bootstrap and jackknife estimates.
pub fn bca_interval(
    theta_hat: f64,
    bootstrap_samples: &[f64],
    jackknife_estimates: &[f64],
    conf_level: f64,
) -> Result<((f64, f64), BcaDiagnostics)> {
    check_conf_level(conf_level)?;
    if bootstrap_samples.len() < 2 {
        return Err(Error::Validation(format!("BCa interval needs at least 2 replicates, got {}", bootstrap_samples.len())));
    }

    let z0 = estimate_bias_correction_z0(theta_hat, bootstrap_samples)?;
    let acceleration = estimate_acceleration_from_jackknife(jackknife_estimates)?;

    let alpha_low = (1.0 - conf_level) / 2.0;
    let alpha_high = 1.0 - alpha_low;
    let alpha_low_adj = bca_adjusted_alpha(alpha_low, z0, acceleration);
    let alpha_high_adj = bca_adjusted_alpha(alpha_high, z0, acceleration);

    let lo = quantile_linear(bootstrap_samples, alpha_low_adj);
    let hi = quantile_linear(bootstrap_samples, alpha_high_adj);

    let diag = BcaDiagnostics {
        z0,
        acceleration,
        alpha_low,
        alpha_high,
        alpha_low_adj,
        alpha_high_adj,
        n_bootstrap: bootstrap_samples.len(),
        n_jackknife: jackknife_estimates.len(),
    };
    Ok(((lo.min(hi), lo.max(hi)), diag))
}

// ---------------------------------------------------------------------------
// Prevented fraction
// ---------------------------------------------------------------------------

/// Bootstrap summary of the prevented-outcome fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreventedFractionBootstrap {
    /// Full-sample fraction.
    pub estimate: f64,
    /// Mean of the replicate distribution.
    pub mean: f64,
    /// Lower bound.
    pub ci_lower: f64,
    /// Upper bound.
    pub ci_upper: f64,
    /// Replicates requested.
    pub n_bootstrap: usize,
    /// Replicates with a non-zero denominator.
    pub n_realized: usize,
    /// Interval construction.
    pub method: BootstrapCiMethod,
    /// Present for BCa intervals.
    pub bca: Option<BcaDiagnostics>,
}

/// Prevented contribution of one row: its CATE when treated and scored.
#[inline]
fn prevented_by(cate: f64, treated: f64) -> f64 {
    if treated == 1.0 && cate.is_finite() { cate } else { 0.0 }
}

fn prevented_fraction(cate: &[f64], treated: &[f64], outcome: &[f64], idx: impl Iterator<Item = usize>) -> Option<f64> {
    let (num, den) = idx.fold((0.0, 0.0), |(num, den), i| (num + prevented_by(cate[i], treated[i]), den + outcome[i]));
    (den != 0.0).then(|| num / den)
}

/// Bootstrap `Σ_{treated} CATE / Σ outcome` over rows resampled with
/// replacement. Replicates whose outcome total is zero are skipped. Rows
/// without a finite CATE count in the denominator only.
pub fn prevented_fraction_bootstrap(
    cate: &[f64],
    treated: &[f64],
    outcome: &[f64],
    config: &BootstrapConfig,
    seed: u64,
) -> Result<PreventedFractionBootstrap> {
    config.validate()?;
    let n = cate.len();
    if treated.len() != n || outcome.len() != n {
        return Err(Error::Validation(format!(
            "bootstrap inputs disagree: cate {}, treated {}, outcome {}",
            n,
            treated.len(),
            outcome.len()
        )));
    }
    if n < 3 {
        return Err(Error::InsufficientData { rows: n, minimum: 3 });
    }

    let estimate = prevented_fraction(cate, treated, outcome, 0..n).unwrap_or(0.0);
    let dist = resample_statistic(n, config.n_bootstrap, seed, |idx| {
        prevented_fraction(cate, treated, outcome, idx.iter().copied())
    })?;
    if dist.n_realized < 2 {
        return Err(Error::Computation("fewer than 2 bootstrap replicates had a non-zero outcome total".into()));
    }

    let (interval, bca) = match config.method {
        BootstrapCiMethod::Percentile => (percentile_interval(&dist.samples, config.conf_level)?, None),
        BootstrapCiMethod::Bca => {
            let total_num: f64 = (0..n).map(|i| prevented_by(cate[i], treated[i])).sum();
            let total_den: f64 = outcome.iter().sum();
            let jackknife: Vec<f64> = (0..n)
                .filter_map(|i| {
                    let num = total_num - prevented_by(cate[i], treated[i]);
                    let den = total_den - outcome[i];
                    (den != 0.0).then(|| num / den)
                })
                .collect();
            let (interval, diag) = bca_interval(estimate, &dist.samples, &jackknife, config.conf_level)?;
            (interval, Some(diag))
        }
    };

    let out = PreventedFractionBootstrap {
        estimate,
        mean: mean(&dist.samples),
        ci_lower: interval.0,
        ci_upper: interval.1,
        n_bootstrap: dist.n_nominal,
        n_realized: dist.n_realized,
        method: config.method,
        bca,
    };
    log::info!(
        "prevented fraction = {:.4} [{:.4}, {:.4}] ({} of {} replicates)",
        out.estimate,
        out.ci_lower,
        out.ci_upper,
        out.n_realized,
        out.n_bootstrap
    );
    Ok(out)
}
