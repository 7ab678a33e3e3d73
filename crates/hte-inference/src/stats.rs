//! Shared statistical helpers.
//!
//! Normal-distribution utilities, empirical quantiles, and an OLS fit with
//! Liang–Zeger cluster-robust (CR1) standard errors used by the best linear
//! projection, the linear DML comparison and the omitted-variable bound.
//!
//! # References
//!
//! - Cameron & Miller (2015), "A Practitioner's Guide to Cluster-Robust Inference."

use std::collections::HashMap;

use hte_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

const PROB_EPS: f64 = 1e-12;

#[inline]
pub(crate) fn standard_normal() -> Normal {
    // Safe by construction for mean=0, sigma=1.
    Normal::new(0.0, 1.0).expect("standard normal should be constructible")
}

#[inline]
pub(crate) fn clip_prob(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

/// Standard normal quantile with the probability clipped away from {0, 1}.
#[inline]
pub fn inv_norm_cdf(p: f64) -> f64 {
    standard_normal().inverse_cdf(clip_prob(p))
}

/// Standard normal CDF.
#[inline]
pub fn norm_cdf(z: f64) -> f64 {
    standard_normal().cdf(z)
}

/// Standard normal density.
#[inline]
pub fn norm_pdf(z: f64) -> f64 {
    standard_normal().pdf(z)
}

/// Two-sided critical value for a confidence level (1.959964 at 0.95).
pub fn z_critical(conf_level: f64) -> f64 {
    inv_norm_cdf(1.0 - (1.0 - conf_level) / 2.0)
}

/// Two-sided normal p-value for `estimate / se`. NaN when `se` is not a
/// positive finite number.
pub fn two_sided_pvalue(estimate: f64, se: f64) -> f64 {
    if !(se.is_finite() && se > 0.0) || !estimate.is_finite() {
        return f64::NAN;
    }
    let z = (estimate / se).abs();
    (2.0 * (1.0 - norm_cdf(z))).clamp(0.0, 1.0)
}

/// Validate a confidence level in (0, 1).
pub fn check_conf_level(conf_level: f64) -> Result<()> {
    if !(conf_level.is_finite() && conf_level > 0.0 && conf_level < 1.0) {
        return Err(Error::Validation(format!("conf_level must be in (0,1), got {conf_level}")));
    }
    Ok(())
}

/// Quantile for sorted data via linear interpolation.
///
/// - `q=0` returns min
/// - `q=1` returns max
/// - empty input returns `NaN`
pub fn quantile_linear_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let i = pos.floor() as usize;
    let j = pos.ceil() as usize;
    if i == j {
        return sorted[i];
    }
    let t = pos - i as f64;
    (1.0 - t) * sorted[i] + t * sorted[j]
}

/// Quantile via sorting + linear interpolation.
pub fn quantile_linear(data: &[f64], q: f64) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut v = data.to_vec();
    v.sort_by(f64::total_cmp);
    quantile_linear_sorted(&v, q)
}

/// Arithmetic mean; `NaN` for empty input.
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (ddof = 1); `NaN` with fewer than two values.
pub fn sample_variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return f64::NAN;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Ordinary least squares with cluster-robust standard errors.
#[derive(Debug, Clone)]
pub struct OlsFit {
    /// Coefficients, in design column order.
    pub coefficients: Vec<f64>,
    /// Cluster-robust standard errors (each row is its own cluster when no
    /// clusters are supplied, which reduces to HC1).
    pub se: Vec<f64>,
    /// Residuals `y - X beta`.
    pub residuals: Vec<f64>,
    /// Coefficient of determination against the mean of `y`.
    pub r_squared: f64,
    /// Number of observations.
    pub n_obs: usize,
    /// Number of clusters used for the sandwich.
    pub n_clusters: usize,
}

/// Fit `y ~ X` by OLS. `x` must already contain an intercept column if one is
/// wanted.
pub fn ols_cluster_robust(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    cluster_ids: Option<&[usize]>,
) -> Result<OlsFit> {
    let n = x.nrows();
    let p = x.ncols();
    if n == 0 || p == 0 {
        return Err(Error::Validation("design must be non-empty".into()));
    }
    if y.len() != n {
        return Err(Error::Validation(format!("y length ({}) != n ({})", y.len(), n)));
    }
    if let Some(c) = cluster_ids
        && c.len() != n
    {
        return Err(Error::Validation(format!("cluster_ids length ({}) != n ({})", c.len(), n)));
    }

    let xtx = x.transpose() * x;
    let xty = x.transpose() * y;
    let xtx_inv =
        xtx.try_inverse().ok_or_else(|| Error::Computation("X'X is singular".into()))?;
    let beta = &xtx_inv * &xty;
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(Error::Computation("OLS coefficients are non-finite".into()));
    }

    let resid = y - x * &beta;
    let rss: f64 = resid.iter().map(|r| r * r).sum();
    let y_mean = y.mean();
    let tss: f64 = y.iter().map(|v| (v - y_mean) * (v - y_mean)).sum();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    let own: Vec<usize>;
    let clusters = match cluster_ids {
        Some(c) => c,
        None => {
            own = (0..n).collect();
            &own
        }
    };
    let (se, n_clusters) = cluster_robust_se(x, &resid, &xtx_inv, clusters);

    Ok(OlsFit {
        coefficients: beta.iter().copied().collect(),
        se,
        residuals: resid.iter().copied().collect(),
        r_squared,
        n_obs: n,
        n_clusters,
    })
}

/// Liang–Zeger sandwich `V = (X'X)^{-1} B (X'X)^{-1}` with
/// `B = Σ_g X_g' e_g e_g' X_g` and the `G/(G-1) * (N-1)/(N-K)` correction.
fn cluster_robust_se(
    x: &DMatrix<f64>,
    residuals: &DVector<f64>,
    xtx_inv: &DMatrix<f64>,
    cluster_ids: &[usize],
) -> (Vec<f64>, usize) {
    let n = x.nrows();
    let p = x.ncols();

    let mut cluster_map: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, &cid) in cluster_ids.iter().enumerate() {
        cluster_map.entry(cid).or_default().push(i);
    }
    // Fixed summation order over clusters.
    let mut keys: Vec<usize> = cluster_map.keys().copied().collect();
    keys.sort_unstable();
    let g = keys.len() as f64;

    let mut meat = DMatrix::zeros(p, p);
    for key in &keys {
        let mut s_g = vec![0.0_f64; p];
        for &i in &cluster_map[key] {
            let e_i = residuals[i];
            for (j, s) in s_g.iter_mut().enumerate() {
                *s += x[(i, j)] * e_i;
            }
        }
        for a in 0..p {
            for b in 0..p {
                meat[(a, b)] += s_g[a] * s_g[b];
            }
        }
    }

    let n_f = n as f64;
    let p_f = p as f64;
    let correction =
        if g > 1.0 && n_f > p_f { (g / (g - 1.0)) * ((n_f - 1.0) / (n_f - p_f)) } else { 1.0 };

    let vcr = (xtx_inv * &meat) * xtx_inv * correction;
    ((0..p).map(|j| vcr[(j, j)].max(0.0).sqrt()).collect(), keys.len())
}
