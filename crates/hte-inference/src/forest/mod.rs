//! Honest causal forest.
//!
//! Trees are grown on residualized outcome `Ỹ` and treatment `T̃` from
//! cross-fitting. Predictions use the forest as an adaptive kernel: the weight
//! of training row `j` for query `x` is the average over trees of
//! `1{j in leaf(x)} / |leaf(x)|`, and the effect solves the residual-on-residual
//! moment condition under those weights.
//!
//! Variance comes from the bootstrap of little bags ([`variance`]): trees are
//! grown in groups sharing a half-sample, so the spread between group means
//! measures sampling variability.
//!
//! # References
//!
//! - Wager & Athey (2018), "Estimation and Inference of Heterogeneous Treatment
//!   Effects using Random Forests."
//! - Athey, Tibshirani & Wager (2019), "Generalized Random Forests."

use hte_core::{Error, FeatureMatrix, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

mod split;
/// Tree arena and honest growth.
pub mod tree;
/// Little-bags variance and debiasing.
pub mod variance;

pub use tree::{HonestTree, Node};

use tree::{TrainingData, TreeParams, grow_tree};

/// Rows per accumulation chunk for population averages. Fixed so that sums do
/// not depend on the thread pool.
const AVERAGE_CHUNK: usize = 64;

/// Forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    /// Number of trees (rounded up to a multiple of `ci_group_size`).
    pub n_trees: usize,
    /// Minimum structure- and estimation-half rows per leaf.
    pub min_leaf_size: usize,
    /// Optional depth limit.
    pub max_depth: Option<usize>,
    /// Fraction of rows drawn per tree.
    pub subsample_rate: f64,
    /// Share of a tree's subsample used to choose splits.
    pub honesty_fraction: f64,
    /// Trees per little bag; 1 disables variance estimates.
    pub ci_group_size: usize,
    /// Candidate features per split; `None` uses `min(p, ⌈√p⌉ + 20)`.
    pub mtry: Option<usize>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 2000,
            min_leaf_size: 20,
            max_depth: None,
            subsample_rate: 0.5,
            honesty_fraction: 0.5,
            ci_group_size: 2,
            mtry: None,
        }
    }
}

impl ForestConfig {
    /// Same settings with a different tree count.
    pub fn with_trees(&self, n_trees: usize) -> Self {
        Self { n_trees, ..self.clone() }
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(Error::Validation("n_trees must be >= 1".into()));
        }
        if self.min_leaf_size == 0 {
            return Err(Error::Validation("min_leaf_size must be >= 1".into()));
        }
        if self.ci_group_size == 0 {
            return Err(Error::Validation("ci_group_size must be >= 1".into()));
        }
        if !(self.subsample_rate > 0.0 && self.subsample_rate <= 1.0) {
            return Err(Error::Validation(format!("subsample_rate must be in (0,1], got {}", self.subsample_rate)));
        }
        if self.ci_group_size > 1 && self.subsample_rate > 0.5 {
            return Err(Error::Validation(format!(
                "subsample_rate must be <= 0.5 when ci_group_size > 1, got {}",
                self.subsample_rate
            )));
        }
        if !(self.honesty_fraction > 0.0 && self.honesty_fraction < 1.0) {
            return Err(Error::Validation(format!(
                "honesty_fraction must be in (0,1), got {}",
                self.honesty_fraction
            )));
        }
        if self.mtry == Some(0) {
            return Err(Error::Validation("mtry must be >= 1".into()));
        }
        Ok(())
    }

    fn resolved_mtry(&self, p: usize) -> usize {
        self.mtry.unwrap_or_else(|| ((p as f64).sqrt().ceil() as usize) + 20).min(p)
    }
}

/// Point estimate and variance for one query point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatePrediction {
    /// Estimated conditional effect.
    pub estimate: f64,
    /// Estimated variance of `estimate` (`NaN` when unavailable).
    pub variance: f64,
    /// Trees that contributed.
    pub n_trees: usize,
}

impl CatePrediction {
    fn missing() -> Self {
        Self { estimate: f64::NAN, variance: f64::NAN, n_trees: 0 }
    }

    /// Standard error.
    pub fn se(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Weighted average of conditional effects with its variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageEffect {
    /// Weighted mean effect.
    pub estimate: f64,
    /// Variance of the weighted mean, accounting for shared leaves.
    pub variance: f64,
    /// Query rows with a usable estimate.
    pub n_obs: usize,
}

/// Kernel-weighted local solution at one query point.
struct KernelFit {
    theta: f64,
    t_bar: f64,
    y_bar: f64,
    denom: f64,
    trees_used: usize,
}

/// Fitted honest causal forest. Owns its training residuals so it can be
/// persisted and re-scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalForest {
    config: ForestConfig,
    x: FeatureMatrix,
    y_res: Vec<f64>,
    t_res: Vec<f64>,
    trees: Vec<HonestTree>,
    seed: u64,
}

impl CausalForest {
    /// Grow the forest.
    ///
    /// `treated` is the raw 0/1 treatment, used only to require both arms in
    /// every child's estimation half. Group `g` is seeded with `seed + g`.
    pub fn fit(
        x: &FeatureMatrix,
        y_res: &[f64],
        t_res: &[f64],
        treated: &[f64],
        config: &ForestConfig,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let n = x.n_rows();
        if y_res.len() != n || t_res.len() != n || treated.len() != n {
            return Err(Error::Validation(format!(
                "forest inputs disagree: x has {} rows, y_res {}, t_res {}, treated {}",
                n,
                y_res.len(),
                t_res.len(),
                treated.len()
            )));
        }
        if n < 4 {
            return Err(Error::InsufficientData { rows: n, minimum: 4 });
        }
        if y_res.iter().chain(t_res).any(|v| !v.is_finite()) || !x.is_finite() {
            return Err(Error::Validation("forest inputs must be finite".into()));
        }
        if n > u32::MAX as usize {
            return Err(Error::Validation("forest supports at most u32::MAX rows".into()));
        }

        let ell = config.ci_group_size;
        let n_groups = config.n_trees.div_ceil(ell);
        if n_groups * ell != config.n_trees {
            log::debug!("forest: n_trees {} rounded up to {}", config.n_trees, n_groups * ell);
        }
        let params = TreeParams {
            min_leaf: config.min_leaf_size,
            max_depth: config.max_depth,
            mtry: config.resolved_mtry(x.n_cols()),
            honesty_fraction: config.honesty_fraction,
        };
        let data = TrainingData { x, y_res, t_res, treated };

        let groups: Vec<Vec<HonestTree>> = (0..n_groups)
            .into_par_iter()
            .map(|g| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(g as u64));
                let (pool, per_tree) = if ell > 1 {
                    let half = (n / 2).max(1);
                    let pool = rand::seq::index::sample(&mut rng, n, half).into_vec();
                    let m = ((2.0 * config.subsample_rate).min(1.0) * half as f64).round() as usize;
                    (pool, m.clamp(1, half))
                } else {
                    let m = (config.subsample_rate * n as f64).round() as usize;
                    ((0..n).collect(), m.clamp(1, n))
                };
                (0..ell)
                    .map(|_| {
                        let picked = rand::seq::index::sample(&mut rng, pool.len(), per_tree);
                        let subsample: Vec<u32> = picked.iter().map(|k| pool[k] as u32).collect();
                        grow_tree(&data, subsample, &params, g as u32, &mut rng)
                    })
                    .collect()
            })
            .collect();
        let trees: Vec<HonestTree> = groups.into_iter().flatten().collect();

        log::info!(
            "causal forest: {} trees in {} groups on {} rows x {} moderators (mtry={}, min_leaf={})",
            trees.len(),
            n_groups,
            n,
            x.n_cols(),
            params.mtry,
            params.min_leaf
        );

        Ok(Self {
            config: config.clone(),
            x: x.clone(),
            y_res: y_res.to_vec(),
            t_res: t_res.to_vec(),
            trees,
            seed,
        })
    }

    /// Configuration used for training.
    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Trees, in group order.
    pub fn trees(&self) -> &[HonestTree] {
        &self.trees
    }

    /// Number of trees.
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Training rows.
    pub fn n_train(&self) -> usize {
        self.y_res.len()
    }

    /// Seed used for training.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Leaf samples per tree for `row`; trees whose subsample contains
    /// `exclude` are skipped.
    fn leaves<'a>(&'a self, row: &[f64], exclude: Option<usize>) -> Vec<Option<&'a [u32]>> {
        self.trees
            .iter()
            .map(|tree| {
                if exclude.is_some_and(|i| tree.in_subsample(i)) {
                    return None;
                }
                let s = tree.leaf_samples(row);
                if s.is_empty() { None } else { Some(s) }
            })
            .collect()
    }

    fn kernel_fit(&self, leaves: &[Option<&[u32]>]) -> Option<KernelFit> {
        let trees_used = leaves.iter().filter(|l| l.is_some()).count();
        if trees_used == 0 {
            return None;
        }
        let mut alpha = vec![0.0; self.n_train()];
        let mut touched: Vec<u32> = Vec::new();
        for samples in leaves.iter().flatten() {
            let w = 1.0 / samples.len() as f64;
            for &j in *samples {
                let a = &mut alpha[j as usize];
                if *a == 0.0 {
                    touched.push(j);
                }
                *a += w;
            }
        }
        touched.sort_unstable();
        let total = trees_used as f64;

        let (mut t_bar, mut y_bar) = (0.0, 0.0);
        for &j in &touched {
            let a = alpha[j as usize] / total;
            t_bar += a * self.t_res[j as usize];
            y_bar += a * self.y_res[j as usize];
        }
        let (mut num, mut denom) = (0.0, 0.0);
        for &j in &touched {
            let a = alpha[j as usize] / total;
            let dt = self.t_res[j as usize] - t_bar;
            num += a * dt * (self.y_res[j as usize] - y_bar);
            denom += a * dt * dt;
        }
        if denom <= 1e-12 {
            return None;
        }
        Some(KernelFit { theta: num / denom, t_bar, y_bar, denom, trees_used })
    }

    /// Per-tree leaf mean of the score `ψ_j = (T̃_j-T̄)(Ỹ_j-Ȳ-θ(T̃_j-T̄))`.
    fn tree_moments(&self, leaves: &[Option<&[u32]>], fit: &KernelFit) -> Vec<Option<f64>> {
        leaves
            .iter()
            .map(|leaf| {
                leaf.map(|samples| {
                    let s: f64 = samples
                        .iter()
                        .map(|&j| {
                            let dt = self.t_res[j as usize] - fit.t_bar;
                            dt * (self.y_res[j as usize] - fit.y_bar - fit.theta * dt)
                        })
                        .sum();
                    s / samples.len() as f64
                })
            })
            .collect()
    }

    fn predict_one(&self, row: &[f64], exclude: Option<usize>) -> CatePrediction {
        let leaves = self.leaves(row, exclude);
        let Some(fit) = self.kernel_fit(&leaves) else {
            return CatePrediction::missing();
        };
        let moments = self.tree_moments(&leaves, &fit);
        let variance = variance::little_bags_variance(&moments, self.config.ci_group_size) / (fit.denom * fit.denom);
        CatePrediction { estimate: fit.theta, variance, n_trees: fit.trees_used }
    }

    fn check_query(&self, x: &FeatureMatrix) -> Result<()> {
        if x.n_cols() != self.x.n_cols() {
            return Err(Error::Validation(format!(
                "query has {} moderators, forest was trained on {}",
                x.n_cols(),
                self.x.n_cols()
            )));
        }
        Ok(())
    }

    /// Conditional effects for new query points, using every tree.
    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<CatePrediction>> {
        self.check_query(x)?;
        Ok((0..x.n_rows()).into_par_iter().map(|i| self.predict_one(x.row(i), None)).collect())
    }

    /// Out-of-bag conditional effects for the training rows: row `i` is scored
    /// only by trees whose subsample excluded it.
    pub fn predict_oob(&self) -> Vec<CatePrediction> {
        (0..self.n_train()).into_par_iter().map(|i| self.predict_one(self.x.row(i), Some(i))).collect()
    }

    /// Weighted average effect over the training rows, scored out-of-bag.
    pub fn oob_average_effect(&self, weights: Option<&[f64]>) -> Result<AverageEffect> {
        self.average_effect_impl(&self.x, weights, true)
    }

    /// Weighted average effect over new query points.
    pub fn average_effect(&self, x: &FeatureMatrix, weights: Option<&[f64]>) -> Result<AverageEffect> {
        self.check_query(x)?;
        self.average_effect_impl(x, weights, false)
    }

    /// The average's error is linearized as the mean over trees of
    /// `M_t = Σ_i w_i (B / B_i) m_{t,i} / D_i`, where `m_{t,i}` is tree `t`'s
    /// moment at query `i`, `B_i` the trees used for `i` and `D_i` its kernel
    /// denominator. Query points that share leaves share terms in the same
    /// `M_t`, so their covariance enters the little-bags variance of `M`.
    fn average_effect_impl(&self, x: &FeatureMatrix, weights: Option<&[f64]>, oob: bool) -> Result<AverageEffect> {
        let n = x.n_rows();
        if let Some(w) = weights {
            if w.len() != n {
                return Err(Error::Validation(format!("weights length ({}) != query rows ({})", w.len(), n)));
            }
            if w.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(Error::Validation("weights must be finite and non-negative".into()));
            }
        }
        let b = self.n_trees();
        let weight = |i: usize| weights.map_or(1.0, |w| w[i]);

        struct Partial {
            m: Vec<f64>,
            sum_w: f64,
            sum_w_theta: f64,
            n_obs: usize,
        }

        let chunks: Vec<Partial> = (0..n.div_ceil(AVERAGE_CHUNK))
            .into_par_iter()
            .map(|c| {
                let mut part = Partial { m: vec![0.0; b], sum_w: 0.0, sum_w_theta: 0.0, n_obs: 0 };
                for i in c * AVERAGE_CHUNK..((c + 1) * AVERAGE_CHUNK).min(n) {
                    let w = weight(i);
                    let leaves = self.leaves(x.row(i), if oob { Some(i) } else { None });
                    let Some(fit) = self.kernel_fit(&leaves) else { continue };
                    part.sum_w += w;
                    part.sum_w_theta += w * fit.theta;
                    part.n_obs += 1;
                    let scale = w * (b as f64 / fit.trees_used as f64) / fit.denom;
                    for (t, mt) in self.tree_moments(&leaves, &fit).into_iter().enumerate() {
                        if let Some(mt) = mt {
                            part.m[t] += scale * mt;
                        }
                    }
                }
                part
            })
            .collect();

        let mut m = vec![0.0; b];
        let (mut sum_w, mut sum_w_theta, mut n_obs) = (0.0, 0.0, 0usize);
        for part in chunks {
            for (acc, v) in m.iter_mut().zip(&part.m) {
                *acc += v;
            }
            sum_w += part.sum_w;
            sum_w_theta += part.sum_w_theta;
            n_obs += part.n_obs;
        }
        if n_obs == 0 || sum_w <= 0.0 {
            return Err(Error::Computation("no query point received a forest estimate".into()));
        }

        let moments: Vec<Option<f64>> = m.into_iter().map(|v| Some(v / sum_w)).collect();
        let variance = variance::little_bags_variance(&moments, self.config.ci_group_size);
        Ok(AverageEffect { estimate: sum_w_theta / sum_w, variance, n_obs })
    }

    /// Depth-weighted split frequency per moderator, normalized to sum to one.
    ///
    /// Split counts at depth `d < max_depth` are turned into per-depth shares
    /// and averaged with weights `(d + 1)^-2`.
    pub fn variable_importance(&self, max_depth: usize) -> Vec<f64> {
        let p = self.x.n_cols();
        let mut counts = vec![vec![0.0; p]; max_depth];
        for tree in &self.trees {
            for (depth, feature) in tree.splits_by_depth() {
                if depth < max_depth {
                    counts[depth][feature] += 1.0;
                }
            }
        }
        let mut importance = vec![0.0; p];
        let mut total_weight = 0.0;
        for (d, row) in counts.iter().enumerate() {
            let total: f64 = row.iter().sum();
            if total == 0.0 {
                continue;
            }
            let w = ((d + 1) as f64).powi(-2);
            total_weight += w;
            for (imp, c) in importance.iter_mut().zip(row) {
                *imp += w * c / total;
            }
        }
        if total_weight > 0.0 {
            importance.iter_mut().for_each(|v| *v /= total_weight);
        }
        importance
    }
}
