//! Shapley attribution of forest CATE predictions.
//!
//! Each explained row is attributed by sampling feature orderings. An ordering
//! starts from a background row and switches features to the explained row's
//! values one at a time; each switch is credited with the change in predicted
//! CATE. Averaged over orderings this estimates the interventional Shapley
//! value, and every single ordering already satisfies
//! `Σ_j φ_j = f(x) - f(background)`.
//!
//! Orderings and background draws for matrix row `i` come from seed
//! `seed + 1 + i`, so values do not depend on the thread pool.
//!
//! # References
//!
//! - Štrumbelj & Kononenko (2014), "Explaining prediction models and individual
//!   predictions with feature contributions."
//! - Lundberg & Lee (2017), "A Unified Approach to Interpreting Model
//!   Predictions."

use hte_core::{Error, FeatureMatrix, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::forest::CausalForest;
use crate::stats::mean;

/// Attribution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Compute attributions at all.
    pub enabled: bool,
    /// Rows explained; larger matrices are subsampled.
    pub max_rows: usize,
    /// Background rows drawn from the training moderators.
    pub n_background: usize,
    /// Sampled feature orderings per explained row.
    pub n_permutations: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self { enabled: true, max_rows: 1000, n_background: 50, n_permutations: 10 }
    }
}

impl AttributionConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_rows == 0 || self.n_background == 0 || self.n_permutations == 0 {
            return Err(Error::Validation(format!(
                "attribution sizes must be >= 1 (max_rows {}, n_background {}, n_permutations {})",
                self.max_rows, self.n_background, self.n_permutations
            )));
        }
        Ok(())
    }
}

/// Contributions for one explained row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowAttribution {
    /// Row of the estimation matrices.
    pub row: usize,
    /// Predicted CATE `f(x)`.
    pub prediction: f64,
    /// Mean prediction at the background rows drawn for this row.
    pub base_value: f64,
    /// One contribution per moderator; sums to `prediction - base_value`.
    pub values: Vec<f64>,
}

/// Attributions for a set of rows plus the global ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapleyValues {
    /// Moderator names, in column order.
    pub moderator_names: Vec<String>,
    /// Explained rows, in matrix order.
    pub rows: Vec<RowAttribution>,
    /// Mean prediction over the background set.
    pub expected_value: f64,
    /// `(moderator, mean |φ|)`, largest first.
    pub importance: Vec<(String, f64)>,
    /// Rows dropped because some prediction along their orderings was missing.
    pub n_unexplained: usize,
}

fn explain_row(
    forest: &CausalForest,
    row: usize,
    x: &[f64],
    background: &FeatureMatrix,
    n_permutations: usize,
    seed: u64,
) -> Result<Option<RowAttribution>> {
    let p = x.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..p).collect();
    let mut orders = Vec::with_capacity(n_permutations);
    let mut points = Vec::with_capacity(n_permutations * (p + 1) * p);
    for _ in 0..n_permutations {
        order.shuffle(&mut rng);
        let mut z = background.row(rng.random_range(0..background.n_rows())).to_vec();
        points.extend_from_slice(&z);
        for &j in &order {
            z[j] = x[j];
            points.extend_from_slice(&z);
        }
        orders.push(order.clone());
    }

    let batch = FeatureMatrix::new(n_permutations * (p + 1), p, points)?;
    let f: Vec<f64> = forest.predict(&batch)?.iter().map(|c| c.estimate).collect();
    if f.iter().any(|v| !v.is_finite()) {
        return Ok(None);
    }

    let mut values = vec![0.0; p];
    let mut base = 0.0;
    for (walk, order) in f.chunks_exact(p + 1).zip(&orders) {
        base += walk[0];
        for (k, &j) in order.iter().enumerate() {
            values[j] += walk[k + 1] - walk[k];
        }
    }
    let scale = 1.0 / n_permutations as f64;
    values.iter_mut().for_each(|v| *v *= scale);
    Ok(Some(RowAttribution { row, prediction: f[p], base_value: base * scale, values }))
}

/// Shapley values of `forest`'s CATE predictions over the moderators `x`.
///
/// `x` is the training moderator matrix: it supplies both the rows to explain
/// (at most `max_rows`, drawn without replacement) and the background set.
pub fn shapley_values(
    forest: &CausalForest,
    x: &FeatureMatrix,
    names: &[String],
    config: &AttributionConfig,
    seed: u64,
) -> Result<ShapleyValues> {
    config.validate()?;
    let (n, p) = (x.n_rows(), x.n_cols());
    if p == 0 {
        return Err(Error::Validation("attribution needs at least one moderator".into()));
    }
    if names.len() != p {
        return Err(Error::Validation(format!("{} moderator names for {} columns", names.len(), p)));
    }
    if n == 0 {
        return Err(Error::InsufficientData { rows: 0, minimum: 1 });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut explained: Vec<usize> = if n > config.max_rows {
        rand::seq::index::sample(&mut rng, n, config.max_rows).into_vec()
    } else {
        (0..n).collect()
    };
    explained.sort_unstable();
    let mut bg_rows = rand::seq::index::sample(&mut rng, n, config.n_background.min(n)).into_vec();
    bg_rows.sort_unstable();
    let background = x.select_rows(&bg_rows);

    let bg_predictions: Vec<f64> =
        forest.predict(&background)?.iter().map(|c| c.estimate).filter(|v| v.is_finite()).collect();
    let expected_value = mean(&bg_predictions);

    let explained_rows: Vec<Option<RowAttribution>> = explained
        .par_iter()
        .map(|&i| explain_row(forest, i, x.row(i), &background, config.n_permutations, seed.wrapping_add(1 + i as u64)))
        .collect::<Result<_>>()?;
    let n_unexplained = explained_rows.iter().filter(|r| r.is_none()).count();
    let rows: Vec<RowAttribution> = explained_rows.into_iter().flatten().collect();
    if rows.is_empty() {
        return Err(Error::Computation("no row had finite predictions along its orderings".into()));
    }
    if n_unexplained > 0 {
        log::warn!("attribution: {} of {} rows had missing predictions and were dropped", n_unexplained, explained.len());
    }

    let mut importance: Vec<(String, f64)> = names
        .iter()
        .enumerate()
        .map(|(j, name)| (name.clone(), rows.iter().map(|r| r.values[j].abs()).sum::<f64>() / rows.len() as f64))
        .collect();
    importance.sort_by(|a, b| b.1.total_cmp(&a.1));
    if let Some((top, v)) = importance.first() {
        log::info!(
            "attribution: {} rows x {} orderings, base {:.4}, top moderator {} (mean |phi| {:.4})",
            rows.len(),
            config.n_permutations,
            expected_value,
            top,
            v
        );
    }

    Ok(ShapleyValues { moderator_names: names.to_vec(), rows, expected_value, importance, n_unexplained })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestConfig;

    /// Residual-scale data with a step effect in `x0`, a noise column `x1` and
    /// a constant column `x2`.
    fn step_forest(n: usize, seed: u64) -> (CausalForest, FeatureMatrix) {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows: Vec<Vec<f64>> = (0..n).map(|_| vec![rng.random::<f64>(), rng.random::<f64>(), 1.0]).collect();
        let treated: Vec<f64> = (0..n).map(|_| if rng.random::<bool>() { 1.0 } else { 0.0 }).collect();
        let t_res: Vec<f64> = treated.iter().map(|t| t - 0.5).collect();
        let y_res: Vec<f64> = rows
            .iter()
            .zip(&t_res)
            .map(|(r, &t)| (if r[0] > 0.5 { 3.0 } else { 1.0 }) * t + 0.3 * (rng.random::<f64>() - 0.5))
            .collect();
        let x = FeatureMatrix::from_rows(&rows).unwrap();
        let config = ForestConfig { n_trees: 60, min_leaf_size: 10, ..ForestConfig::default() };
        let forest = CausalForest::fit(&x, &y_res, &t_res, &treated, &config, 7).unwrap();
        (forest, x)
    }

    fn names() -> Vec<String> {
        vec!["x0".into(), "x1".into(), "x2".into()]
    }

    fn small() -> AttributionConfig {
        AttributionConfig { max_rows: 40, n_background: 20, n_permutations: 6, ..Default::default() }
    }

    #[test]
    fn contributions_sum_to_prediction_minus_base() {
        let (forest, x) = step_forest(600, 1);
        let sv = shapley_values(&forest, &x, &names(), &small(), 3).unwrap();
        assert_eq!(sv.rows.len() + sv.n_unexplained, 40);
        let direct = forest.predict(&x.select_rows(&sv.rows.iter().map(|r| r.row).collect::<Vec<_>>())).unwrap();
        for (r, d) in sv.rows.iter().zip(&direct) {
            let total: f64 = r.values.iter().sum();
            assert!((total + r.base_value - r.prediction).abs() < 1e-9, "row {}", r.row);
            assert_eq!(r.prediction.to_bits(), d.estimate.to_bits());
        }
        assert!(sv.rows.windows(2).all(|w| w[0].row < w[1].row));
    }

    #[test]
    fn constant_moderator_gets_zero_and_step_moderator_ranks_first() {
        let (forest, x) = step_forest(800, 2);
        let sv = shapley_values(&forest, &x, &names(), &small(), 5).unwrap();
        assert!(sv.rows.iter().all(|r| r.values[2] == 0.0));
        assert_eq!(sv.importance[0].0, "x0");
        assert_eq!(sv.importance[2], ("x2".to_string(), 0.0));
        assert!(sv.importance[0].1 > 2.0 * sv.importance[1].1);
    }

    #[test]
    fn same_seed_gives_identical_values() {
        let (forest, x) = step_forest(400, 4);
        let a = shapley_values(&forest, &x, &names(), &small(), 11).unwrap();
        let b = shapley_values(&forest, &x, &names(), &small(), 11).unwrap();
        assert_eq!(a, b);
        let c = shapley_values(&forest, &x, &names(), &small(), 12).unwrap();
        assert_ne!(a.rows, c.rows);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let (forest, x) = step_forest(200, 6);
        assert!(shapley_values(&forest, &x, &names()[..2], &small(), 0).is_err());
        let zero = AttributionConfig { n_permutations: 0, ..small() };
        assert!(shapley_values(&forest, &x, &names(), &zero, 0).is_err());
    }
}
