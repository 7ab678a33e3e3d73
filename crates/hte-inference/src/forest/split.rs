//! Split search on the structure half.
//!
//! The node's treatment effect is linearized around its local solution
//! `θ = Σ(T̃-T̄)(Ỹ-Ȳ) / Σ(T̃-T̄)²`, giving pseudo-outcomes
//! `ρ_i = (T̃_i-T̄)(Ỹ_i-Ȳ-θ(T̃_i-T̄))`. A cut is scored by
//! `(Σ_L ρ)² / n_L + (Σ_R ρ)² / n_R`, the gain in between-child heterogeneity
//! of the effect rather than of the outcome.

use super::tree::TrainingData;

/// Chosen cut: rows with `x[feature] <= threshold` go left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SplitCandidate {
    pub feature: usize,
    pub threshold: f64,
    pub score: f64,
}

/// Pseudo-outcomes for the structure rows, or `None` if the node has no
/// residual treatment variation.
fn pseudo_outcomes(data: &TrainingData<'_>, rows: &[u32]) -> Option<Vec<f64>> {
    let n = rows.len() as f64;
    let t_bar = rows.iter().map(|&i| data.t_res[i as usize]).sum::<f64>() / n;
    let y_bar = rows.iter().map(|&i| data.y_res[i as usize]).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for &i in rows {
        let dt = data.t_res[i as usize] - t_bar;
        num += dt * (data.y_res[i as usize] - y_bar);
        den += dt * dt;
    }
    if den <= 1e-12 {
        return None;
    }
    let theta = num / den;
    Some(
        rows.iter()
            .map(|&i| {
                let dt = data.t_res[i as usize] - t_bar;
                dt * (data.y_res[i as usize] - y_bar - theta * dt)
            })
            .collect(),
    )
}

/// Best admissible cut over `features`.
///
/// Each child needs `min_leaf` structure rows, `min_leaf` estimation rows, and
/// at least one treated and one control estimation row.
pub(crate) fn find_best_split(
    data: &TrainingData<'_>,
    structure: &[u32],
    estimation: &[u32],
    features: &[usize],
    min_leaf: usize,
) -> Option<SplitCandidate> {
    let n_s = structure.len();
    let n_e = estimation.len();
    if n_s < 2 * min_leaf || n_e < 2 * min_leaf {
        return None;
    }
    let rho = pseudo_outcomes(data, structure)?;
    let e_treated_total = estimation.iter().filter(|&&i| data.treated[i as usize] == 1.0).count();

    let mut best: Option<SplitCandidate> = None;
    let mut s_sorted: Vec<(f64, f64)> = Vec::with_capacity(n_s);
    let mut e_sorted: Vec<(f64, bool)> = Vec::with_capacity(n_e);

    for &j in features {
        s_sorted.clear();
        s_sorted.extend(structure.iter().zip(&rho).map(|(&i, &r)| (data.x.get(i as usize, j), r)));
        s_sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        e_sorted.clear();
        e_sorted.extend(estimation.iter().map(|&i| (data.x.get(i as usize, j), data.treated[i as usize] == 1.0)));
        e_sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        let rho_total: f64 = s_sorted.iter().map(|p| p.1).sum();
        let mut sum_left = 0.0;
        let mut e_pos = 0usize;
        let mut e_treated_left = 0usize;

        for k in 0..n_s - 1 {
            sum_left += s_sorted[k].1;
            let (a, b) = (s_sorted[k].0, s_sorted[k + 1].0);
            if a >= b {
                continue;
            }
            let n_left = k + 1;
            if n_left < min_leaf {
                continue;
            }
            if n_s - n_left < min_leaf {
                break;
            }
            let mid = 0.5 * (a + b);
            let threshold = if mid < b { mid } else { a };

            while e_pos < n_e && e_sorted[e_pos].0 <= threshold {
                if e_sorted[e_pos].1 {
                    e_treated_left += 1;
                }
                e_pos += 1;
            }
            let (e_left, e_right) = (e_pos, n_e - e_pos);
            if e_left < min_leaf {
                continue;
            }
            if e_right < min_leaf {
                break;
            }
            let e_treated_right = e_treated_total - e_treated_left;
            if e_treated_left == 0
                || e_treated_left == e_left
                || e_treated_right == 0
                || e_treated_right == e_right
            {
                continue;
            }

            let sum_right = rho_total - sum_left;
            let score = sum_left * sum_left / n_left as f64 + sum_right * sum_right / (n_s - n_left) as f64;
            if score > 0.0 && best.is_none_or(|c| score > c.score) {
                best = Some(SplitCandidate { feature: j, threshold, score });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use hte_core::FeatureMatrix;

    /// Effect 0 for x < 0.5 and 4 for x >= 0.5 on feature 1; feature 0 is noise.
    fn two_regime(n: usize) -> (FeatureMatrix, Vec<f64>, Vec<f64>, Vec<f64>) {
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![((i * 37) % n) as f64, i as f64 / n as f64]).collect();
        let treated: Vec<f64> = (0..n).map(|i| ((i / 2) % 2) as f64).collect();
        let t_res: Vec<f64> = treated.iter().map(|t| t - 0.5).collect();
        let y_res: Vec<f64> = rows
            .iter()
            .zip(&t_res)
            .map(|(r, &t)| if r[1] >= 0.5 { 4.0 * t } else { 0.0 })
            .collect();
        (FeatureMatrix::from_rows(&rows).unwrap(), y_res, t_res, treated)
    }

    #[test]
    fn finds_the_effect_boundary() {
        let (x, y_res, t_res, treated) = two_regime(400);
        let data = TrainingData { x: &x, y_res: &y_res, t_res: &t_res, treated: &treated };
        let s: Vec<u32> = (0..400).filter(|i| i % 2 == 0).collect();
        let e: Vec<u32> = (0..400).filter(|i| i % 2 == 1).collect();
        let best = find_best_split(&data, &s, &e, &[0, 1], 10).unwrap();
        assert_eq!(best.feature, 1);
        assert!((best.threshold - 0.5).abs() < 0.01, "threshold={}", best.threshold);
    }

    #[test]
    fn respects_min_leaf_and_constant_treatment() {
        let (x, y_res, t_res, treated) = two_regime(40);
        let data = TrainingData { x: &x, y_res: &y_res, t_res: &t_res, treated: &treated };
        let s: Vec<u32> = (0..20).collect();
        let e: Vec<u32> = (20..40).collect();
        assert!(find_best_split(&data, &s, &e, &[1], 15).is_none());

        let flat = vec![0.0; 40];
        let data = TrainingData { x: &x, y_res: &y_res, t_res: &flat, treated: &treated };
        assert!(find_best_split(&data, &s, &e, &[1], 2).is_none());
    }
}
