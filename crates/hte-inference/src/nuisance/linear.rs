//! Ridge and logistic regression learners.
//!
//! Both standardize features internally and leave the intercept unpenalized.
//! Constant feature columns are ignored rather than rejected.

use hte_core::{ConstantModel, Error, FeatureMatrix, FittedModel, Learner, Result};
use nalgebra::{DMatrix, DVector};

const SCALE_EPS: f64 = 1e-12;

/// Stable sigmoid: `1 / (1 + exp(-x))`.
#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    let recip = 1.0 / (1.0 + e);
    if x >= 0.0 { recip } else { e * recip }
}

/// Column centering and scaling.
#[derive(Debug, Clone)]
struct Standardizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    fn fit(x: &FeatureMatrix) -> Self {
        let n = x.n_rows().max(1) as f64;
        let p = x.n_cols();
        let mut mean = vec![0.0; p];
        for i in 0..x.n_rows() {
            for (m, v) in mean.iter_mut().zip(x.row(i)) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);
        let mut var = vec![0.0; p];
        for i in 0..x.n_rows() {
            for j in 0..p {
                let d = x.get(i, j) - mean[j];
                var[j] += d * d;
            }
        }
        let scale = var.into_iter().map(|v| (v / n).sqrt()).collect();
        Self { mean, scale }
    }

    /// Standardized design with a leading intercept column.
    fn design(&self, x: &FeatureMatrix) -> DMatrix<f64> {
        let p = self.mean.len();
        DMatrix::from_fn(x.n_rows(), p + 1, |i, j| if j == 0 { 1.0 } else { self.z(x.get(i, j - 1), j - 1) })
    }

    #[inline]
    fn z(&self, v: f64, j: usize) -> f64 {
        if self.scale[j] < SCALE_EPS { 0.0 } else { (v - self.mean[j]) / self.scale[j] }
    }

    /// Map standardized coefficients `[b0, b1..]` back to the raw feature scale.
    fn unscale(&self, beta: &DVector<f64>) -> LinearPredictor {
        let coef: Vec<f64> = (0..self.mean.len())
            .map(|j| if self.scale[j] < SCALE_EPS { 0.0 } else { beta[j + 1] / self.scale[j] })
            .collect();
        let intercept = beta[0] - coef.iter().zip(&self.mean).map(|(c, m)| c * m).sum::<f64>();
        LinearPredictor { intercept, coef }
    }
}

/// `intercept + x · coef` on the raw feature scale.
#[derive(Debug, Clone)]
pub struct LinearPredictor {
    /// Intercept.
    pub intercept: f64,
    /// Per-feature coefficients.
    pub coef: Vec<f64>,
}

impl LinearPredictor {
    #[inline]
    fn eta(&self, row: &[f64]) -> f64 {
        self.intercept + row.iter().zip(&self.coef).map(|(x, b)| x * b).sum::<f64>()
    }
}

fn validate_xy(x: &FeatureMatrix, target: &[f64]) -> Result<()> {
    if x.n_rows() == 0 {
        return Err(Error::Validation("training set must be non-empty".into()));
    }
    if target.len() != x.n_rows() {
        return Err(Error::Validation(format!(
            "target has wrong length: expected n={}, got {}",
            x.n_rows(),
            target.len()
        )));
    }
    if target.iter().any(|v| !v.is_finite()) || !x.is_finite() {
        return Err(Error::Validation("training data must contain only finite values".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ridge
// ---------------------------------------------------------------------------

/// Ridge regression on standardized features.
#[derive(Debug, Clone)]
pub struct RidgeRegression {
    /// Penalty on standardized coefficients.
    pub lambda: f64,
    clamp: Option<(f64, f64)>,
}

/// Fitted ridge model.
#[derive(Debug, Clone)]
pub struct RidgeModel {
    /// Linear predictor on the raw scale.
    pub predictor: LinearPredictor,
    clamp: Option<(f64, f64)>,
}

impl RidgeRegression {
    /// Ridge with penalty `lambda`.
    pub fn new(lambda: f64) -> Self {
        Self { lambda, clamp: None }
    }

    /// Clamp predictions to `[lo, hi]` (linear probability use).
    pub fn clamped(mut self, lo: f64, hi: f64) -> Self {
        self.clamp = Some((lo, hi));
        self
    }

    /// Fit and return the concrete model.
    ///
    /// Solves `(Z'Z + λ P) b = Z'y` where `P` leaves the intercept unpenalized.
    pub fn fit_model(&self, x: &FeatureMatrix, y: &[f64]) -> Result<RidgeModel> {
        validate_xy(x, y)?;
        let st = Standardizer::fit(x);
        let z = st.design(x);
        let d = z.ncols();

        let mut a = z.transpose() * &z;
        // A tiny ridge keeps rank-deficient confounder sets solvable at lambda=0.
        let lambda = self.lambda.max(1e-10 * x.n_rows() as f64);
        for j in 1..d {
            a[(j, j)] += lambda;
        }
        let b = z.transpose() * DVector::from_column_slice(y);
        let beta = a
            .lu()
            .solve(&b)
            .ok_or_else(|| Error::Computation("ridge solve failed (singular system)".into()))?;
        if beta.iter().any(|v| !v.is_finite()) {
            return Err(Error::Computation("ridge coefficients are non-finite".into()));
        }
        Ok(RidgeModel { predictor: st.unscale(&beta), clamp: self.clamp })
    }
}

impl FittedModel for RidgeModel {
    fn predict_row(&self, row: &[f64]) -> f64 {
        let v = self.predictor.eta(row);
        match self.clamp {
            Some((lo, hi)) => v.clamp(lo, hi),
            None => v,
        }
    }
}

impl Learner for RidgeRegression {
    fn fit(&self, x: &FeatureMatrix, target: &[f64], _seed: u64) -> Result<Box<dyn FittedModel>> {
        Ok(Box::new(self.fit_model(x, target)?))
    }

    fn name(&self) -> &str {
        "ridge"
    }
}

// ---------------------------------------------------------------------------
// Logistic
// ---------------------------------------------------------------------------

/// Logistic regression fitted by iteratively reweighted least squares.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    /// Penalty on standardized coefficients.
    pub lambda: f64,
    /// Maximum Newton iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the largest coefficient step.
    pub tol: f64,
}

/// Fitted logistic model.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    /// Linear predictor on the logit scale.
    pub predictor: LinearPredictor,
    /// Newton iterations used.
    pub n_iter: usize,
    /// Whether the step tolerance was reached.
    pub converged: bool,
}

impl LogisticModel {
    /// Bernoulli log-likelihood of `y` under the model.
    pub fn log_likelihood(&self, x: &FeatureMatrix, y: &[f64]) -> f64 {
        (0..x.n_rows()).map(|i| bernoulli_ll(y[i], self.predict_row(x.row(i)))).sum()
    }
}

/// `y ln p + (1-y) ln(1-p)` with `p` kept away from {0, 1}.
pub(crate) fn bernoulli_ll(y: f64, p: f64) -> f64 {
    let p = p.clamp(1e-15, 1.0 - 1e-15);
    y * p.ln() + (1.0 - y) * (1.0 - p).ln()
}

impl LogisticRegression {
    /// Fit and return the concrete model. The target must contain both classes.
    pub fn fit_model(&self, x: &FeatureMatrix, y: &[f64]) -> Result<LogisticModel> {
        validate_xy(x, y)?;
        if y.iter().any(|&v| v != 0.0 && v != 1.0) {
            return Err(Error::Validation("logistic target must be 0/1".into()));
        }
        let n = x.n_rows();
        let ybar = y.iter().sum::<f64>() / n as f64;
        if ybar <= 0.0 || ybar >= 1.0 {
            return Err(Error::Computation("logistic target has a single class".into()));
        }

        let st = Standardizer::fit(x);
        let z = st.design(x);
        let d = z.ncols();
        let yv = DVector::from_column_slice(y);

        let mut beta = DVector::zeros(d);
        beta[0] = (ybar / (1.0 - ybar)).ln();
        let mut converged = false;
        let mut n_iter = 0;

        for it in 0..self.max_iter {
            n_iter = it + 1;
            let eta = &z * &beta;
            let mu = eta.map(sigmoid);
            let w = mu.map(|m| (m * (1.0 - m)).max(1e-10));

            let zw = DMatrix::from_fn(n, d, |i, j| z[(i, j)] * w[i]);
            let mut h = z.transpose() * zw;
            let mut g = z.transpose() * (&yv - &mu);
            for j in 1..d {
                h[(j, j)] += self.lambda.max(1e-8);
                g[j] -= self.lambda * beta[j];
            }
            let step = h
                .lu()
                .solve(&g)
                .ok_or_else(|| Error::Computation("IRLS solve failed (singular Hessian)".into()))?;
            beta += &step;
            if beta.iter().any(|v| !v.is_finite()) {
                return Err(Error::Computation("logistic coefficients diverged".into()));
            }
            if step.amax() < self.tol {
                converged = true;
                break;
            }
        }
        if !converged {
            log::debug!("logistic IRLS stopped after {} iterations without reaching tol={}", n_iter, self.tol);
        }

        Ok(LogisticModel { predictor: st.unscale(&beta), n_iter, converged })
    }
}

impl FittedModel for LogisticModel {
    fn predict_row(&self, row: &[f64]) -> f64 {
        sigmoid(self.predictor.eta(row))
    }
}

impl Learner for LogisticRegression {
    fn fit(&self, x: &FeatureMatrix, target: &[f64], _seed: u64) -> Result<Box<dyn FittedModel>> {
        let ybar = target.iter().sum::<f64>() / target.len().max(1) as f64;
        if ybar <= 0.0 || ybar >= 1.0 {
            return Ok(Box::new(ConstantModel(ybar.clamp(0.0, 1.0))));
        }
        Ok(Box::new(self.fit_model(x, target)?))
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    #[test]
    fn ridge_recovers_linear_signal() {
        let rows: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64, (i % 5) as f64, 7.0]).collect();
        let y: Vec<f64> = rows.iter().map(|r| 1.0 + 2.0 * r[0] - 3.0 * r[1]).collect();
        let x = FeatureMatrix::from_rows(&rows).unwrap();
        let m = RidgeRegression::new(0.0).fit_model(&x, &y).unwrap();
        assert_relative_eq!(m.predictor.intercept, 1.0, epsilon = 1e-5);
        assert_relative_eq!(m.predictor.coef[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(m.predictor.coef[1], -3.0, epsilon = 1e-6);
        assert_eq!(m.predictor.coef[2], 0.0);
        assert_relative_eq!(m.predict_row(&[10.0, 2.0, 7.0]), 15.0, epsilon = 1e-4);
    }

    #[test]
    fn ridge_without_features_predicts_mean() {
        let x = FeatureMatrix::empty(4);
        let m = RidgeRegression::new(1.0).fit_model(&x, &[1.0, 2.0, 3.0, 6.0]).unwrap();
        assert_relative_eq!(m.predict_row(&[]), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn logistic_recovers_slope() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = 4000;
        let xs: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
        let y: Vec<f64> = xs
            .iter()
            .map(|&x| if rng.random::<f64>() < sigmoid(-0.5 + 1.5 * x) { 1.0 } else { 0.0 })
            .collect();
        let x = FeatureMatrix::from_columns(&[&xs], n).unwrap();
        let m = LogisticRegression { lambda: 0.0, max_iter: 50, tol: 1e-10 }.fit_model(&x, &y).unwrap();
        assert!(m.converged);
        assert!((m.predictor.intercept + 0.5).abs() < 0.15, "b0={}", m.predictor.intercept);
        assert!((m.predictor.coef[0] - 1.5).abs() < 0.15, "b1={}", m.predictor.coef[0]);
        let ll = m.log_likelihood(&x, &y);
        assert!(ll.is_finite() && ll < 0.0);
    }

    #[test]
    fn single_class_target_gives_constant() {
        let x = FeatureMatrix::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let learner = LogisticRegression { lambda: 1e-4, max_iter: 10, tol: 1e-8 };
        let fitted = learner.fit(&x, &[1.0, 1.0, 1.0], 0).unwrap();
        assert_eq!(fitted.predict_row(&[5.0]), 1.0);
        assert!(learner.fit_model(&x, &[0.0, 0.0, 0.0]).is_err());
    }
}
