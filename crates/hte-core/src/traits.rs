//! Core traits
//!
//! The nuisance-model seam: cross-fitting only ever sees a [`Learner`] that
//! produces a [`FittedModel`], so outcome regressions and treatment
//! classifiers can be swapped without touching the orchestration code.

use crate::{FeatureMatrix, Result};

/// A fitted nuisance function `confounders -> prediction`.
///
/// Regressors predict the conditional outcome mean; classifiers predict the
/// probability of treatment. Stateless after fitting.
pub trait FittedModel: Send + Sync {
    /// Predict a single row.
    fn predict_row(&self, row: &[f64]) -> f64;

    /// Predict every row of `x`.
    fn predict(&self, x: &FeatureMatrix) -> Vec<f64> {
        (0..x.n_rows()).map(|i| self.predict_row(x.row(i))).collect()
    }
}

/// Untrained nuisance model.
pub trait Learner: Send + Sync {
    /// Fit on `x` / `target`.
    ///
    /// `seed` drives any internal randomness (row subsampling, ...); learners
    /// without randomness ignore it.
    fn fit(&self, x: &FeatureMatrix, target: &[f64], seed: u64) -> Result<Box<dyn FittedModel>>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Constant prediction. Returned when a training set carries no signal.
#[derive(Debug, Clone, Copy)]
pub struct ConstantModel(pub f64);

impl FittedModel for ConstantModel {
    fn predict_row(&self, _row: &[f64]) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MeanLearner;

    impl Learner for MeanLearner {
        fn fit(
            &self,
            _x: &FeatureMatrix,
            target: &[f64],
            _seed: u64,
        ) -> Result<Box<dyn FittedModel>> {
            let m = target.iter().sum::<f64>() / target.len() as f64;
            Ok(Box::new(ConstantModel(m)))
        }

        fn name(&self) -> &str {
            "mean"
        }
    }

    #[test]
    fn default_predict_covers_all_rows() {
        let x = FeatureMatrix::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let fitted = MeanLearner.fit(&x, &[1.0, 2.0, 6.0], 0).unwrap();
        assert_eq!(fitted.predict(&x), vec![3.0, 3.0, 3.0]);
        assert_eq!(MeanLearner.name(), "mean");
    }
}
