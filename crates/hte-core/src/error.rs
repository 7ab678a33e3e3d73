//! Error types for the effect-estimation engine

use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// A column required under every role schema is absent from the panel.
    #[error("required column '{0}' is not present in the panel")]
    MissingColumn(String),

    /// Too few complete rows to fit anything.
    #[error("insufficient data: {rows} usable rows, at least {minimum} required")]
    InsufficientData {
        /// Rows that survived the completeness filter.
        rows: usize,
        /// Minimum usable row count.
        minimum: usize,
    },

    /// Treatment prevalence outside the fittable band.
    #[error("degenerate treatment: prevalence {prevalence:.4} outside ({lower}, {upper})")]
    DegenerateTreatment {
        /// Observed share of treated rows.
        prevalence: f64,
        /// Lower bound of the fittable band.
        lower: f64,
        /// Upper bound of the fittable band.
        upper: f64,
    },

    /// BLP/CLAN extraction failed.
    #[error("inference extraction failed: {0}")]
    InferenceExtraction(#[from] ExtractionFailure),
}

impl Error {
    /// Whether the failure only affects the current unit of work (one outcome,
    /// threshold, cluster or check) and the batch should continue.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientData { .. }
                | Error::DegenerateTreatment { .. }
                | Error::InferenceExtraction(_)
                | Error::Computation(_)
        )
    }
}

/// Typed reason why a heterogeneity summary (BLP / CLAN) could not be produced.
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExtractionFailure {
    /// No moderators in the active schema.
    #[error("no moderators available")]
    NoModerators,

    /// Fewer observations than parameters (or strata).
    #[error("too few observations: {n} for {required} required")]
    TooFewObservations {
        /// Observations available.
        n: usize,
        /// Observations required.
        required: usize,
    },

    /// The projection design is singular.
    #[error("design matrix is singular")]
    SingularDesign,

    /// Scores or estimates contain NaN/inf.
    #[error("non-finite values in {0}")]
    NonFinite(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skippable_classification() {
        assert!(Error::InsufficientData { rows: 10, minimum: 100 }.is_skippable());
        assert!(
            Error::DegenerateTreatment { prevalence: 0.001, lower: 0.01, upper: 0.99 }
                .is_skippable()
        );
        assert!(Error::InferenceExtraction(ExtractionFailure::SingularDesign).is_skippable());
        assert!(!Error::MissingColumn("admissions".into()).is_skippable());
        assert!(!Error::Validation("bad".into()).is_skippable());
    }

    #[test]
    fn messages_are_informative() {
        let e = Error::InsufficientData { rows: 42, minimum: 100 };
        assert_eq!(e.to_string(), "insufficient data: 42 usable rows, at least 100 required");
        let e: Error = ExtractionFailure::TooFewObservations { n: 3, required: 5 }.into();
        assert!(e.to_string().contains("too few observations"));
    }
}
