//! # hte-core
//!
//! Shared foundation for the heterogeneous treatment effect engine.
//!
//! This crate provides:
//! - the error taxonomy used by every estimation stage,
//! - the columnar [`Panel`] and the role-schema negotiation that turns a declared
//!   [`RoleSchema`] into a validated [`ActiveSchema`],
//! - dense numeric containers ([`FeatureMatrix`]) and shared result records,
//! - the [`Learner`] / [`FittedModel`] traits at the nuisance-model seam.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types.
pub mod error;
/// Columnar panel and role schema.
pub mod panel;
/// Nuisance-model traits.
pub mod traits;
/// Shared numeric types and result records.
pub mod types;

pub use error::{Error, ExtractionFailure, Result};
pub use panel::{ActiveSchema, Panel, RoleSchema};
pub use traits::{ConstantModel, FittedModel, Learner};
pub use types::{AteEstimate, ConfidenceInterval, FeatureMatrix};
