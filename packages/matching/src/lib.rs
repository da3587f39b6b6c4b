#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Donor matching: eligibility scoring and expanding-radius search.
//!
//! [`EligibilityScorer`] turns a health profile and a request into a verdict
//! and a tie-breaking weight. [`MatchEngine`] pulls nearby donors from the
//! spatial index, scores them, and ranks the eligible ones by distance band.

pub mod eligibility;
pub mod engine;

pub use eligibility::{Eligibility, EligibilityScorer, Ineligibility};
pub use engine::{MatchEngine, MatchOutcome, MatchResult, MatchSettings};

/// Errors that can occur while searching for donors.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// The request's position is not a valid coordinate.
    #[error(transparent)]
    Location(#[from] bloodlink_spatial::SpatialError),

    /// Loading donor data failed.
    #[error(transparent)]
    Store(#[from] bloodlink_database::DbError),
}
