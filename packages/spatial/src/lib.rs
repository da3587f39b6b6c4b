#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory spatial index of donor locations.
//!
//! Donors are bucketed into H3 resolution 6 cells. Radius queries walk the
//! disk of cells around the query center and filter by exact haversine
//! distance, so lookups touch only the cells near the center instead of the
//! whole donor population. Cell buckets and the per-donor directory are both
//! sharded; no operation takes a global lock.

mod cache;
mod coords;
mod index;

use bloodlink_blood_models::DonationStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use coords::{Coordinates, EARTH_RADIUS_M, haversine_meters};
pub use index::GeoIndex;

/// Errors produced by the spatial index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialError {
    /// Latitude or longitude is not a finite, in-range value.
    #[error("Invalid coordinates: ({latitude}, {longitude})")]
    InvalidCoordinates {
        /// Rejected latitude.
        latitude: f64,
        /// Rejected longitude.
        longitude: f64,
    },
}

/// A single location report for a donor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub donor_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub status: DonationStatus,
    pub is_visible: bool,
    /// When the donor's device produced this report.
    pub timestamp: DateTime<Utc>,
}

/// What an upsert did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The update was newer than the stored entry and replaced it.
    Applied,
    /// The update repeated the stored entry exactly.
    Unchanged,
    /// The update was older than the stored entry and was ignored.
    Stale,
}

/// A donor found by a radius query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub donor_id: Uuid,
    pub coordinates: Coordinates,
    pub distance_meters: f64,
    pub status: DonationStatus,
    pub last_active: DateTime<Utc>,
}

/// The index's current view of one donor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexedDonor {
    pub donor_id: Uuid,
    pub coordinates: Coordinates,
    pub status: DonationStatus,
    pub is_visible: bool,
    pub last_active: DateTime<Utc>,
}
