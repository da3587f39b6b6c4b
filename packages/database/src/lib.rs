#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Persistence for donor locations, health profiles, blood requests, and
//! alerts.
//!
//! The coordinator only talks to storage through the [`Store`] trait. Two
//! implementations are provided:
//!
//! - [`sqlite::SqliteStore`]: `switchy_database` over `SQLite`, used by the
//!   server.
//! - [`memory::MemoryStore`]: a mutex-guarded in-process store with the same
//!   semantics, used by tests and embedded callers.
//!
//! Both guarantee the two consistency points the dispatcher relies on: an
//! alert round is recorded entirely or not at all, and status changes are
//! compare-and-swaps that report whether they took effect.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bloodlink_database_models::{
    AlertRecord, AlertStatus, BloodRequest, DonationRecord, DonorLocation, DonorStats,
    HealthProfile, RequestStatus,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default path for the `SQLite` database.
pub const DEFAULT_DB_PATH: &str = "data/bloodlink.db";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// The database could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// A uniqueness constraint would be violated.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflicting row.
        message: String,
    },
}

/// Result of [`Store::accept_alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The request is matched to the alert's donor.
    Accepted {
        /// Other outstanding alerts of the request that were superseded.
        superseded: u64,
    },
    /// The request was no longer active. Nothing was written.
    RequestNotActive,
    /// The alert was missing, belonged to another request, or was no longer
    /// outstanding. Nothing was written.
    AlertClosed,
}

/// Transactional store for the four core entities plus donation history.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or replaces the single location row for a donor, unless the
    /// stored row is newer by `last_active`.
    ///
    /// Returns `true` when the row was written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn upsert_donor_location(&self, location: &DonorLocation) -> Result<bool, DbError>;

    /// Fetches a donor's location row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn get_donor_location(&self, donor_id: Uuid) -> Result<Option<DonorLocation>, DbError>;

    /// Lists every stored donor location (used to warm the spatial index).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn list_donor_locations(&self) -> Result<Vec<DonorLocation>, DbError>;

    /// Inserts or replaces a health profile.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn upsert_health_profile(&self, profile: &HealthProfile) -> Result<(), DbError>;

    /// Fetches the health profiles that exist among `user_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn get_health_profiles(
        &self,
        user_ids: &[Uuid],
    ) -> Result<BTreeMap<Uuid, HealthProfile>, DbError>;

    /// Inserts a new request.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the id already exists.
    async fn insert_request(&self, request: &BloodRequest) -> Result<(), DbError>;

    /// Fetches a request.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn get_request(&self, id: Uuid) -> Result<Option<BloodRequest>, DbError>;

    /// Lists requests in the given state, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn list_requests_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<BloodRequest>, DbError>;

    /// Moves a request to `to` only if its current status is one of `from`.
    ///
    /// Returns `true` when the row changed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn transition_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Records every alert of one dispatch round, or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if any (request, donor) pair already has
    /// an alert. Nothing is written in that case.
    async fn insert_alert_round(&self, alerts: &[AlertRecord]) -> Result<(), DbError>;

    /// Fetches an alert.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn get_alert(&self, id: Uuid) -> Result<Option<AlertRecord>, DbError>;

    /// Lists every alert ever created for a request, by round then distance.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn list_alerts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<AlertRecord>, DbError>;

    /// Moves an alert to `to` only if its current status is one of `from`.
    ///
    /// Sets `notified_at` when moving to [`AlertStatus::Notified`] and
    /// `responded_at` when moving to [`AlertStatus::Accepted`] or
    /// [`AlertStatus::Declined`]. Returns `true` when the row changed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn transition_alert(
        &self,
        id: Uuid,
        from: &[AlertStatus],
        to: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Moves every alert of a request whose status is one of `from` to `to`.
    ///
    /// Returns the number of alerts changed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn transition_request_alerts(
        &self,
        request_id: Uuid,
        from: &[AlertStatus],
        to: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<u64, DbError>;

    /// Matches a request to the donor of one of its alerts.
    ///
    /// In a single atomic step: moves the request from
    /// [`RequestStatus::Active`] to [`RequestStatus::Matched`], moves the
    /// alert from an outstanding status to [`AlertStatus::Accepted`], and
    /// supersedes every other outstanding alert of the request. Either all
    /// three happen or none do.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a write fails. Nothing is written in that
    /// case.
    async fn accept_alert(
        &self,
        request_id: Uuid,
        alert_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AcceptOutcome, DbError>;

    /// Records a completed donation, advances the donor's
    /// `last_donation_date`, and bumps their counters.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if any write fails; nothing is written in that
    /// case.
    async fn record_donation(&self, donation: &DonationRecord) -> Result<DonorStats, DbError>;

    /// Fetches a donor's aggregate counters.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn get_donor_stats(&self, donor_id: Uuid) -> Result<Option<DonorStats>, DbError>;
}
