#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Persisted row types for donor locations, health profiles, requests, and
//! alerts.
//!
//! These types represent the shapes of data as stored in and retrieved from
//! the backing store. They are distinct from the API types in
//! `bloodlink_server_models` so the wire contract can evolve independently.

use bloodlink_blood_models::{BloodType, DonationStatus, Urgency};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// The last known position of a donor. At most one per donor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorLocation {
    /// Owning donor.
    pub donor_id: Uuid,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Longitude (WGS84).
    pub longitude: f64,
    /// Availability at the time of the update.
    pub status: DonationStatus,
    /// Whether the donor currently shares their location.
    pub is_visible: bool,
    /// Timestamp of the update that produced this row.
    pub last_active: DateTime<Utc>,
}

/// Medical condition flags on a health profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConditions {
    /// Active infection; disqualifies outright.
    pub has_infections: bool,
    /// Hypertension; lowers priority.
    pub has_hypertension: bool,
    /// Diabetes; lowers priority.
    pub has_diabetes: bool,
    /// Self-reported recent surgery without a recorded date.
    pub recent_surgeries: bool,
}

impl HealthConditions {
    /// Number of comorbidity flags set (hypertension, diabetes).
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn comorbidity_count(&self) -> u32 {
        self.has_hypertension as u32 + self.has_diabetes as u32
    }
}

/// A donor's medical history relevant to eligibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProfile {
    /// Owning user.
    pub user_id: Uuid,
    /// ABO/Rh type.
    pub blood_type: BloodType,
    /// Condition flags.
    pub conditions: HealthConditions,
    /// Date of the most recent surgery, if known.
    pub surgery_date: Option<DateTime<Utc>>,
    /// Date of the most recent whole-blood donation.
    pub last_donation_date: Option<DateTime<Utc>>,
    /// Donations per year.
    pub donation_frequency: u32,
    /// Reviewer override. `Some(false)` defers the donor regardless of any
    /// other factor.
    pub is_eligible: Option<bool>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a [`BloodRequest`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    /// Open and being dispatched.
    Active,
    /// A donor accepted.
    Matched,
    /// Donation completed.
    Fulfilled,
    /// Reached `expires_at` without an accept.
    Expired,
    /// Withdrawn by the recipient or a hospital.
    Cancelled,
}

impl RequestStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Expired | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Matched | Self::Expired | Self::Cancelled)
                | (Self::Matched, Self::Fulfilled | Self::Cancelled)
        )
    }
}

/// A recipient's request for blood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodRequest {
    /// Primary key.
    pub id: Uuid,
    /// Requesting user.
    pub recipient_id: Uuid,
    /// Blood type the recipient needs.
    pub blood_type_needed: BloodType,
    /// Urgency level.
    pub urgency: Urgency,
    /// Units of blood needed (at least one).
    pub units_needed: u32,
    /// Latitude of the collection point (WGS84).
    pub latitude: f64,
    /// Longitude of the collection point (WGS84).
    pub longitude: f64,
    /// Human-readable place, e.g. a hospital name.
    pub location_name: Option<String>,
    /// Phone number donors can call.
    pub contact_phone: Option<String>,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// Deadline after which an unmatched request expires.
    pub expires_at: DateTime<Utc>,
}

impl BloodRequest {
    /// Whether the request has reached its deadline at `now`.
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// State of a single donor alert.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertStatus {
    /// Recorded, delivery not yet attempted.
    Pending,
    /// Delivered to the donor.
    Notified,
    /// Donor accepted and won the request.
    Accepted,
    /// Donor declined.
    Declined,
    /// Round timed out before the donor answered.
    TimedOut,
    /// Closed because the request was matched, cancelled, or won by another
    /// donor.
    Superseded,
    /// Delivery failed; the donor is not contacted again for this request.
    Undelivered,
}

impl AlertStatus {
    /// Whether the alert is still awaiting an answer.
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::Pending | Self::Notified)
    }

    /// Statuses that still await an answer.
    pub const OUTSTANDING: &'static [Self] = &[Self::Pending, Self::Notified];
}

/// A notification sent to one donor for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Primary key.
    pub id: Uuid,
    /// Request this alert belongs to.
    pub request_id: Uuid,
    /// Alerted donor.
    pub donor_id: Uuid,
    /// Dispatch round number (1-based) that created this alert.
    pub round: u32,
    /// Donor distance from the request at dispatch time.
    pub distance_meters: f64,
    /// Current state.
    pub status: AlertStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When delivery succeeded.
    pub notified_at: Option<DateTime<Utc>>,
    /// When the donor answered.
    pub responded_at: Option<DateTime<Utc>>,
}

/// A completed donation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationRecord {
    /// Primary key.
    pub id: Uuid,
    /// Donor who gave blood.
    pub donor_id: Uuid,
    /// Recipient, when the donation answered a request.
    pub recipient_id: Option<Uuid>,
    /// Request that was fulfilled, if any.
    pub request_id: Option<Uuid>,
    /// Units donated.
    pub units_donated: u32,
    /// Hospital that performed the collection.
    pub hospital_name: Option<String>,
    /// When the donation took place.
    pub donation_date: DateTime<Utc>,
}

/// Aggregate donation counters for a donor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorStats {
    /// Owning donor.
    pub donor_id: Uuid,
    /// Completed donations.
    pub total_donations: u32,
    /// Requests fulfilled by this donor.
    pub lives_saved: u32,
    /// Most recent donation.
    pub last_donation_date: Option<DateTime<Utc>>,
}
