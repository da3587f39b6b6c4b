#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the bloodlink server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the database row types to allow independent evolution of the API
//! contract.

use bloodlink_blood_models::{BloodType, DonationStatus, Urgency};
use bloodlink_database_models::{
    AlertRecord, AlertStatus, BloodRequest, DonationRecord, DonorStats, HealthConditions,
    RequestStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    pub healthy: bool,
    pub version: String,
    /// Donors currently held in the spatial index.
    pub indexed_donors: usize,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

// ── Donors ───────────────────────────────────────────────────────────────

/// Body of `POST /api/locations`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateBody {
    /// Defaults to the caller.
    pub donor_id: Option<Uuid>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub status: DonationStatus,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    /// When the device took the fix. Defaults to receipt time.
    pub timestamp: Option<DateTime<Utc>>,
}

const fn default_visible() -> bool {
    true
}

/// Response to a location report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLocationAccepted {
    pub donor_id: Uuid,
    /// `applied`, `unchanged`, or `stale`.
    pub outcome: String,
}

/// Body of `PUT /api/health-profiles`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProfileBody {
    /// Defaults to the caller.
    pub user_id: Option<Uuid>,
    pub blood_type: BloodType,
    #[serde(default)]
    pub conditions: HealthConditions,
    pub surgery_date: Option<DateTime<Utc>>,
    pub last_donation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub donation_frequency: u32,
    pub is_eligible: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDonorStats {
    pub donor_id: Uuid,
    pub total_donations: u32,
    pub lives_saved: u32,
    pub last_donation_date: Option<DateTime<Utc>>,
}

impl From<DonorStats> for ApiDonorStats {
    fn from(stats: DonorStats) -> Self {
        Self {
            donor_id: stats.donor_id,
            total_donations: stats.total_donations,
            lives_saved: stats.lives_saved,
            last_donation_date: stats.last_donation_date,
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────────────

/// Body of `POST /api/requests`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestBody {
    pub blood_type_needed: BloodType,
    pub urgency: Urgency,
    #[serde(default = "default_units")]
    pub units_needed: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub location_name: Option<String>,
    pub contact_phone: Option<String>,
    pub notes: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

const fn default_units() -> u32 {
    1
}

/// A blood request as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub blood_type_needed: BloodType,
    pub urgency: Urgency,
    pub units_needed: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub location_name: Option<String>,
    pub contact_phone: Option<String>,
    pub notes: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<BloodRequest> for ApiRequest {
    fn from(row: BloodRequest) -> Self {
        Self {
            id: row.id,
            recipient_id: row.recipient_id,
            blood_type_needed: row.blood_type_needed,
            urgency: row.urgency,
            units_needed: row.units_needed,
            latitude: row.latitude,
            longitude: row.longitude,
            location_name: row.location_name,
            contact_phone: row.contact_phone,
            notes: row.notes,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        }
    }
}

/// An active request near the calling donor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNearbyRequest {
    #[serde(flatten)]
    pub request: ApiRequest,
    pub distance_meters: f64,
}

/// Query parameters for `GET /api/requests/nearby`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyQueryParams {
    /// Search radius in meters. Defaults to 10 km.
    pub radius_m: Option<f64>,
}

/// Body of `POST /api/requests/{id}/fulfill`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillBody {
    pub hospital_name: Option<String>,
    pub units_donated: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDonation {
    pub id: Uuid,
    pub donor_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub units_donated: u32,
    pub hospital_name: Option<String>,
    pub donation_date: DateTime<Utc>,
}

impl From<DonationRecord> for ApiDonation {
    fn from(row: DonationRecord) -> Self {
        Self {
            id: row.id,
            donor_id: row.donor_id,
            recipient_id: row.recipient_id,
            request_id: row.request_id,
            units_donated: row.units_donated,
            hospital_name: row.hospital_name,
            donation_date: row.donation_date,
        }
    }
}

// ── Alerts ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAlert {
    pub id: Uuid,
    pub request_id: Uuid,
    pub donor_id: Uuid,
    pub round: u32,
    pub distance_meters: f64,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl From<AlertRecord> for ApiAlert {
    fn from(row: AlertRecord) -> Self {
        Self {
            id: row.id,
            request_id: row.request_id,
            donor_id: row.donor_id,
            round: row.round,
            distance_meters: row.distance_meters,
            status: row.status,
            created_at: row.created_at,
            notified_at: row.notified_at,
            responded_at: row.responded_at,
        }
    }
}

/// A donor's answer, as sent to `POST /api/alerts/{id}/respond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseChoice {
    Accept,
    Decline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RespondBody {
    pub response: ResponseChoice,
}
