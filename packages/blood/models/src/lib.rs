#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Blood type compatibility, urgency policy, and donor/user role types.
//!
//! This crate defines the canonical enumerations shared by every bloodlink
//! package: the eight ABO/Rh blood types together with the red-cell
//! compatibility table, the request urgency levels and their search policy,
//! donor availability states, and user roles.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// ABO/Rh blood type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum BloodType {
    /// A, Rh positive
    #[serde(rename = "A+")]
    #[strum(serialize = "A+")]
    APositive,
    /// A, Rh negative
    #[serde(rename = "A-")]
    #[strum(serialize = "A-")]
    ANegative,
    /// B, Rh positive
    #[serde(rename = "B+")]
    #[strum(serialize = "B+")]
    BPositive,
    /// B, Rh negative
    #[serde(rename = "B-")]
    #[strum(serialize = "B-")]
    BNegative,
    /// AB, Rh positive (universal red-cell recipient)
    #[serde(rename = "AB+")]
    #[strum(serialize = "AB+")]
    AbPositive,
    /// AB, Rh negative
    #[serde(rename = "AB-")]
    #[strum(serialize = "AB-")]
    AbNegative,
    /// O, Rh positive
    #[serde(rename = "O+")]
    #[strum(serialize = "O+")]
    OPositive,
    /// O, Rh negative (universal red-cell donor)
    #[serde(rename = "O-")]
    #[strum(serialize = "O-")]
    ONegative,
}

const ANTIGEN_A: u8 = 0b001;
const ANTIGEN_B: u8 = 0b010;
const ANTIGEN_RH: u8 = 0b100;

impl BloodType {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::APositive,
            Self::ANegative,
            Self::BPositive,
            Self::BNegative,
            Self::AbPositive,
            Self::AbNegative,
            Self::OPositive,
            Self::ONegative,
        ]
    }

    /// Red-cell surface antigens carried by this type, as a bit set.
    const fn antigens(self) -> u8 {
        match self {
            Self::APositive => ANTIGEN_A | ANTIGEN_RH,
            Self::ANegative => ANTIGEN_A,
            Self::BPositive => ANTIGEN_B | ANTIGEN_RH,
            Self::BNegative => ANTIGEN_B,
            Self::AbPositive => ANTIGEN_A | ANTIGEN_B | ANTIGEN_RH,
            Self::AbNegative => ANTIGEN_A | ANTIGEN_B,
            Self::OPositive => ANTIGEN_RH,
            Self::ONegative => 0,
        }
    }

    /// Whether red cells of this type can be given to a recipient of type
    /// `recipient`.
    ///
    /// A donation is compatible when the donor carries no antigen the
    /// recipient lacks.
    #[must_use]
    pub const fn can_donate_to(self, recipient: Self) -> bool {
        self.antigens() & !recipient.antigens() == 0
    }

    /// Whether a recipient of this type can receive red cells from `donor`.
    #[must_use]
    pub const fn can_receive_from(self, donor: Self) -> bool {
        donor.can_donate_to(self)
    }

    /// All donor types this recipient type can receive from.
    #[must_use]
    pub fn compatible_donors(self) -> Vec<Self> {
        Self::all()
            .iter()
            .copied()
            .filter(|donor| donor.can_donate_to(self))
            .collect()
    }
}

/// Urgency of a blood request.
///
/// Ordered from least to most urgent so that `Urgency::Critical` compares
/// greatest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Urgency {
    /// Scheduled need, wide search.
    Low,
    /// Needed within the day.
    Medium,
    /// Needed within hours.
    High,
    /// Life-threatening, narrowest initial search and shortest timeouts.
    Critical,
}

impl Urgency {
    /// Initial search radius in meters before any expansion.
    #[must_use]
    pub const fn initial_radius_m(self) -> f64 {
        match self {
            Self::Critical => 2_000.0,
            Self::High => 5_000.0,
            Self::Medium => 10_000.0,
            Self::Low => 20_000.0,
        }
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Low, Self::Medium, Self::High, Self::Critical]
    }
}

/// Donor availability as reported with each location update.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DonationStatus {
    /// Ready to be alerted.
    #[default]
    Available,
    /// Opted out of alerts.
    Unavailable,
    /// Temporarily occupied.
    Busy,
    /// Opted in to emergency alerts: ranked first within a distance band and
    /// given shorter response windows.
    EmergencyMode,
}

impl DonationStatus {
    /// Whether a donor in this state may receive alerts.
    #[must_use]
    pub const fn accepts_alerts(self) -> bool {
        matches!(self, Self::Available | Self::EmergencyMode)
    }

    /// Whether this donor opted in to emergency dispatch.
    #[must_use]
    pub const fn is_emergency(self) -> bool {
        matches!(self, Self::EmergencyMode)
    }
}

/// Account role, as issued by the authentication gateway.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    /// Gives blood.
    Donor,
    /// Posts requests for blood.
    Recipient,
    /// Posts requests, confirms donations, reviews health profiles.
    Hospital,
    /// Operator with every capability.
    Admin,
}
