//! Donor eligibility verdicts and tie-breaking weights.

use std::fmt;

use bloodlink_blood_models::BloodType;
use bloodlink_database_models::{BloodRequest, HealthProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum days between two whole-blood donations.
pub const MIN_DAYS_BETWEEN_DONATIONS: i64 = 56;

/// How long after a surgery a comorbid donor stays deferred.
pub const SURGERY_LOOKBACK_DAYS: i64 = 180;

/// Days past the donation interval after which recency stops adding weight.
const RECENCY_CAP_DAYS: i64 = 365;

/// Donations per year at which frequency stops adding weight.
const FREQUENCY_CAP: u32 = 4;

const RECENCY_WEIGHT: f64 = 0.4;
const FREQUENCY_WEIGHT: f64 = 0.3;
const HEALTH_WEIGHT: f64 = 0.3;
const COMORBIDITY_PENALTY: f64 = 0.25;

/// Why a donor cannot give for a request. Checked in declaration order; the
/// first that applies is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Ineligibility {
    IncompatibleBloodType {
        donor: BloodType,
        needed: BloodType,
    },
    /// A hospital reviewer deferred the donor.
    ManuallyDeferred,
    ActiveInfection,
    DonatedRecently {
        days_since: i64,
    },
    /// Hypertension or diabetes together with recent surgery.
    ComorbidityWithRecentSurgery,
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleBloodType { donor, needed } => {
                write!(f, "{donor} cannot donate to {needed}")
            }
            Self::ManuallyDeferred => f.write_str("deferred by reviewer"),
            Self::ActiveInfection => f.write_str("active infection"),
            Self::DonatedRecently { days_since } => {
                write!(f, "donated {days_since} days ago")
            }
            Self::ComorbidityWithRecentSurgery => f.write_str("comorbidity with recent surgery"),
        }
    }
}

/// Result of scoring one donor against one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<Ineligibility>,
    /// In `[0, 1]`; zero when ineligible.
    pub weight: f64,
}

impl Eligibility {
    const fn rejected(reason: Ineligibility) -> Self {
        Self {
            eligible: false,
            reason: Some(reason),
            weight: 0.0,
        }
    }
}

/// Pure scoring of health profiles against requests.
///
/// Weight only orders donors within a distance band; it never makes an
/// ineligible donor eligible.
pub struct EligibilityScorer;

impl EligibilityScorer {
    /// Scores `profile` for `request` as of `now`.
    #[must_use]
    pub fn score(profile: &HealthProfile, request: &BloodRequest, now: DateTime<Utc>) -> Eligibility {
        if let Some(reason) = Self::disqualifier(profile, request.blood_type_needed, now) {
            return Eligibility::rejected(reason);
        }

        let weight = RECENCY_WEIGHT * recency(profile, now)
            + FREQUENCY_WEIGHT * frequency(profile)
            + HEALTH_WEIGHT * health(profile);

        Eligibility {
            eligible: true,
            reason: None,
            weight: weight.clamp(0.0, 1.0),
        }
    }

    fn disqualifier(
        profile: &HealthProfile,
        needed: BloodType,
        now: DateTime<Utc>,
    ) -> Option<Ineligibility> {
        if !profile.blood_type.can_donate_to(needed) {
            return Some(Ineligibility::IncompatibleBloodType {
                donor: profile.blood_type,
                needed,
            });
        }
        if profile.is_eligible == Some(false) {
            return Some(Ineligibility::ManuallyDeferred);
        }
        if profile.conditions.has_infections {
            return Some(Ineligibility::ActiveInfection);
        }
        if let Some(days_since) = days_since_donation(profile, now)
            && days_since < MIN_DAYS_BETWEEN_DONATIONS
        {
            return Some(Ineligibility::DonatedRecently { days_since });
        }

        let comorbid = profile.conditions.has_hypertension || profile.conditions.has_diabetes;
        let recent_surgery = profile.surgery_date.map_or(
            profile.conditions.recent_surgeries,
            |date| (now - date).num_days() < SURGERY_LOOKBACK_DAYS,
        );
        if comorbid && recent_surgery {
            return Some(Ineligibility::ComorbidityWithRecentSurgery);
        }

        None
    }
}

fn days_since_donation(profile: &HealthProfile, now: DateTime<Utc>) -> Option<i64> {
    profile
        .last_donation_date
        .map(|date| (now - date).num_days())
}

#[allow(clippy::cast_precision_loss)]
fn recency(profile: &HealthProfile, now: DateTime<Utc>) -> f64 {
    days_since_donation(profile, now).map_or(1.0, |days| {
        let past_interval = (days - MIN_DAYS_BETWEEN_DONATIONS).clamp(0, RECENCY_CAP_DAYS);
        past_interval as f64 / RECENCY_CAP_DAYS as f64
    })
}

fn frequency(profile: &HealthProfile) -> f64 {
    f64::from(profile.donation_frequency.min(FREQUENCY_CAP)) / f64::from(FREQUENCY_CAP)
}

fn health(profile: &HealthProfile) -> f64 {
    f64::from(profile.conditions.comorbidity_count()).mul_add(-COMORBIDITY_PENALTY, 1.0)
}
