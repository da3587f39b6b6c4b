//! Expanding-radius candidate search.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bloodlink_database::Store;
use bloodlink_database_models::BloodRequest;
use bloodlink_spatial::{Coordinates, GeoIndex};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MatchError;
use crate::eligibility::EligibilityScorer;

/// Tunables for candidate search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchSettings {
    /// Expansion stops once this many eligible donors are found.
    pub min_candidates: usize,
    /// Largest radius ever searched.
    pub max_radius_m: f64,
    /// Width of the distance bands within which weight breaks ties.
    pub band_width_m: f64,
    /// Location reports older than this are ignored.
    pub staleness: Duration,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            min_candidates: 3,
            max_radius_m: 50_000.0,
            band_width_m: 500.0,
            staleness: Duration::minutes(30),
        }
    }
}

/// One ranked candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub donor_id: Uuid,
    pub distance_meters: f64,
    pub eligibility_score: f64,
    /// Donor was in emergency mode when found.
    pub emergency: bool,
}

/// Ranked candidates and the radius the search settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub matches: Vec<MatchResult>,
    pub radius_m: f64,
}

impl MatchOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Finds eligible, compatible donors near a request.
pub struct MatchEngine {
    index: Arc<GeoIndex>,
    store: Arc<dyn Store>,
    settings: MatchSettings,
}

impl MatchEngine {
    #[must_use]
    pub fn new(index: Arc<GeoIndex>, store: Arc<dyn Store>, settings: MatchSettings) -> Self {
        Self {
            index,
            store,
            settings,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    /// Searches outward from `request`'s location.
    ///
    /// The search starts at the larger of the urgency's initial radius and
    /// `start_radius_m`, doubling until at least `min_candidates` eligible
    /// donors are found or the radius cap has been searched. Donors in
    /// `exclude` are never returned. Each donor is scored at most once per
    /// call; donors with no health profile are skipped.
    ///
    /// # Errors
    ///
    /// * If the request's coordinates are invalid
    /// * If loading health profiles fails
    pub async fn find_matches(
        &self,
        request: &BloodRequest,
        exclude: &BTreeSet<Uuid>,
        start_radius_m: f64,
        now: DateTime<Utc>,
    ) -> Result<MatchOutcome, MatchError> {
        let center = Coordinates::new(request.latitude, request.longitude)?;
        let cap = self.settings.max_radius_m;
        let mut radius = request
            .urgency
            .initial_radius_m()
            .max(start_radius_m)
            .min(cap);

        let mut seen: BTreeSet<Uuid> = BTreeSet::new();
        let mut eligible: Vec<MatchResult> = Vec::new();

        loop {
            let fresh: Vec<_> = self
                .index
                .query_active(center, radius, now, self.settings.staleness)
                .into_iter()
                .filter(|n| !exclude.contains(&n.donor_id) && !seen.contains(&n.donor_id))
                .collect();

            if !fresh.is_empty() {
                let ids: Vec<Uuid> = fresh.iter().map(|n| n.donor_id).collect();
                let profiles = self.store.get_health_profiles(&ids).await?;

                for neighbor in fresh {
                    seen.insert(neighbor.donor_id);
                    let Some(profile) = profiles.get(&neighbor.donor_id) else {
                        log::debug!("Donor {} has no health profile, skipping", neighbor.donor_id);
                        continue;
                    };
                    let verdict = EligibilityScorer::score(profile, request, now);
                    if let Some(reason) = verdict.reason {
                        log::debug!(
                            "Donor {} ineligible for request {}: {reason}",
                            neighbor.donor_id,
                            request.id
                        );
                        continue;
                    }
                    eligible.push(MatchResult {
                        donor_id: neighbor.donor_id,
                        distance_meters: neighbor.distance_meters,
                        eligibility_score: verdict.weight,
                        emergency: neighbor.status.is_emergency(),
                    });
                }
            }

            if eligible.len() >= self.settings.min_candidates || radius >= cap {
                break;
            }
            radius = (radius * 2.0).min(cap);
        }

        let band_width = self.settings.band_width_m;
        eligible.sort_by(|a, b| rank(a, b, band_width));

        log::info!(
            "Request {}: {} eligible donors within {radius}m",
            request.id,
            eligible.len()
        );

        Ok(MatchOutcome {
            matches: eligible,
            radius_m: radius,
        })
    }
}

/// Ordering: distance band, emergency donors first, weight descending, then
/// exact distance and donor id.
fn rank(a: &MatchResult, b: &MatchResult, band_width: f64) -> Ordering {
    let band = |m: &MatchResult| (m.distance_meters / band_width).floor();
    band(a)
        .total_cmp(&band(b))
        .then_with(|| b.emergency.cmp(&a.emergency))
        .then_with(|| b.eligibility_score.total_cmp(&a.eligibility_score))
        .then_with(|| a.distance_meters.total_cmp(&b.distance_meters))
        .then_with(|| a.donor_id.cmp(&b.donor_id))
}

#[cfg(test)]
mod tests {
    use bloodlink_blood_models::{BloodType, DonationStatus, Urgency};
    use bloodlink_database::MemoryStore;
    use bloodlink_database_models::{HealthConditions, HealthProfile, RequestStatus};
    use bloodlink_spatial::{EARTH_RADIUS_M, LocationUpdate};

    use super::*;

    const LAT: f64 = 51.5074;
    const LON: f64 = -0.1278;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-10T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Fixture {
        index: Arc<GeoIndex>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                index: Arc::new(GeoIndex::new()),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn engine(&self) -> MatchEngine {
            MatchEngine::new(
                Arc::clone(&self.index),
                self.store.clone(),
                MatchSettings::default(),
            )
        }

        async fn donor(
            &self,
            blood_type: BloodType,
            meters_north: f64,
            status: DonationStatus,
        ) -> Uuid {
            let donor_id = Uuid::new_v4();
            let degrees = meters_north / (EARTH_RADIUS_M * std::f64::consts::PI / 180.0);
            self.index
                .upsert(&LocationUpdate {
                    donor_id,
                    latitude: LAT + degrees,
                    longitude: LON,
                    status,
                    is_visible: true,
                    timestamp: now(),
                })
                .unwrap();
            self.store
                .upsert_health_profile(&HealthProfile {
                    user_id: donor_id,
                    blood_type,
                    conditions: HealthConditions::default(),
                    surgery_date: None,
                    last_donation_date: None,
                    donation_frequency: 0,
                    is_eligible: None,
                    updated_at: now(),
                })
                .await
                .unwrap();
            donor_id
        }
    }

    fn request(needed: BloodType, urgency: Urgency) -> BloodRequest {
        BloodRequest {
            id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            blood_type_needed: needed,
            urgency,
            units_needed: 1,
            latitude: LAT,
            longitude: LON,
            location_name: None,
            contact_phone: None,
            notes: None,
            status: RequestStatus::Active,
            created_at: now(),
            updated_at: now(),
            expires_at: now() + Duration::hours(24),
        }
    }

    fn ids(outcome: &MatchOutcome) -> Vec<Uuid> {
        outcome.matches.iter().map(|m| m.donor_id).collect()
    }

    #[tokio::test]
    async fn critical_search_expands_to_cap_for_third_donor() {
        let fx = Fixture::new();
        let one = fx.donor(BloodType::ONegative, 1_000.0, DonationStatus::Available).await;
        let three = fx.donor(BloodType::ONegative, 3_000.0, DonationStatus::Available).await;
        let forty = fx.donor(BloodType::ONegative, 40_000.0, DonationStatus::Available).await;

        let outcome = fx
            .engine()
            .find_matches(
                &request(BloodType::ONegative, Urgency::Critical),
                &BTreeSet::new(),
                0.0,
                now(),
            )
            .await
            .unwrap();

        assert_eq!(ids(&outcome), vec![one, three, forty]);
        assert!((outcome.radius_m - 50_000.0).abs() < f64::EPSILON);
        assert!((outcome.matches[2].distance_meters - 40_000.0).abs() < 5.0);
    }

    #[tokio::test]
    async fn stops_expanding_once_enough_candidates() {
        let fx = Fixture::new();
        for meters in [500.0, 1_200.0, 1_800.0] {
            fx.donor(BloodType::APositive, meters, DonationStatus::Available)
                .await;
        }
        let outer = fx.donor(BloodType::APositive, 3_000.0, DonationStatus::Available).await;

        let outcome = fx
            .engine()
            .find_matches(
                &request(BloodType::APositive, Urgency::Critical),
                &BTreeSet::new(),
                0.0,
                now(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.matches.len(), 3);
        assert!(!ids(&outcome).contains(&outer));
        assert!((outcome.radius_m - 2_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn filters_incompatible_excluded_and_unprofiled_donors() {
        let fx = Fixture::new();
        let compatible = fx.donor(BloodType::OPositive, 1_000.0, DonationStatus::Available).await;
        fx.donor(BloodType::BPositive, 1_100.0, DonationStatus::Available)
            .await;
        let excluded = fx.donor(BloodType::OPositive, 1_200.0, DonationStatus::Available).await;

        let unprofiled = Uuid::new_v4();
        fx.index
            .upsert(&LocationUpdate {
                donor_id: unprofiled,
                latitude: LAT,
                longitude: LON,
                status: DonationStatus::Available,
                is_visible: true,
                timestamp: now(),
            })
            .unwrap();

        let outcome = fx
            .engine()
            .find_matches(
                &request(BloodType::APositive, Urgency::Low),
                &BTreeSet::from([excluded]),
                0.0,
                now(),
            )
            .await
            .unwrap();

        assert_eq!(ids(&outcome), vec![compatible]);
    }

    #[tokio::test]
    async fn empty_at_cap_is_a_normal_outcome() {
        let fx = Fixture::new();
        fx.donor(BloodType::ONegative, 60_000.0, DonationStatus::Available)
            .await;
        let outcome = fx
            .engine()
            .find_matches(
                &request(BloodType::ONegative, Urgency::High),
                &BTreeSet::new(),
                0.0,
                now(),
            )
            .await
            .unwrap();
        assert!(outcome.is_empty());
        assert!((outcome.radius_m - 50_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn start_radius_never_shrinks_the_search() {
        let fx = Fixture::new();
        let donor = fx.donor(BloodType::ONegative, 15_000.0, DonationStatus::Available).await;
        let outcome = fx
            .engine()
            .find_matches(
                &request(BloodType::ONegative, Urgency::Critical),
                &BTreeSet::new(),
                16_000.0,
                now(),
            )
            .await
            .unwrap();
        assert_eq!(ids(&outcome), vec![donor]);
        // 16 km -> 32 km -> 50 km, never back to 2 km.
        assert!((outcome.radius_m - 50_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn emergency_donors_lead_their_band_only() {
        let fx = Fixture::new();
        let near = fx.donor(BloodType::ONegative, 100.0, DonationStatus::Available).await;
        let emergency_same_band =
            fx.donor(BloodType::ONegative, 400.0, DonationStatus::EmergencyMode).await;
        let emergency_far = fx
            .donor(BloodType::ONegative, 1_700.0, DonationStatus::EmergencyMode)
            .await;

        let outcome = fx
            .engine()
            .find_matches(
                &request(BloodType::ONegative, Urgency::Critical),
                &BTreeSet::new(),
                0.0,
                now(),
            )
            .await
            .unwrap();

        assert_eq!(ids(&outcome), vec![emergency_same_band, near, emergency_far]);
    }

    #[test]
    fn weight_breaks_ties_inside_a_band() {
        let close = MatchResult {
            donor_id: Uuid::new_v4(),
            distance_meters: 510.0,
            eligibility_score: 0.3,
            emergency: false,
        };
        let heavier = MatchResult {
            donor_id: Uuid::new_v4(),
            distance_meters: 990.0,
            eligibility_score: 0.9,
            emergency: false,
        };
        let next_band = MatchResult {
            donor_id: Uuid::new_v4(),
            distance_meters: 1_001.0,
            eligibility_score: 1.0,
            emergency: true,
        };

        let mut ranked = vec![next_band, close, heavier];
        ranked.sort_by(|a, b| rank(a, b, 500.0));
        assert_eq!(ranked, vec![heavier, close, next_band]);
    }
}
