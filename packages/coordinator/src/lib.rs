#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Emergency blood request coordination.
//!
//! [`Coordinator`] ties together the spatial index fed by donor location
//! reports, the match engine, the [`dispatcher::AlertDispatcher`] that runs
//! alert rounds, and the [`lifecycle::RequestLifecycle`] state machine.
//! Every core operation takes `now` explicitly; only the background sweeper
//! and round timers read the wall clock.

pub mod config;
pub mod dispatcher;
pub mod lifecycle;
pub mod notifier;
pub mod roles;
mod slots;
pub mod sweep;

use std::sync::Arc;

use bloodlink_blood_models::{DonationStatus, UserRole};
use bloodlink_database::{DbError, Store};
use bloodlink_database_models::{
    AlertRecord, BloodRequest, DonorLocation, DonorStats, HealthProfile, RequestStatus,
};
use bloodlink_matching::{MatchEngine, MatchError};
use bloodlink_spatial::{Coordinates, GeoIndex, LocationUpdate, SpatialError, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::dispatcher::{AlertDispatcher, DonorResponse, ResponseOutcome};
use crate::lifecycle::{
    CreatedRequest, Fulfillment, FulfillmentDetails, NewRequest, RequestLifecycle, SweepReport,
};
use crate::notifier::Notifier;
use crate::roles::{Actor, Capability};
use crate::slots::RequestSlots;

/// Largest radius a donor may browse requests within.
pub const MAX_NEARBY_RADIUS_M: f64 = 100_000.0;

/// Input rejected before any state changed.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("units_needed must be at least 1")]
    UnitsNeeded,

    #[error(transparent)]
    Location(#[from] SpatialError),

    #[error("expires_at {expires_at} is not after {now}")]
    ExpiryNotInFuture {
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("radius must be positive and at most {max}m, got {radius_m}m")]
    Radius { radius_m: f64, max: f64 },
}

/// Errors surfaced by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{role} may not {capability:?}")]
    Forbidden {
        role: UserRole,
        capability: Capability,
    },

    #[error("No {kind} with id {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Cannot move request from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error(transparent)]
    Store(#[from] DbError),
}

impl From<MatchError> for CoordinatorError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::Location(e) => Self::Validation(ValidationError::Location(e)),
            MatchError::Store(e) => Self::Store(e),
        }
    }
}

/// An active request near a donor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyRequest {
    pub request: BloodRequest,
    pub distance_meters: f64,
}

/// Entry point for every external event.
pub struct Coordinator {
    index: Arc<GeoIndex>,
    store: Arc<dyn Store>,
    dispatcher: Arc<AlertDispatcher>,
    lifecycle: RequestLifecycle,
    config: CoordinatorConfig,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: CoordinatorConfig,
    ) -> Self {
        let index = Arc::new(GeoIndex::new());
        let slots = Arc::new(RequestSlots::default());
        let engine = MatchEngine::new(
            Arc::clone(&index),
            Arc::clone(&store),
            config.matching.settings(),
        );
        let dispatcher = Arc::new(AlertDispatcher::new(
            Arc::clone(&store),
            engine,
            notifier,
            config.dispatch.clone(),
            Arc::clone(&slots),
        ));
        let lifecycle = RequestLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            slots,
            config.lifecycle.clone(),
        );

        Self {
            index,
            store,
            dispatcher,
            lifecycle,
            config,
        }
    }

    #[must_use]
    pub const fn index(&self) -> &Arc<GeoIndex> {
        &self.index
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    /// Loads persisted donor locations into the spatial index. Returns how
    /// many were applied.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Store`] if locations cannot be listed.
    pub async fn warm_up(&self) -> Result<usize, CoordinatorError> {
        let mut applied = 0;
        for location in self.store.list_donor_locations().await? {
            match self.index.upsert(&LocationUpdate {
                donor_id: location.donor_id,
                latitude: location.latitude,
                longitude: location.longitude,
                status: location.status,
                is_visible: location.is_visible,
                timestamp: location.last_active,
            }) {
                Ok(UpsertOutcome::Applied) => applied += 1,
                Ok(_) => {}
                Err(e) => log::warn!("Skipping stored location of {}: {e}", location.donor_id),
            }
        }
        log::info!("Warmed spatial index with {applied} donor locations");
        Ok(applied)
    }

    /// Applies a donor location report and persists it unless it was older
    /// than what the index held.
    ///
    /// Unchanged reports are written again so a failed earlier write can be
    /// retried; the store keeps whichever row is newest.
    ///
    /// # Errors
    ///
    /// * If the caller may not report this donor's location
    /// * If the coordinates are invalid
    /// * If persisting the location fails
    pub async fn on_location_update(
        &self,
        actor: &Actor,
        update: LocationUpdate,
    ) -> Result<UpsertOutcome, CoordinatorError> {
        actor.require_owner_or(update.donor_id, Capability::ShareLocation, Capability::ActForDonors)?;

        let outcome = self.index.upsert(&update).map_err(ValidationError::from)?;
        if outcome != UpsertOutcome::Stale {
            let written = self
                .store
                .upsert_donor_location(&DonorLocation {
                    donor_id: update.donor_id,
                    latitude: update.latitude,
                    longitude: update.longitude,
                    status: update.status,
                    is_visible: update.is_visible,
                    last_active: update.timestamp,
                })
                .await?;
            if !written {
                log::debug!("Stored location of donor {} is newer, kept it", update.donor_id);
            }
        }
        if outcome == UpsertOutcome::Applied {
            log::debug!(
                "Donor {} now {} at ({}, {}), visible={}",
                update.donor_id,
                update.status,
                update.latitude,
                update.longitude,
                update.is_visible
            );
        }
        Ok(outcome)
    }

    /// Stores a health profile.
    ///
    /// Donors may only write their own profile and cannot change the
    /// reviewer eligibility override; hospitals and admins may write any.
    ///
    /// # Errors
    ///
    /// * If the caller may not edit this profile
    /// * If the write fails
    pub async fn upsert_health_profile(
        &self,
        actor: &Actor,
        mut profile: HealthProfile,
        now: DateTime<Utc>,
    ) -> Result<HealthProfile, CoordinatorError> {
        actor.require_owner_or(
            profile.user_id,
            Capability::MaintainOwnHealthProfile,
            Capability::ReviewHealthProfiles,
        )?;

        if !actor.can(Capability::ReviewHealthProfiles) {
            profile.is_eligible = self
                .store
                .get_health_profiles(&[profile.user_id])
                .await?
                .remove(&profile.user_id)
                .and_then(|stored| stored.is_eligible);
        }
        profile.updated_at = now;
        self.store.upsert_health_profile(&profile).await?;
        Ok(profile)
    }

    /// Creates a request and runs its first round.
    ///
    /// # Errors
    ///
    /// See [`RequestLifecycle::create`].
    pub async fn create_request(
        &self,
        actor: &Actor,
        new: NewRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedRequest, CoordinatorError> {
        self.lifecycle.create(actor, new, now).await
    }

    /// # Errors
    ///
    /// * If the caller may not view requests
    /// * See [`RequestLifecycle::get`]
    pub async fn get_request(
        &self,
        actor: &Actor,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<BloodRequest, CoordinatorError> {
        actor.require(Capability::ViewRequests)?;
        self.lifecycle.get(id, now).await
    }

    /// Every alert sent for a request, visible to its owner and to
    /// hospitals.
    ///
    /// # Errors
    ///
    /// * If the request does not exist
    /// * If the caller may not inspect this request
    /// * If the read fails
    pub async fn alerts_for_request(
        &self,
        actor: &Actor,
        id: Uuid,
    ) -> Result<Vec<AlertRecord>, CoordinatorError> {
        let request = self
            .store
            .get_request(id)
            .await?
            .ok_or(CoordinatorError::NotFound {
                kind: "request",
                id,
            })?;
        actor.require_owner_or(
            request.recipient_id,
            Capability::ManageOwnRequest,
            Capability::ManageAnyRequest,
        )?;
        Ok(self.store.list_alerts_for_request(id).await?)
    }

    /// Records a donor's answer to an alert.
    ///
    /// # Errors
    ///
    /// * If the alert does not exist
    /// * If the caller is not the alerted donor
    /// * See [`AlertDispatcher::record_response`]
    pub async fn donor_responds(
        &self,
        actor: &Actor,
        alert_id: Uuid,
        response: DonorResponse,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome, CoordinatorError> {
        let alert = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or(CoordinatorError::NotFound {
                kind: "alert",
                id: alert_id,
            })?;
        actor.require_owner_or(alert.donor_id, Capability::RespondToAlert, Capability::ActForDonors)?;
        self.dispatcher.record_response(alert_id, response, now).await
    }

    /// # Errors
    ///
    /// See [`RequestLifecycle::cancel`].
    pub async fn cancel_request(
        &self,
        actor: &Actor,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<BloodRequest, CoordinatorError> {
        self.lifecycle.cancel(actor, id, now).await
    }

    /// # Errors
    ///
    /// See [`RequestLifecycle::fulfill`].
    pub async fn fulfill_request(
        &self,
        actor: &Actor,
        id: Uuid,
        details: FulfillmentDetails,
        now: DateTime<Utc>,
    ) -> Result<Fulfillment, CoordinatorError> {
        self.lifecycle.fulfill(actor, id, details, now).await
    }

    /// Active requests within `radius_m` of the calling donor that the
    /// donor's blood type can serve, nearest first.
    ///
    /// # Errors
    ///
    /// * If the caller may not browse requests
    /// * If the radius is out of range
    /// * If the donor has never reported a location
    /// * If a read fails
    pub async fn nearby_requests(
        &self,
        actor: &Actor,
        radius_m: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<NearbyRequest>, CoordinatorError> {
        actor.require(Capability::ViewNearbyRequests)?;
        if !(radius_m > 0.0 && radius_m <= MAX_NEARBY_RADIUS_M) {
            return Err(ValidationError::Radius {
                radius_m,
                max: MAX_NEARBY_RADIUS_M,
            }
            .into());
        }

        let donor = self
            .index
            .get(actor.user_id)
            .ok_or(CoordinatorError::NotFound {
                kind: "location for donor",
                id: actor.user_id,
            })?;
        let blood_type = self
            .store
            .get_health_profiles(&[actor.user_id])
            .await?
            .remove(&actor.user_id)
            .map(|p| p.blood_type);

        let mut nearby: Vec<NearbyRequest> = self
            .store
            .list_requests_by_status(RequestStatus::Active)
            .await?
            .into_iter()
            .filter(|r| !r.is_past_deadline(now))
            .filter(|r| blood_type.is_none_or(|t| t.can_donate_to(r.blood_type_needed)))
            .filter_map(|request| {
                let site = Coordinates::new(request.latitude, request.longitude).ok()?;
                let distance_meters = donor.coordinates.distance_to(site);
                (distance_meters <= radius_m).then_some(NearbyRequest {
                    request,
                    distance_meters,
                })
            })
            .collect();
        nearby.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.request.id.cmp(&b.request.id))
        });
        Ok(nearby)
    }

    /// A donor's counters; zeros if they have never donated.
    ///
    /// # Errors
    ///
    /// * If the caller may not view requests
    /// * If the read fails
    pub async fn donor_stats(
        &self,
        actor: &Actor,
        donor_id: Uuid,
    ) -> Result<DonorStats, CoordinatorError> {
        actor.require(Capability::ViewRequests)?;
        Ok(self
            .store
            .get_donor_stats(donor_id)
            .await?
            .unwrap_or_else(|| DonorStats {
                donor_id,
                ..DonorStats::default()
            }))
    }

    /// # Errors
    ///
    /// See [`RequestLifecycle::sweep`].
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CoordinatorError> {
        self.lifecycle.sweep(now).await
    }

    /// Whether a donor could currently be alerted at all.
    #[must_use]
    pub fn donor_reachable(&self, donor_id: Uuid) -> bool {
        self.index
            .get(donor_id)
            .is_some_and(|d| d.is_visible && d.status != DonationStatus::Unavailable)
    }
}


#[cfg(test)]
mod tests {
    use bloodlink_blood_models::{BloodType, DonationStatus, Urgency};
    use bloodlink_database_models::{AlertStatus, HealthConditions};
    use chrono::Duration;

    use super::testing::{Harness, LAT, LON, donor, t0};
    use super::*;
    use crate::dispatcher::DispatchOutcome;

    #[tokio::test]
    async fn location_updates_are_persisted_and_replays_ignored() {
        let h = Harness::new();
        let id = Uuid::new_v4();
        let update = LocationUpdate {
            donor_id: id,
            latitude: LAT,
            longitude: LON,
            status: DonationStatus::Available,
            is_visible: true,
            timestamp: t0(),
        };
        let outcome = h.coordinator.on_location_update(&donor(id), update).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Applied);
        let outcome = h.coordinator.on_location_update(&donor(id), update).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert!(h.store.get_donor_location(id).await.unwrap().is_some());
        assert!(h.coordinator.donor_reachable(id));
    }

    #[tokio::test]
    async fn failed_location_write_is_retried_by_the_next_report() {
        let h = Harness::new();
        let id = Uuid::new_v4();
        let update = LocationUpdate {
            donor_id: id,
            latitude: LAT,
            longitude: LON,
            status: DonationStatus::Available,
            is_visible: true,
            timestamp: t0(),
        };

        h.faults.fail_next_location();
        assert!(matches!(
            h.coordinator.on_location_update(&donor(id), update).await,
            Err(CoordinatorError::Store(_))
        ));
        assert!(h.store.get_donor_location(id).await.unwrap().is_none());

        let outcome = h.coordinator.on_location_update(&donor(id), update).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        let stored = h.store.get_donor_location(id).await.unwrap().unwrap();
        assert_eq!(stored.last_active, t0());
    }

    #[tokio::test]
    async fn warm_up_never_restores_an_older_location() {
        let h = Harness::new();
        let id = Uuid::new_v4();
        let older = LocationUpdate {
            donor_id: id,
            latitude: LAT,
            longitude: LON,
            status: DonationStatus::Available,
            is_visible: true,
            timestamp: t0(),
        };
        let newer = LocationUpdate {
            latitude: LAT + 0.01,
            timestamp: t0() + Duration::minutes(5),
            ..older
        };
        h.coordinator.on_location_update(&donor(id), newer).await.unwrap();

        // The earlier report reaching the store last must not win.
        let written = h
            .store
            .upsert_donor_location(&DonorLocation {
                donor_id: id,
                latitude: older.latitude,
                longitude: older.longitude,
                status: older.status,
                is_visible: older.is_visible,
                last_active: older.timestamp,
            })
            .await
            .unwrap();
        assert!(!written);

        let fresh = Coordinator::new(
            h.store.clone(),
            h.notifier.clone(),
            h.coordinator.config().clone(),
        );
        fresh.warm_up().await.unwrap();
        assert_eq!(fresh.index().get(id).unwrap().last_active, newer.timestamp);
    }

    #[tokio::test]
    async fn location_update_rejects_other_donors_and_bad_coordinates() {
        let h = Harness::new();
        let id = Uuid::new_v4();
        let mut update = LocationUpdate {
            donor_id: id,
            latitude: LAT,
            longitude: LON,
            status: DonationStatus::Available,
            is_visible: true,
            timestamp: t0(),
        };
        let someone_else = donor(Uuid::new_v4());
        assert!(matches!(
            h.coordinator.on_location_update(&someone_else, update).await,
            Err(CoordinatorError::Forbidden { .. })
        ));

        update.latitude = 123.0;
        assert!(matches!(
            h.coordinator.on_location_update(&donor(id), update).await,
            Err(CoordinatorError::Validation(ValidationError::Location(_)))
        ));
        assert!(h.store.get_donor_location(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn warm_up_restores_index_from_store() {
        let h = Harness::new();
        let id = h.available(BloodType::APositive, 1_000.0).await;

        let fresh = Coordinator::new(
            h.store.clone(),
            h.notifier.clone(),
            h.coordinator.config().clone(),
        );
        assert!(fresh.index().is_empty());
        assert_eq!(fresh.warm_up().await.unwrap(), 1);
        assert!(fresh.index().get(id).is_some());
    }

    #[tokio::test]
    async fn donors_cannot_lift_their_own_deferral() {
        let h = Harness::new();
        let id = h.available(BloodType::ONegative, 100.0).await;

        let mut profile = HealthProfile {
            user_id: id,
            blood_type: BloodType::ONegative,
            conditions: HealthConditions::default(),
            surgery_date: None,
            last_donation_date: None,
            donation_frequency: 2,
            is_eligible: Some(false),
            updated_at: t0(),
        };
        h.coordinator
            .upsert_health_profile(&h.hospital, profile.clone(), t0())
            .await
            .unwrap();

        profile.is_eligible = Some(true);
        let stored = h
            .coordinator
            .upsert_health_profile(&donor(id), profile.clone(), t0())
            .await
            .unwrap();
        assert_eq!(stored.is_eligible, Some(false));

        assert!(matches!(
            h.coordinator
                .upsert_health_profile(&donor(Uuid::new_v4()), profile, t0())
                .await,
            Err(CoordinatorError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn nearby_requests_filters_by_radius_type_and_deadline() {
        let h = Harness::new();
        let me = h.available(BloodType::ANegative, 0.0).await;

        let mut close = Harness::new_request(BloodType::APositive, Urgency::Low);
        close.latitude = LAT + 0.01;
        let close = h
            .coordinator
            .create_request(&h.hospital, close, t0())
            .await
            .unwrap()
            .request;

        let mut far = Harness::new_request(BloodType::APositive, Urgency::Low);
        far.latitude = LAT + 1.0;
        h.coordinator.create_request(&h.hospital, far, t0()).await.unwrap();

        let wrong_type = Harness::new_request(BloodType::BPositive, Urgency::Low);
        h.coordinator
            .create_request(&h.hospital, wrong_type, t0())
            .await
            .unwrap();

        let nearby = h
            .coordinator
            .nearby_requests(&donor(me), 10_000.0, t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(nearby.len(), 1);
        assert_eq!(nearby[0].request.id, close.id);
        assert!((nearby[0].distance_meters - 1_112.0).abs() < 5.0);

        let later = t0() + Duration::hours(7);
        assert!(
            h.coordinator
                .nearby_requests(&donor(me), 10_000.0, later)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            h.coordinator.nearby_requests(&donor(me), 0.0, t0()).await,
            Err(CoordinatorError::Validation(ValidationError::Radius { .. }))
        ));
    }

    #[tokio::test]
    async fn full_request_journey() {
        let h = Harness::new();
        let giver = h.available(BloodType::ONegative, 800.0).await;

        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::BPositive, Urgency::High),
                t0(),
            )
            .await
            .unwrap();
        assert!(matches!(created.dispatch, DispatchOutcome::Dispatched { round: 1, notified: 1, .. }));
        assert_eq!(h.notifier.donors(), vec![giver]);

        let alert = h.alert_for(created.request.id, giver).await;
        assert_eq!(alert.status, AlertStatus::Notified);

        let outcome = h
            .coordinator
            .donor_responds(&donor(giver), alert.id, DonorResponse::Accept, t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ResponseOutcome::Matched {
                request_id: created.request.id
            }
        );

        let fulfillment = h
            .coordinator
            .fulfill_request(
                &h.hospital,
                created.request.id,
                FulfillmentDetails {
                    hospital_name: Some("County General".to_string()),
                    units_donated: None,
                },
                t0() + Duration::hours(2),
            )
            .await
            .unwrap();
        assert_eq!(fulfillment.request.status, RequestStatus::Fulfilled);
        assert_eq!(fulfillment.donation.donor_id, giver);
        assert_eq!(fulfillment.donor_stats.total_donations, 1);

        let stats = h.coordinator.donor_stats(&donor(giver), giver).await.unwrap();
        assert_eq!(stats.total_donations, 1);
        assert_eq!(stats.last_donation_date, Some(t0() + Duration::hours(2)));
        assert_eq!(h.store.donation_count(), 1);

        let alerts = h
            .coordinator
            .alerts_for_request(&h.hospital, created.request.id)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Accepted);
    }

    #[tokio::test]
    async fn only_the_alerted_donor_may_respond() {
        let h = Harness::new();
        let giver = h.available(BloodType::OPositive, 300.0).await;
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::OPositive, Urgency::Medium),
                t0(),
            )
            .await
            .unwrap();
        let alert = h.alert_for(created.request.id, giver).await;

        let intruder = donor(Uuid::new_v4());
        assert!(matches!(
            h.coordinator
                .donor_responds(&intruder, alert.id, DonorResponse::Accept, t0())
                .await,
            Err(CoordinatorError::Forbidden { .. })
        ));
        assert!(matches!(
            h.coordinator
                .donor_responds(&intruder, Uuid::new_v4(), DonorResponse::Accept, t0())
                .await,
            Err(CoordinatorError::NotFound { kind: "alert", .. })
        ));
    }

    #[tokio::test]
    async fn donor_stats_default_to_zero() {
        let h = Harness::new();
        let id = Uuid::new_v4();
        let stats = h.coordinator.donor_stats(&donor(id), id).await.unwrap();
        assert_eq!(stats.donor_id, id);
        assert_eq!(stats.total_donations, 0);
        assert_eq!(stats.last_donation_date, None);
    }
}
