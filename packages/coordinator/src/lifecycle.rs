//! Blood request state machine: creation, expiry, cancellation,
//! fulfilment, and the periodic sweep.

use std::collections::BTreeSet;
use std::sync::Arc;

use bloodlink_blood_models::{BloodType, Urgency};
use bloodlink_database::Store;
use bloodlink_database_models::{
    AlertStatus, BloodRequest, DonationRecord, DonorStats, RequestStatus,
};
use bloodlink_spatial::Coordinates;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::dispatcher::{AlertDispatcher, DispatchOutcome};
use crate::roles::{Actor, Capability};
use crate::slots::{RequestSlots, SlotState};
use crate::{CoordinatorError, ValidationError};

/// Intake payload for a new request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequest {
    pub blood_type_needed: BloodType,
    pub urgency: Urgency,
    pub units_needed: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub location_name: Option<String>,
    pub contact_phone: Option<String>,
    pub notes: Option<String>,
    /// Defaults to the configured lifetime from creation.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedRequest {
    pub request: BloodRequest,
    /// Outcome of the first round, run before returning.
    pub dispatch: DispatchOutcome,
}

/// Details a hospital supplies when confirming a donation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentDetails {
    pub hospital_name: Option<String>,
    /// Defaults to the request's `units_needed`.
    pub units_donated: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub request: BloodRequest,
    pub donation: DonationRecord,
    pub donor_stats: DonorStats,
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub timed_out_rounds: usize,
    pub redispatched: usize,
    /// Slots dropped because their request left the active state.
    pub retired_slots: usize,
}

/// Expires `request` if it is active and past its deadline.
///
/// Returns the request as it now stands and whether this call expired it.
/// Must be called with the request's lock held.
pub(crate) async fn expire_if_due(
    store: &dyn Store,
    mut request: BloodRequest,
    state: &mut SlotState,
    now: DateTime<Utc>,
) -> Result<(BloodRequest, bool), CoordinatorError> {
    if request.status != RequestStatus::Active || !request.is_past_deadline(now) {
        return Ok((request, false));
    }

    if !store
        .transition_request(request.id, &[RequestStatus::Active], RequestStatus::Expired, now)
        .await?
    {
        let current = store
            .get_request(request.id)
            .await?
            .ok_or(CoordinatorError::NotFound {
                kind: "request",
                id: request.id,
            })?;
        return Ok((current, false));
    }

    let timed_out = store
        .transition_request_alerts(request.id, AlertStatus::OUTSTANDING, AlertStatus::TimedOut, now)
        .await?;
    state.retire_round(now);
    log::info!(
        "Request {} expired unmatched ({timed_out} alerts timed out)",
        request.id
    );

    request.status = RequestStatus::Expired;
    request.updated_at = now;
    Ok((request, true))
}

/// Owns request state transitions.
pub struct RequestLifecycle {
    store: Arc<dyn Store>,
    dispatcher: Arc<AlertDispatcher>,
    slots: Arc<RequestSlots>,
    config: LifecycleConfig,
}

impl RequestLifecycle {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<AlertDispatcher>,
        slots: Arc<RequestSlots>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            slots,
            config,
        }
    }

    async fn load(&self, id: Uuid) -> Result<BloodRequest, CoordinatorError> {
        self.store
            .get_request(id)
            .await?
            .ok_or(CoordinatorError::NotFound {
                kind: "request",
                id,
            })
    }

    /// Validates and stores a request, then runs its first round.
    ///
    /// # Errors
    ///
    /// * If the caller may not create requests
    /// * If the payload fails validation
    /// * If a store operation fails
    pub async fn create(
        &self,
        actor: &Actor,
        new: NewRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedRequest, CoordinatorError> {
        actor.require(Capability::CreateRequest)?;

        if new.units_needed < 1 {
            return Err(ValidationError::UnitsNeeded.into());
        }
        Coordinates::new(new.latitude, new.longitude).map_err(ValidationError::from)?;
        let expires_at = new
            .expires_at
            .unwrap_or_else(|| now + Duration::hours(self.config.default_lifetime_hours));
        if expires_at <= now {
            return Err(ValidationError::ExpiryNotInFuture { expires_at, now }.into());
        }

        let request = BloodRequest {
            id: Uuid::new_v4(),
            recipient_id: actor.user_id,
            blood_type_needed: new.blood_type_needed,
            urgency: new.urgency,
            units_needed: new.units_needed,
            latitude: new.latitude,
            longitude: new.longitude,
            location_name: new.location_name,
            contact_phone: new.contact_phone,
            notes: new.notes,
            status: RequestStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at,
        };
        self.store.insert_request(&request).await?;
        log::info!(
            "Created {} request {} for {} x{} (expires {expires_at})",
            request.urgency,
            request.id,
            request.blood_type_needed,
            request.units_needed
        );

        let slot = self.slots.get(request.id);
        let mut state = slot.lock().await;
        let dispatch = self
            .dispatcher
            .dispatch_locked(&request, &mut state, now)
            .await?;

        Ok(CreatedRequest { request, dispatch })
    }

    /// Fetches a request, expiring it first if its deadline passed.
    ///
    /// # Errors
    ///
    /// * If the request does not exist
    /// * If a store operation fails
    pub async fn get(&self, id: Uuid, now: DateTime<Utc>) -> Result<BloodRequest, CoordinatorError> {
        let request = self.load(id).await?;
        if request.status != RequestStatus::Active || !request.is_past_deadline(now) {
            return Ok(request);
        }

        let slot = self.slots.get(id);
        let mut state = slot.lock().await;
        let request = self.load(id).await?;
        let (request, expired) =
            expire_if_due(self.store.as_ref(), request, &mut state, now).await?;
        drop(state);
        if expired {
            self.slots.release(id);
        }
        Ok(request)
    }

    /// Withdraws an active or matched request.
    ///
    /// # Errors
    ///
    /// * If the request does not exist
    /// * If the caller neither owns the request nor may cancel any request
    /// * If the request is already terminal
    /// * If a store operation fails
    pub async fn cancel(
        &self,
        actor: &Actor,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<BloodRequest, CoordinatorError> {
        let slot = self.slots.for_status(id, self.load(id).await?.status);
        let mut state = slot.lock().await;
        let request = self.load(id).await?;
        actor.require_owner_or(
            request.recipient_id,
            Capability::ManageOwnRequest,
            Capability::ManageAnyRequest,
        )?;

        let (mut request, _) =
            expire_if_due(self.store.as_ref(), request, &mut state, now).await?;
        if !request.status.can_transition_to(RequestStatus::Cancelled)
            || !self
                .store
                .transition_request(
                    id,
                    &[RequestStatus::Active, RequestStatus::Matched],
                    RequestStatus::Cancelled,
                    now,
                )
                .await?
        {
            return Err(CoordinatorError::InvalidTransition {
                from: self.load(id).await?.status,
                to: RequestStatus::Cancelled,
            });
        }

        let superseded = self
            .store
            .transition_request_alerts(id, AlertStatus::OUTSTANDING, AlertStatus::Superseded, now)
            .await?;
        state.retire_round(now);
        log::info!(
            "Request {id} cancelled by {} {} ({superseded} alerts superseded)",
            actor.role,
            actor.user_id
        );

        request.status = RequestStatus::Cancelled;
        request.updated_at = now;
        drop(state);
        self.slots.release(id);
        Ok(request)
    }

    /// Confirms the accepted donor gave blood, closing the request.
    ///
    /// # Errors
    ///
    /// * If the caller may not confirm donations
    /// * If the request does not exist or has no accepted donor
    /// * If the request is not matched
    /// * If a store operation fails
    pub async fn fulfill(
        &self,
        actor: &Actor,
        id: Uuid,
        details: FulfillmentDetails,
        now: DateTime<Utc>,
    ) -> Result<Fulfillment, CoordinatorError> {
        actor.require(Capability::ConfirmFulfillment)?;

        let slot = self.slots.for_status(id, self.load(id).await?.status);
        let state = slot.lock().await;
        let mut request = self.load(id).await?;
        if request.status != RequestStatus::Matched {
            return Err(CoordinatorError::InvalidTransition {
                from: request.status,
                to: RequestStatus::Fulfilled,
            });
        }

        let donor_id = self
            .store
            .list_alerts_for_request(id)
            .await?
            .into_iter()
            .find(|a| a.status == AlertStatus::Accepted)
            .map(|a| a.donor_id)
            .ok_or(CoordinatorError::NotFound {
                kind: "accepted alert for request",
                id,
            })?;

        if !self
            .store
            .transition_request(id, &[RequestStatus::Matched], RequestStatus::Fulfilled, now)
            .await?
        {
            return Err(CoordinatorError::InvalidTransition {
                from: self.load(id).await?.status,
                to: RequestStatus::Fulfilled,
            });
        }

        let donation = DonationRecord {
            id: Uuid::new_v4(),
            donor_id,
            recipient_id: Some(request.recipient_id),
            request_id: Some(id),
            units_donated: details.units_donated.unwrap_or(request.units_needed),
            hospital_name: details.hospital_name,
            donation_date: now,
        };
        let donor_stats = self.store.record_donation(&donation).await?;
        log::info!(
            "Request {id} fulfilled by donor {donor_id} ({} total donations)",
            donor_stats.total_donations
        );

        request.status = RequestStatus::Fulfilled;
        request.updated_at = now;
        drop(state);
        self.slots.release(id);
        Ok(Fulfillment {
            request,
            donation,
            donor_stats,
        })
    }

    /// Expires overdue requests, closes rounds past their deadline, retries
    /// idle requests, and drops slots of requests that are no longer active.
    ///
    /// A failure on one request is logged and the pass moves on.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Store`] if active requests cannot be
    /// listed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CoordinatorError> {
        let mut report = SweepReport::default();
        let active = self
            .store
            .list_requests_by_status(RequestStatus::Active)
            .await?;
        for request in &active {
            if let Err(e) = self.sweep_one(request.id, now, &mut report).await {
                log::error!("Sweep failed for request {}: {e}", request.id);
            }
        }

        let listed: BTreeSet<Uuid> = active.iter().map(|r| r.id).collect();
        for id in self.slots.unheld() {
            if listed.contains(&id) {
                continue;
            }
            match self.store.get_request(id).await {
                Ok(Some(request)) if request.status == RequestStatus::Active => {}
                Ok(_) => {
                    if self.slots.release_if_unheld(id) {
                        report.retired_slots += 1;
                    }
                }
                Err(e) => log::error!("Sweep could not check request {id}: {e}"),
            }
        }

        if report != SweepReport::default() {
            log::info!(
                "Sweep: {} expired, {} rounds timed out, {} redispatched, {} slots retired, {} requests tracked",
                report.expired,
                report.timed_out_rounds,
                report.redispatched,
                report.retired_slots,
                self.slots.len()
            );
        }
        Ok(report)
    }

    async fn sweep_one(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), CoordinatorError> {
        let slot = self.slots.get(id);
        let mut state = slot.lock().await;
        let request = self.load(id).await?;
        let (request, expired) =
            expire_if_due(self.store.as_ref(), request, &mut state, now).await?;
        if expired {
            report.expired += 1;
            drop(state);
            self.slots.release(id);
            return Ok(());
        }
        if request.status != RequestStatus::Active {
            return Ok(());
        }

        let retry_after = Duration::seconds(self.config.idle_retry_secs);
        let due = match state.round.as_ref().map(|round| round.deadline) {
            Some(deadline) if deadline <= now => {
                report.timed_out_rounds += 1;
                self.dispatcher.close_round_locked(&mut state, now).await?;
                true
            }
            Some(_) => false,
            None => state
                .idle_since
                .is_none_or(|since| now - since >= retry_after),
        };
        if !due {
            return Ok(());
        }

        let outcome = self
            .dispatcher
            .dispatch_locked(&request, &mut state, now)
            .await?;
        if matches!(outcome, DispatchOutcome::Dispatched { .. }) {
            report.redispatched += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bloodlink_blood_models::UserRole;

    use super::*;
    use crate::dispatcher::{DonorResponse, ResponseOutcome};
    use crate::testing::{Harness, donor, t0};

    #[tokio::test]
    async fn create_validates_input() {
        let h = Harness::new();
        let c = &h.coordinator;

        let mut bad = Harness::new_request(BloodType::APositive, Urgency::High);
        bad.units_needed = 0;
        assert!(matches!(
            c.create_request(&h.hospital, bad, t0()).await,
            Err(CoordinatorError::Validation(ValidationError::UnitsNeeded))
        ));

        let mut bad = Harness::new_request(BloodType::APositive, Urgency::High);
        bad.longitude = 181.0;
        assert!(matches!(
            c.create_request(&h.hospital, bad, t0()).await,
            Err(CoordinatorError::Validation(ValidationError::Location(_)))
        ));

        let mut bad = Harness::new_request(BloodType::APositive, Urgency::High);
        bad.expires_at = Some(t0());
        assert!(matches!(
            c.create_request(&h.hospital, bad, t0()).await,
            Err(CoordinatorError::Validation(ValidationError::ExpiryNotInFuture { .. }))
        ));

        let donor_actor = donor(Uuid::new_v4());
        assert!(matches!(
            c.create_request(
                &donor_actor,
                Harness::new_request(BloodType::APositive, Urgency::High),
                t0()
            )
            .await,
            Err(CoordinatorError::Forbidden { .. })
        ));
        assert!(
            h.store
                .list_requests_by_status(RequestStatus::Active)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn expiry_defaults_to_configured_lifetime() {
        let h = Harness::new();
        let mut new = Harness::new_request(BloodType::OPositive, Urgency::Low);
        new.expires_at = None;
        let created = h
            .coordinator
            .create_request(&h.hospital, new, t0())
            .await
            .unwrap();
        assert_eq!(created.request.expires_at, t0() + Duration::hours(24));
        assert_eq!(created.dispatch, DispatchOutcome::NoCandidatesFound);
        assert_eq!(created.request.recipient_id, h.hospital.user_id);
    }

    #[tokio::test]
    async fn requests_expire_exactly_once() {
        let h = Harness::new();
        let giver = h.available(BloodType::OPositive, 500.0).await;
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::OPositive, Urgency::High),
                t0(),
            )
            .await
            .unwrap();
        let id = created.request.id;
        let after = created.request.expires_at;

        let report = h.coordinator.sweep(after).await.unwrap();
        assert_eq!(report.expired, 1);
        let report = h.coordinator.sweep(after + Duration::minutes(5)).await.unwrap();
        assert_eq!(report, SweepReport::default());

        let alert = h.alert_for(id, giver).await;
        assert_eq!(alert.status, AlertStatus::TimedOut);

        let outcome = h
            .coordinator
            .donor_responds(&donor(giver), alert.id, DonorResponse::Accept, after)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ResponseOutcome::RequestClosed {
                status: RequestStatus::Expired
            }
        );
        assert_eq!(
            h.coordinator.dispatcher().dispatch(id, after).await.unwrap(),
            DispatchOutcome::RequestClosed
        );
        assert_eq!(h.notifier.donors().len(), 1);
    }

    #[tokio::test]
    async fn reads_expire_overdue_requests() {
        let h = Harness::new();
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::APositive, Urgency::Medium),
                t0(),
            )
            .await
            .unwrap();
        let request = h
            .coordinator
            .get_request(&h.hospital, created.request.id, created.request.expires_at)
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Expired);
        assert_eq!(h.coordinator.sweep(created.request.expires_at).await.unwrap().expired, 0);
    }

    #[tokio::test]
    async fn only_owners_and_hospitals_cancel() {
        let h = Harness::new();
        let giver = h.available(BloodType::BPositive, 500.0).await;
        let owner = Actor::new(Uuid::new_v4(), UserRole::Recipient);
        let stranger = Actor::new(Uuid::new_v4(), UserRole::Recipient);

        let created = h
            .coordinator
            .create_request(
                &owner,
                Harness::new_request(BloodType::BPositive, Urgency::High),
                t0(),
            )
            .await
            .unwrap();
        let id = created.request.id;

        assert!(matches!(
            h.coordinator.cancel_request(&stranger, id, t0()).await,
            Err(CoordinatorError::Forbidden { .. })
        ));
        assert!(matches!(
            h.coordinator.cancel_request(&donor(giver), id, t0()).await,
            Err(CoordinatorError::Forbidden { .. })
        ));

        let cancelled = h.coordinator.cancel_request(&owner, id, t0()).await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(
            h.alert_for(id, giver).await.status,
            AlertStatus::Superseded
        );

        assert!(matches!(
            h.coordinator.cancel_request(&h.hospital, id, t0()).await,
            Err(CoordinatorError::InvalidTransition {
                from: RequestStatus::Cancelled,
                to: RequestStatus::Cancelled
            })
        ));
    }

    #[tokio::test]
    async fn hospitals_cancel_matched_requests() {
        let h = Harness::new();
        let giver = h.available(BloodType::ONegative, 500.0).await;
        let owner = Actor::new(Uuid::new_v4(), UserRole::Recipient);
        let created = h
            .coordinator
            .create_request(
                &owner,
                Harness::new_request(BloodType::ONegative, Urgency::Critical),
                t0(),
            )
            .await
            .unwrap();
        let alert = h.alert_for(created.request.id, giver).await;
        h.coordinator
            .donor_responds(&donor(giver), alert.id, DonorResponse::Accept, t0())
            .await
            .unwrap();

        let cancelled = h
            .coordinator
            .cancel_request(&h.hospital, created.request.id, t0())
            .await
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(
            h.alert_for(created.request.id, giver).await.status,
            AlertStatus::Accepted
        );
    }

    #[tokio::test]
    async fn fulfil_requires_a_match() {
        let h = Harness::new();
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::APositive, Urgency::Low),
                t0(),
            )
            .await
            .unwrap();
        let id = created.request.id;

        assert!(matches!(
            h.coordinator
                .fulfill_request(&h.hospital, id, FulfillmentDetails::default(), t0())
                .await,
            Err(CoordinatorError::InvalidTransition {
                from: RequestStatus::Active,
                to: RequestStatus::Fulfilled
            })
        ));

        let recipient = Actor::new(Uuid::new_v4(), UserRole::Recipient);
        assert!(matches!(
            h.coordinator
                .fulfill_request(&recipient, id, FulfillmentDetails::default(), t0())
                .await,
            Err(CoordinatorError::Forbidden { .. })
        ));
        assert!(matches!(
            h.coordinator
                .fulfill_request(&h.hospital, Uuid::new_v4(), FulfillmentDetails::default(), t0())
                .await,
            Err(CoordinatorError::NotFound { kind: "request", .. })
        ));
    }

    #[tokio::test]
    async fn fulfilment_defaults_units_to_request() {
        let h = Harness::new();
        let giver = h.available(BloodType::OPositive, 300.0).await;
        let mut new = Harness::new_request(BloodType::OPositive, Urgency::High);
        new.units_needed = 3;
        let created = h
            .coordinator
            .create_request(&h.hospital, new, t0())
            .await
            .unwrap();
        let alert = h.alert_for(created.request.id, giver).await;
        h.coordinator
            .donor_responds(&donor(giver), alert.id, DonorResponse::Accept, t0())
            .await
            .unwrap();

        let done = h
            .coordinator
            .fulfill_request(&h.hospital, created.request.id, FulfillmentDetails::default(), t0())
            .await
            .unwrap();
        assert_eq!(done.donation.units_donated, 3);
        assert_eq!(done.donation.request_id, Some(created.request.id));
        assert_eq!(done.donation.recipient_id, Some(h.hospital.user_id));

        let profile = h
            .store
            .get_health_profiles(&[giver])
            .await
            .unwrap()
            .remove(&giver)
            .unwrap();
        assert_eq!(profile.last_donation_date, Some(t0()));
    }

    #[tokio::test]
    async fn sweep_closes_overdue_rounds_and_escalates() {
        let h = Harness::with_config(|c| c.dispatch.critical_batch_cap = 1);
        let first = h.available(BloodType::OPositive, 400.0).await;
        let second = h.available(BloodType::OPositive, 800.0).await;
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::OPositive, Urgency::Critical),
                t0(),
            )
            .await
            .unwrap();
        let id = created.request.id;

        let report = h.coordinator.sweep(t0() + Duration::minutes(2)).await.unwrap();
        assert_eq!(report, SweepReport::default());

        let report = h.coordinator.sweep(t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.timed_out_rounds, 1);
        assert_eq!(report.redispatched, 1);
        assert_eq!(h.alert_for(id, first).await.status, AlertStatus::TimedOut);
        assert_eq!(h.alert_for(id, second).await.round, 2);
    }

    #[tokio::test]
    async fn idle_requests_are_retried_when_donors_appear() {
        let h = Harness::new();
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::AbNegative, Urgency::High),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(created.dispatch, DispatchOutcome::NoCandidatesFound);

        let giver = h.available(BloodType::ONegative, 1_000.0).await;

        let report = h.coordinator.sweep(t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.redispatched, 0);

        let report = h.coordinator.sweep(t0() + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.redispatched, 1);
        assert_eq!(h.alert_for(created.request.id, giver).await.round, 1);
    }

    #[tokio::test]
    async fn closed_requests_do_not_keep_slots() {
        let h = Harness::new();
        let giver = h.available(BloodType::APositive, 400.0).await;
        let late = h.available(BloodType::APositive, 800.0).await;
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::APositive, Urgency::High),
                t0(),
            )
            .await
            .unwrap();
        let id = created.request.id;
        let slots = &h.coordinator.lifecycle.slots;
        assert_eq!(slots.len(), 1);

        let alert = h.alert_for(id, giver).await;
        h.coordinator
            .donor_responds(&donor(giver), alert.id, DonorResponse::Accept, t0())
            .await
            .unwrap();
        assert_eq!(slots.len(), 0);

        h.coordinator
            .get_request(&h.hospital, id, t0())
            .await
            .unwrap();
        let alert = h.alert_for(id, late).await;
        assert_eq!(
            h.coordinator
                .donor_responds(&donor(late), alert.id, DonorResponse::Accept, t0())
                .await
                .unwrap(),
            ResponseOutcome::ConcurrentAcceptConflict
        );
        assert_eq!(
            h.coordinator
                .dispatcher()
                .on_timeout(id, Uuid::new_v4(), t0())
                .await
                .unwrap(),
            None
        );
        assert_eq!(slots.len(), 0);
    }

    #[tokio::test]
    async fn sweep_retires_slots_of_requests_closed_elsewhere() {
        let h = Harness::new();
        let giver = h.available(BloodType::OPositive, 500.0).await;
        let created = h
            .coordinator
            .create_request(
                &h.hospital,
                Harness::new_request(BloodType::OPositive, Urgency::High),
                t0(),
            )
            .await
            .unwrap();
        let id = created.request.id;
        let expires_at = created.request.expires_at;

        let alert = h.alert_for(id, giver).await;
        let outcome = h
            .coordinator
            .donor_responds(&donor(giver), alert.id, DonorResponse::Accept, expires_at)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ResponseOutcome::RequestClosed {
                status: RequestStatus::Expired
            }
        );
        assert_eq!(h.coordinator.lifecycle.slots.len(), 1);

        let report = h.coordinator.sweep(expires_at).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.retired_slots, 1);
        assert_eq!(h.coordinator.lifecycle.slots.len(), 0);
    }
}
