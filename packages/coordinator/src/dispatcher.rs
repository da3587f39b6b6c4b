//! Alert rounds, donor responses, and round timeouts.
//!
//! Every operation on a request runs under that request's async lock (see
//! [`RequestSlots`]), and every status change is additionally a store
//! compare-and-swap, so two accepts racing through different processes
//! still resolve to exactly one match.

use std::collections::BTreeSet;
use std::sync::Arc;

use bloodlink_database::{AcceptOutcome, Store};
use bloodlink_database_models::{AlertRecord, AlertStatus, BloodRequest, RequestStatus};
use bloodlink_matching::{MatchEngine, MatchResult};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::lifecycle::expire_if_due;
use crate::notifier::{AlertSummary, Notifier};
use crate::slots::{ActiveRound, RequestSlots, SlotState};
use crate::CoordinatorError;

/// Result of trying to start a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A round is in flight.
    Dispatched {
        round_id: Uuid,
        round: u32,
        notified: usize,
        deadline: DateTime<Utc>,
    },
    /// The first search found nobody. The request stays active.
    NoCandidatesFound,
    /// Every reachable donor has already been alerted. The request stays
    /// active.
    MatchExhausted,
    /// The request is no longer accepting donors.
    RequestClosed,
}

/// A donor's answer to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonorResponse {
    Accept,
    Decline,
}

/// What recording a response did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// This donor's accept matched the request.
    Matched { request_id: Uuid },
    Declined {
        /// Set when the decline closed the round and another was started.
        next_round: Option<DispatchOutcome>,
    },
    /// Another donor accepted first.
    ConcurrentAcceptConflict,
    /// The alert was already answered, timed out, or superseded.
    AlertClosed { status: AlertStatus },
    /// The request is no longer open.
    RequestClosed { status: RequestStatus },
}

/// Runs alert rounds for active requests.
pub struct AlertDispatcher {
    store: Arc<dyn Store>,
    engine: MatchEngine,
    notifier: Arc<dyn Notifier>,
    config: DispatchConfig,
    slots: Arc<RequestSlots>,
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        engine: MatchEngine,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
        slots: Arc<RequestSlots>,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            config,
            slots,
        }
    }

    /// Starts the next round for a request.
    ///
    /// # Errors
    ///
    /// * If the request does not exist
    /// * If a store operation fails
    pub async fn dispatch(
        self: &Arc<Self>,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CoordinatorError> {
        let status = self.load_request(request_id).await?.status;
        let slot = self.slots.for_status(request_id, status);
        let mut state = slot.lock().await;
        let request = self.load_request(request_id).await?;
        let (request, _) = expire_if_due(self.store.as_ref(), request, &mut state, now).await?;
        self.dispatch_locked(&request, &mut state, now).await
    }

    async fn load_request(&self, request_id: Uuid) -> Result<BloodRequest, CoordinatorError> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(CoordinatorError::NotFound {
                kind: "request",
                id: request_id,
            })
    }

    /// Searches and sends rounds until one reaches at least one donor, the
    /// pool runs dry, or the per-call round limit is hit.
    pub(crate) async fn dispatch_locked(
        self: &Arc<Self>,
        request: &BloodRequest,
        state: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CoordinatorError> {
        if request.status != RequestStatus::Active || request.is_past_deadline(now) {
            return Ok(DispatchOutcome::RequestClosed);
        }
        if let Some(round) = &state.round {
            log::debug!("Request {} already has round {} in flight", request.id, round.number);
            return Ok(DispatchOutcome::Dispatched {
                round_id: round.id,
                round: round.number,
                notified: round.notified,
                deadline: round.deadline,
            });
        }

        // Anything still outstanding here belongs to a round this process no
        // longer tracks.
        let orphaned = self
            .store
            .transition_request_alerts(request.id, AlertStatus::OUTSTANDING, AlertStatus::TimedOut, now)
            .await?;
        if orphaned > 0 {
            log::info!("Timed out {orphaned} orphaned alerts for request {}", request.id);
        }

        for _ in 0..self.config.max_rounds_per_dispatch.max(1) {
            let history = self.store.list_alerts_for_request(request.id).await?;
            let exclude: BTreeSet<Uuid> = history.iter().map(|a| a.donor_id).collect();
            let number = history.iter().map(|a| a.round).max().unwrap_or(0) + 1;

            let search = self
                .engine
                .find_matches(request, &exclude, state.radius_m, now)
                .await?;
            state.radius_m = search.radius_m;

            let take = self.config.round_size(request.urgency, search.matches.len());
            if take == 0 {
                state.retire_round(now);
                return Ok(if number == 1 {
                    log::info!("No donors found for request {}", request.id);
                    DispatchOutcome::NoCandidatesFound
                } else {
                    log::info!("Donor pool exhausted for request {}", request.id);
                    DispatchOutcome::MatchExhausted
                });
            }

            let round = self
                .send_round(request, number, &search.matches[..take], now)
                .await?;
            if let Some(round) = round {
                let outcome = DispatchOutcome::Dispatched {
                    round_id: round.id,
                    round: round.number,
                    notified: round.notified,
                    deadline: round.deadline,
                };
                self.schedule_timeout(request.id, &round);
                state.round = Some(round);
                state.idle_since = None;
                return Ok(outcome);
            }
            log::warn!(
                "Round {number} for request {} reached nobody, escalating",
                request.id
            );
        }

        state.retire_round(now);
        Ok(DispatchOutcome::MatchExhausted)
    }

    /// Records one round and delivers it. Returns `None` if no delivery
    /// succeeded.
    async fn send_round(
        &self,
        request: &BloodRequest,
        number: u32,
        matches: &[MatchResult],
        now: DateTime<Utc>,
    ) -> Result<Option<ActiveRound>, CoordinatorError> {
        let alerts: Vec<AlertRecord> = matches
            .iter()
            .map(|m| AlertRecord {
                id: Uuid::new_v4(),
                request_id: request.id,
                donor_id: m.donor_id,
                round: number,
                distance_meters: m.distance_meters,
                status: AlertStatus::Pending,
                created_at: now,
                notified_at: None,
                responded_at: None,
            })
            .collect();
        self.store.insert_alert_round(&alerts).await?;

        let all_emergency = matches.iter().all(|m| m.emergency);
        let provisional = now + self.config.round_timeout(request.urgency, all_emergency);

        let timeout = self.config.notify_timeout();
        let deliveries = join_all(alerts.iter().map(|alert| {
            let summary = summarize(request, alert, provisional);
            async move {
                let delivered =
                    tokio::time::timeout(timeout, self.notifier.notify(alert.donor_id, &summary))
                        .await
                        .unwrap_or_else(|_| {
                            log::warn!("Notifying donor {} timed out", alert.donor_id);
                            false
                        });
                (alert, delivered)
            }
        }))
        .await;

        let mut notified = Vec::new();
        for (alert, delivered) in deliveries {
            let to = if delivered {
                AlertStatus::Notified
            } else {
                AlertStatus::Undelivered
            };
            if self
                .store
                .transition_alert(alert.id, &[AlertStatus::Pending], to, now)
                .await?
                && delivered
            {
                notified.push(alert);
            }
        }

        if notified.is_empty() {
            return Ok(None);
        }

        let all_emergency = notified.iter().all(|alert| {
            matches
                .iter()
                .any(|m| m.donor_id == alert.donor_id && m.emergency)
        });
        let deadline = now + self.config.round_timeout(request.urgency, all_emergency);

        log::info!(
            "Round {number} for request {}: notified {}/{} donors, respond by {deadline}",
            request.id,
            notified.len(),
            alerts.len()
        );

        Ok(Some(ActiveRound {
            id: Uuid::new_v4(),
            number,
            alert_ids: alerts.iter().map(|a| a.id).collect(),
            notified: notified.len(),
            deadline,
        }))
    }

    fn schedule_timeout(self: &Arc<Self>, request_id: Uuid, round: &ActiveRound) {
        if !self.config.schedule_timeouts {
            return;
        }
        let delay = (round.deadline - Utc::now()).to_std().unwrap_or_default();
        let round_id = round.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.timeout_task(request_id, round_id).await {
                log::error!("Timeout handling for request {request_id} failed: {e}");
            }
        });
    }

    /// Boxed so the timer task's future type does not contain itself.
    fn timeout_task(
        self: Arc<Self>,
        request_id: Uuid,
        round_id: Uuid,
    ) -> BoxFuture<'static, Result<Option<DispatchOutcome>, CoordinatorError>> {
        Box::pin(async move { self.on_timeout(request_id, round_id, Utc::now()).await })
    }

    /// Closes a round whose response window ended and starts the next.
    ///
    /// Does nothing and returns `None` unless `round_id` is still the active
    /// round of an active, unexpired request.
    ///
    /// # Errors
    ///
    /// * If the request does not exist
    /// * If a store operation fails
    pub async fn on_timeout(
        self: &Arc<Self>,
        request_id: Uuid,
        round_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchOutcome>, CoordinatorError> {
        let Some(slot) = self.slots.peek(request_id) else {
            log::debug!("Ignoring timeout for untracked request {request_id}");
            return Ok(None);
        };
        let mut state = slot.lock().await;
        if !state.is_active_round(round_id) {
            log::debug!("Ignoring timeout for inactive round {round_id}");
            return Ok(None);
        }
        let request = self.load_request(request_id).await?;
        let (request, _) = expire_if_due(self.store.as_ref(), request, &mut state, now).await?;
        if request.status != RequestStatus::Active {
            state.retire_round(now);
            return Ok(None);
        }
        self.close_round_locked(&mut state, now).await?;
        self.dispatch_locked(&request, &mut state, now).await.map(Some)
    }

    /// Times out whatever is still outstanding in the active round.
    pub(crate) async fn close_round_locked(
        &self,
        state: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        let Some(round) = state.retire_round(now) else {
            return Ok(());
        };
        let mut timed_out = 0_usize;
        for alert_id in &round.alert_ids {
            if self
                .store
                .transition_alert(*alert_id, AlertStatus::OUTSTANDING, AlertStatus::TimedOut, now)
                .await?
            {
                timed_out += 1;
            }
        }
        log::info!("Round {} closed, {timed_out} alerts timed out", round.number);
        Ok(())
    }

    /// Records a donor's answer.
    ///
    /// # Errors
    ///
    /// * If the alert or its request does not exist
    /// * If a store operation fails
    pub async fn record_response(
        self: &Arc<Self>,
        alert_id: Uuid,
        response: DonorResponse,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome, CoordinatorError> {
        let request_id = self.load_alert(alert_id).await?.request_id;
        let status = self.load_request(request_id).await?.status;

        let slot = self.slots.for_status(request_id, status);
        let mut state = slot.lock().await;

        // Re-read under the lock; timeouts and other responses may have
        // moved it.
        let alert = self.load_alert(alert_id).await?;
        let request = self.load_request(request_id).await?;
        let (request, _) = expire_if_due(self.store.as_ref(), request, &mut state, now).await?;

        match (response, request.status) {
            (DonorResponse::Accept, RequestStatus::Matched) => {
                self.store
                    .transition_alert(alert_id, AlertStatus::OUTSTANDING, AlertStatus::Superseded, now)
                    .await?;
                log::info!(
                    "Donor {} accepted request {request_id} after it was matched",
                    alert.donor_id
                );
                return Ok(ResponseOutcome::ConcurrentAcceptConflict);
            }
            (_, RequestStatus::Active) => {}
            (_, status) => return Ok(ResponseOutcome::RequestClosed { status }),
        }

        if !alert.status.is_outstanding() {
            return Ok(ResponseOutcome::AlertClosed {
                status: alert.status,
            });
        }

        match response {
            DonorResponse::Accept => {
                let outcome = self.accept_locked(&alert, &mut state, now).await?;
                if matches!(outcome, ResponseOutcome::Matched { .. }) {
                    drop(state);
                    self.slots.release(request_id);
                }
                Ok(outcome)
            }
            DonorResponse::Decline => {
                if !self
                    .store
                    .transition_alert(alert_id, AlertStatus::OUTSTANDING, AlertStatus::Declined, now)
                    .await?
                {
                    return Ok(ResponseOutcome::AlertClosed {
                        status: self.load_alert(alert_id).await?.status,
                    });
                }
                log::info!("Donor {} declined request {request_id}", alert.donor_id);
                let next_round = self
                    .escalate_if_round_spent(&request, &alert, &mut state, now)
                    .await?;
                Ok(ResponseOutcome::Declined { next_round })
            }
        }
    }

    async fn accept_locked(
        &self,
        alert: &AlertRecord,
        state: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome, CoordinatorError> {
        let request_id = alert.request_id;
        match self.store.accept_alert(request_id, alert.id, now).await? {
            AcceptOutcome::Accepted { superseded } => {
                state.retire_round(now);
                log::info!(
                    "Request {request_id} matched with donor {} ({superseded} other alerts superseded)",
                    alert.donor_id
                );
                Ok(ResponseOutcome::Matched { request_id })
            }
            AcceptOutcome::RequestNotActive => {
                let status = self.load_request(request_id).await?.status;
                if status != RequestStatus::Matched {
                    return Ok(ResponseOutcome::RequestClosed { status });
                }
                self.store
                    .transition_alert(alert.id, AlertStatus::OUTSTANDING, AlertStatus::Superseded, now)
                    .await?;
                Ok(ResponseOutcome::ConcurrentAcceptConflict)
            }
            AcceptOutcome::AlertClosed => Ok(ResponseOutcome::AlertClosed {
                status: self.load_alert(alert.id).await?.status,
            }),
        }
    }

    /// Starts the next round early once nobody in the active round can still
    /// accept.
    async fn escalate_if_round_spent(
        self: &Arc<Self>,
        request: &BloodRequest,
        alert: &AlertRecord,
        state: &mut SlotState,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchOutcome>, CoordinatorError> {
        let Some(round) = state.round.as_ref() else {
            return Ok(None);
        };
        if !round.alert_ids.contains(&alert.id) {
            return Ok(None);
        }

        let spent = self
            .store
            .list_alerts_for_request(request.id)
            .await?
            .iter()
            .filter(|a| round.alert_ids.contains(&a.id))
            .all(|a| matches!(a.status, AlertStatus::Declined | AlertStatus::Undelivered));
        if !spent {
            return Ok(None);
        }

        log::info!(
            "Every donor in round {} declined, escalating request {}",
            round.number,
            request.id
        );
        state.retire_round(now);
        self.dispatch_locked(request, state, now).await.map(Some)
    }

    async fn load_alert(&self, alert_id: Uuid) -> Result<AlertRecord, CoordinatorError> {
        self.store
            .get_alert(alert_id)
            .await?
            .ok_or(CoordinatorError::NotFound {
                kind: "alert",
                id: alert_id,
            })
    }
}

fn summarize(request: &BloodRequest, alert: &AlertRecord, respond_by: DateTime<Utc>) -> AlertSummary {
    AlertSummary {
        alert_id: alert.id,
        request_id: request.id,
        round: alert.round,
        blood_type_needed: request.blood_type_needed,
        urgency: request.urgency,
        units_needed: request.units_needed,
        distance_meters: alert.distance_meters,
        location_name: request.location_name.clone(),
        contact_phone: request.contact_phone.clone(),
        respond_by: respond_by.min(request.expires_at),
    }
}
