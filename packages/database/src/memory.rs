//! In-process [`Store`] implementation.
//!
//! Every operation takes one mutex over all tables, so multi-row writes
//! (alert rounds, donations) are trivially atomic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bloodlink_database_models::{
    AlertRecord, AlertStatus, BloodRequest, DonationRecord, DonorLocation, DonorStats,
    HealthProfile, RequestStatus,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{AcceptOutcome, DbError, Store};

#[derive(Default)]
struct Tables {
    donor_locations: BTreeMap<Uuid, DonorLocation>,
    health_profiles: BTreeMap<Uuid, HealthProfile>,
    requests: BTreeMap<Uuid, BloodRequest>,
    alerts: BTreeMap<Uuid, AlertRecord>,
    /// (`request_id`, `donor_id`) pairs that already have an alert.
    alert_pairs: BTreeSet<(Uuid, Uuid)>,
    donations: Vec<DonationRecord>,
    donor_stats: BTreeMap<Uuid, DonorStats>,
}

/// A [`Store`] that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of donation history rows recorded.
    #[must_use]
    pub fn donation_count(&self) -> usize {
        self.tables().donations.len()
    }
}

fn apply_alert_transition(alert: &mut AlertRecord, to: AlertStatus, at: DateTime<Utc>) {
    alert.status = to;
    match to {
        AlertStatus::Notified => alert.notified_at = Some(at),
        AlertStatus::Accepted | AlertStatus::Declined => alert.responded_at = Some(at),
        _ => {}
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_donor_location(&self, location: &DonorLocation) -> Result<bool, DbError> {
        let mut tables = self.tables();
        if tables
            .donor_locations
            .get(&location.donor_id)
            .is_some_and(|stored| stored.last_active > location.last_active)
        {
            return Ok(false);
        }
        tables
            .donor_locations
            .insert(location.donor_id, location.clone());
        Ok(true)
    }

    async fn get_donor_location(&self, donor_id: Uuid) -> Result<Option<DonorLocation>, DbError> {
        Ok(self.tables().donor_locations.get(&donor_id).cloned())
    }

    async fn list_donor_locations(&self) -> Result<Vec<DonorLocation>, DbError> {
        Ok(self.tables().donor_locations.values().cloned().collect())
    }

    async fn upsert_health_profile(&self, profile: &HealthProfile) -> Result<(), DbError> {
        self.tables()
            .health_profiles
            .insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn get_health_profiles(
        &self,
        user_ids: &[Uuid],
    ) -> Result<BTreeMap<Uuid, HealthProfile>, DbError> {
        let tables = self.tables();
        Ok(user_ids
            .iter()
            .filter_map(|id| {
                tables
                    .health_profiles
                    .get(id)
                    .map(|profile| (*id, profile.clone()))
            })
            .collect())
    }

    async fn insert_request(&self, request: &BloodRequest) -> Result<(), DbError> {
        let mut tables = self.tables();
        if tables.requests.contains_key(&request.id) {
            return Err(DbError::Conflict {
                message: format!("request {} already exists", request.id),
            });
        }
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<BloodRequest>, DbError> {
        Ok(self.tables().requests.get(&id).cloned())
    }

    async fn list_requests_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<BloodRequest>, DbError> {
        let mut requests: Vec<BloodRequest> = self
            .tables()
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut tables = self.tables();
        let Some(request) = tables.requests.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&request.status) {
            return Ok(false);
        }
        request.status = to;
        request.updated_at = at;
        Ok(true)
    }

    async fn insert_alert_round(&self, alerts: &[AlertRecord]) -> Result<(), DbError> {
        let mut tables = self.tables();

        let mut round_pairs = BTreeSet::new();
        for alert in alerts {
            let pair = (alert.request_id, alert.donor_id);
            if tables.alert_pairs.contains(&pair) || !round_pairs.insert(pair) {
                return Err(DbError::Conflict {
                    message: format!(
                        "donor {} already alerted for request {}",
                        alert.donor_id, alert.request_id
                    ),
                });
            }
        }

        for alert in alerts {
            tables
                .alert_pairs
                .insert((alert.request_id, alert.donor_id));
            tables.alerts.insert(alert.id, alert.clone());
        }
        Ok(())
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<AlertRecord>, DbError> {
        Ok(self.tables().alerts.get(&id).cloned())
    }

    async fn list_alerts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<AlertRecord>, DbError> {
        let mut alerts: Vec<AlertRecord> = self
            .tables()
            .alerts
            .values()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            a.round
                .cmp(&b.round)
                .then(a.distance_meters.total_cmp(&b.distance_meters))
        });
        Ok(alerts)
    }

    async fn transition_alert(
        &self,
        id: Uuid,
        from: &[AlertStatus],
        to: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut tables = self.tables();
        let Some(alert) = tables.alerts.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&alert.status) {
            return Ok(false);
        }
        apply_alert_transition(alert, to, at);
        Ok(true)
    }

    async fn transition_request_alerts(
        &self,
        request_id: Uuid,
        from: &[AlertStatus],
        to: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let mut tables = self.tables();
        let mut changed = 0;
        for alert in tables
            .alerts
            .values_mut()
            .filter(|a| a.request_id == request_id && from.contains(&a.status))
        {
            apply_alert_transition(alert, to, at);
            changed += 1;
        }
        Ok(changed)
    }

    async fn accept_alert(
        &self,
        request_id: Uuid,
        alert_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AcceptOutcome, DbError> {
        let mut tables = self.tables();
        if tables
            .requests
            .get(&request_id)
            .is_none_or(|r| r.status != RequestStatus::Active)
        {
            return Ok(AcceptOutcome::RequestNotActive);
        }
        if tables
            .alerts
            .get(&alert_id)
            .is_none_or(|a| a.request_id != request_id || !a.status.is_outstanding())
        {
            return Ok(AcceptOutcome::AlertClosed);
        }

        if let Some(request) = tables.requests.get_mut(&request_id) {
            request.status = RequestStatus::Matched;
            request.updated_at = at;
        }
        let mut superseded = 0;
        for alert in tables
            .alerts
            .values_mut()
            .filter(|a| a.request_id == request_id && a.status.is_outstanding())
        {
            if alert.id == alert_id {
                apply_alert_transition(alert, AlertStatus::Accepted, at);
            } else {
                apply_alert_transition(alert, AlertStatus::Superseded, at);
                superseded += 1;
            }
        }
        Ok(AcceptOutcome::Accepted { superseded })
    }

    async fn record_donation(&self, donation: &DonationRecord) -> Result<DonorStats, DbError> {
        let mut tables = self.tables();

        tables.donations.push(donation.clone());

        if let Some(profile) = tables.health_profiles.get_mut(&donation.donor_id)
            && profile
                .last_donation_date
                .is_none_or(|last| last < donation.donation_date)
        {
            profile.last_donation_date = Some(donation.donation_date);
            profile.updated_at = donation.donation_date;
        }

        let stats = tables
            .donor_stats
            .entry(donation.donor_id)
            .or_insert_with(|| DonorStats {
                donor_id: donation.donor_id,
                ..DonorStats::default()
            });
        stats.total_donations += 1;
        if donation.request_id.is_some() {
            stats.lives_saved += 1;
        }
        if stats
            .last_donation_date
            .is_none_or(|last| last < donation.donation_date)
        {
            stats.last_donation_date = Some(donation.donation_date);
        }

        Ok(stats.clone())
    }

    async fn get_donor_stats(&self, donor_id: Uuid) -> Result<Option<DonorStats>, DbError> {
        Ok(self.tables().donor_stats.get(&donor_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bloodlink_blood_models::{BloodType, Urgency};
    use chrono::Duration;

    fn request(now: DateTime<Utc>) -> BloodRequest {
        BloodRequest {
            id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            blood_type_needed: BloodType::ONegative,
            urgency: Urgency::High,
            units_needed: 1,
            latitude: 0.0,
            longitude: 0.0,
            location_name: None,
            contact_phone: None,
            notes: None,
            status: RequestStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(24),
        }
    }

    fn alert(request_id: Uuid, donor_id: Uuid, now: DateTime<Utc>) -> AlertRecord {
        AlertRecord {
            id: Uuid::new_v4(),
            request_id,
            donor_id,
            round: 1,
            distance_meters: 100.0,
            status: AlertStatus::Pending,
            created_at: now,
            notified_at: None,
            responded_at: None,
        }
    }

    #[tokio::test]
    async fn request_transition_is_compare_and_swap() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let req = request(now);
        store.insert_request(&req).await.unwrap();

        let first = store
            .transition_request(req.id, &[RequestStatus::Active], RequestStatus::Matched, now)
            .await
            .unwrap();
        let second = store
            .transition_request(req.id, &[RequestStatus::Active], RequestStatus::Matched, now)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(
            store.get_request(req.id).await.unwrap().unwrap().status,
            RequestStatus::Matched
        );
    }

    #[tokio::test]
    async fn alert_round_with_duplicate_pair_writes_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let req = request(now);
        store.insert_request(&req).await.unwrap();

        let donor_a = Uuid::new_v4();
        let donor_b = Uuid::new_v4();
        store
            .insert_alert_round(&[alert(req.id, donor_a, now)])
            .await
            .unwrap();

        let result = store
            .insert_alert_round(&[alert(req.id, donor_b, now), alert(req.id, donor_a, now)])
            .await;

        assert!(matches!(result, Err(DbError::Conflict { .. })));
        let alerts = store.list_alerts_for_request(req.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].donor_id, donor_a);
    }

    #[tokio::test]
    async fn alert_transition_sets_timestamps() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let req = request(now);
        store.insert_request(&req).await.unwrap();
        let a = alert(req.id, Uuid::new_v4(), now);
        store.insert_alert_round(&[a.clone()]).await.unwrap();

        let later = now + Duration::minutes(1);
        assert!(
            store
                .transition_alert(a.id, &[AlertStatus::Pending], AlertStatus::Notified, now)
                .await
                .unwrap()
        );
        assert!(
            store
                .transition_alert(a.id, AlertStatus::OUTSTANDING, AlertStatus::Declined, later)
                .await
                .unwrap()
        );

        let stored = store.get_alert(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Declined);
        assert_eq!(stored.notified_at, Some(now));
        assert_eq!(stored.responded_at, Some(later));
    }

    #[tokio::test]
    async fn donation_updates_profile_and_stats() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let donor = Uuid::new_v4();
        store
            .upsert_health_profile(&HealthProfile {
                user_id: donor,
                blood_type: BloodType::APositive,
                conditions: bloodlink_database_models::HealthConditions::default(),
                surgery_date: None,
                last_donation_date: None,
                donation_frequency: 2,
                is_eligible: None,
                updated_at: now,
            })
            .await
            .unwrap();

        let stats = store
            .record_donation(&DonationRecord {
                id: Uuid::new_v4(),
                donor_id: donor,
                recipient_id: None,
                request_id: Some(Uuid::new_v4()),
                units_donated: 1,
                hospital_name: None,
                donation_date: now,
            })
            .await
            .unwrap();

        assert_eq!(stats.total_donations, 1);
        assert_eq!(stats.lives_saved, 1);
        let profiles = store.get_health_profiles(&[donor]).await.unwrap();
        assert_eq!(profiles[&donor].last_donation_date, Some(now));
        assert_eq!(store.donation_count(), 1);
    }

    #[tokio::test]
    async fn accept_alert_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let req = request(now);
        store.insert_request(&req).await.unwrap();
        let winner = alert(req.id, Uuid::new_v4(), now);
        let rival = alert(req.id, Uuid::new_v4(), now);
        let timed_out = alert(req.id, Uuid::new_v4(), now);
        store
            .insert_alert_round(&[winner.clone(), rival.clone(), timed_out.clone()])
            .await
            .unwrap();
        store
            .transition_alert(timed_out.id, AlertStatus::OUTSTANDING, AlertStatus::TimedOut, now)
            .await
            .unwrap();

        assert_eq!(
            store.accept_alert(req.id, timed_out.id, now).await.unwrap(),
            AcceptOutcome::AlertClosed
        );
        assert_eq!(
            store.get_request(req.id).await.unwrap().unwrap().status,
            RequestStatus::Active
        );

        assert_eq!(
            store.accept_alert(req.id, winner.id, now).await.unwrap(),
            AcceptOutcome::Accepted { superseded: 1 }
        );
        assert_eq!(
            store.accept_alert(req.id, rival.id, now).await.unwrap(),
            AcceptOutcome::RequestNotActive
        );
        assert_eq!(
            store.get_alert(winner.id).await.unwrap().unwrap().status,
            AlertStatus::Accepted
        );
        assert_eq!(
            store.get_alert(rival.id).await.unwrap().unwrap().status,
            AlertStatus::Superseded
        );
        assert_eq!(
            store.get_alert(timed_out.id).await.unwrap().unwrap().status,
            AlertStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn older_location_reports_are_not_stored() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let newer = DonorLocation {
            donor_id: Uuid::new_v4(),
            latitude: 10.0,
            longitude: 20.0,
            status: bloodlink_blood_models::DonationStatus::Available,
            is_visible: true,
            last_active: now,
        };
        let older = DonorLocation {
            latitude: 11.0,
            last_active: now - Duration::seconds(30),
            ..newer.clone()
        };

        assert!(store.upsert_donor_location(&newer).await.unwrap());
        assert!(!store.upsert_donor_location(&older).await.unwrap());
        assert_eq!(
            store.get_donor_location(newer.donor_id).await.unwrap(),
            Some(newer)
        );
    }
}
