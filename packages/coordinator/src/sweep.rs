//! Background task that runs [`Coordinator::sweep`] on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::Coordinator;

/// Spawns the periodic sweep. Abort the handle to stop it.
#[must_use]
pub fn spawn_sweeper(coordinator: Arc<Coordinator>, every: Duration) -> JoinHandle<()> {
    log::info!("Sweeping requests every {}s", every.as_secs_f64());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = coordinator.sweep(Utc::now()).await {
                log::error!("Request sweep failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use bloodlink_blood_models::{BloodType, Urgency, UserRole};
    use bloodlink_database::{MemoryStore, Store};
    use bloodlink_database_models::RequestStatus;
    use uuid::Uuid;

    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::lifecycle::NewRequest;
    use crate::notifier::LogNotifier;
    use crate::roles::Actor;

    #[tokio::test]
    async fn sweeper_expires_overdue_requests() {
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LogNotifier),
            CoordinatorConfig::default(),
        ));
        let hospital = Actor::new(Uuid::new_v4(), UserRole::Hospital);
        let created = coordinator
            .create_request(
                &hospital,
                NewRequest {
                    blood_type_needed: BloodType::OPositive,
                    urgency: Urgency::High,
                    units_needed: 1,
                    latitude: 40.0,
                    longitude: -75.0,
                    location_name: None,
                    contact_phone: None,
                    notes: None,
                    expires_at: Some(Utc::now() + chrono::Duration::milliseconds(50)),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let handle = spawn_sweeper(Arc::clone(&coordinator), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        let stored = coordinator
            .store()
            .get_request(created.request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RequestStatus::Expired);
    }
}
