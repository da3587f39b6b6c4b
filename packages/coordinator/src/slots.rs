//! Per-request serialization and in-flight round bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bloodlink_database_models::RequestStatus;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The round currently waiting on donor responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRound {
    pub id: Uuid,
    pub number: u32,
    pub alert_ids: Vec<Uuid>,
    /// Alerts in the round that were actually delivered.
    pub notified: usize,
    pub deadline: DateTime<Utc>,
}

/// Mutable dispatch state of one request. Only touched while holding the
/// request's lock.
#[derive(Debug, Default)]
pub struct SlotState {
    pub round: Option<ActiveRound>,
    /// Radius the last search settled on; later searches never start
    /// smaller.
    pub radius_m: f64,
    /// Set when a search ended with no round in flight.
    pub idle_since: Option<DateTime<Utc>>,
}

impl SlotState {
    /// Retires the active round, if any, and marks the request idle.
    pub fn retire_round(&mut self, now: DateTime<Utc>) -> Option<ActiveRound> {
        self.idle_since = Some(now);
        self.round.take()
    }

    #[must_use]
    pub fn is_active_round(&self, round_id: Uuid) -> bool {
        self.round.as_ref().is_some_and(|r| r.id == round_id)
    }
}

pub type Slot = Arc<tokio::sync::Mutex<SlotState>>;

/// Hands out one async lock per active request.
///
/// Slots exist only while a request can still dispatch. Requests in any
/// other state get a detached slot and rely on the store's compare-and-swaps
/// alone.
#[derive(Default)]
pub struct RequestSlots {
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl RequestSlots {
    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The request's shared slot, created on first use.
    pub fn get(&self, request_id: Uuid) -> Slot {
        Arc::clone(self.map().entry(request_id).or_default())
    }

    /// The request's shared slot, if one exists.
    pub fn peek(&self, request_id: Uuid) -> Option<Slot> {
        self.map().get(&request_id).cloned()
    }

    /// The slot to lock for a request currently in `status`.
    pub fn for_status(&self, request_id: Uuid, status: RequestStatus) -> Slot {
        if status == RequestStatus::Active {
            self.get(request_id)
        } else {
            self.peek(request_id).unwrap_or_default()
        }
    }

    /// Drops the lock for a request that left the active state.
    pub fn release(&self, request_id: Uuid) {
        self.map().remove(&request_id);
    }

    /// Ids whose slot no caller currently holds.
    pub fn unheld(&self) -> Vec<Uuid> {
        self.map()
            .iter()
            .filter(|(_, slot)| Arc::strong_count(slot) == 1)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops the slot only if no caller holds it. Returns whether it was
    /// dropped.
    pub fn release_if_unheld(&self, request_id: Uuid) -> bool {
        let mut slots = self.map();
        if slots
            .get(&request_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&request_id);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }
}
