use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Reservation records plus claimant and requester indexes.
///
/// Every write to a record happens while the record's pool write lock is
/// held, so the ledger never disagrees with pool occupancy for a writer.
/// Readers go straight to the maps.
pub struct Ledger {
    records: DashMap<Ulid, Reservation>,
    by_claimant: DashMap<Ulid, Vec<Ulid>>,
    by_requester: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            by_claimant: DashMap::new(),
            by_requester: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // ── Writes ───────────────────────────────────────────────

    /// Store a record whose id and `created_at` were assigned at commit.
    pub fn insert(&self, reservation: Reservation) -> Reservation {
        self.by_claimant
            .entry(reservation.claimant_id)
            .or_default()
            .push(reservation.id);
        self.by_requester
            .entry(reservation.requester_id)
            .or_default()
            .push(reservation.id);
        self.records.insert(reservation.id, reservation.clone());
        reservation
    }

    pub fn update(&self, id: Ulid, patch: ReservationPatch) -> Result<Reservation, EngineError> {
        let mut entry = self.records.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(slot) = patch.slot_number {
            entry.slot_number = slot;
        }
        if let Some(date) = patch.date {
            entry.date = date;
        }
        Ok(entry.value().clone())
    }

    pub fn delete(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (_, removed) = self.records.remove(&id).ok_or(EngineError::NotFound(id))?;
        unindex(&self.by_claimant, removed.claimant_id, id);
        unindex(&self.by_requester, removed.requester_id, id);
        Ok(removed)
    }

    /// Whether `event` still fits the current records: a move or release must
    /// name a live reservation sitting where the event says it is.
    pub fn check(&self, event: &Event) -> Result<(), EngineError> {
        let (id, slot) = match event {
            Event::ReservationUpdated { id, from, .. } => (*id, from.slot_number),
            Event::ReservationReleased { reservation } => (reservation.id, reservation.slot_number),
            _ => return Ok(()),
        };
        let current = self.find(&id).ok_or(EngineError::NotFound(id))?;
        if current.slot_number != slot {
            return Err(EngineError::SlotNotReserved(slot));
        }
        Ok(())
    }

    /// Ledger half of a reservation event.
    pub fn apply(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::ReservationAdmitted { reservation } => {
                self.insert(reservation.clone());
            }
            Event::ReservationUpdated { id, to, .. } => {
                let patch = ReservationPatch {
                    slot_number: Some(to.slot_number),
                    date: Some(to.date),
                };
                self.update(*id, patch)?;
            }
            Event::ReservationReleased { reservation } => {
                self.delete(reservation.id)?;
            }
            Event::PoolCreated { .. } | Event::PoolWithdrawn { .. } => {}
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn find(&self, id: &Ulid) -> Option<Reservation> {
        self.records.get(id).map(|e| e.value().clone())
    }

    pub fn find_by_claimant(&self, claimant_id: &Ulid) -> Vec<Reservation> {
        self.collect_indexed(&self.by_claimant, claimant_id)
    }

    pub fn find_by_requester(&self, requester_id: &Ulid) -> Vec<Reservation> {
        self.collect_indexed(&self.by_requester, requester_id)
    }

    /// All records, oldest first.
    pub fn find_all(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|r| r.id);
        all
    }

    fn collect_indexed(&self, index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid) -> Vec<Reservation> {
        // Copy the id list first so no index shard is held while reading records.
        let ids = index.get(key).map(|e| e.value().clone()).unwrap_or_default();
        ids.iter().filter_map(|id| self.find(id)).collect()
    }
}

fn unindex(index: &DashMap<Ulid, Vec<Ulid>>, key: Ulid, id: Ulid) {
    let now_empty = match index.get_mut(&key) {
        Some(mut ids) => {
            ids.retain(|x| *x != id);
            ids.is_empty()
        }
        None => false,
    };
    if now_empty {
        index.remove_if(&key, |_, ids| ids.is_empty());
    }
}
