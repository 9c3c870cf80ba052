use tracing::info;
use ulid::Ulid;

use crate::audit::{AuditAction, AuditEvent};
use crate::auth::Principal;
use crate::model::*;

use super::commit::Committed;
use super::ledger::Ledger;
use super::occupancy::{now_ms, occupy_for, validate_date, validate_slot, weekly_conflict};
use super::{Engine, EngineError};

impl Engine {
    /// Create the pool for `day` using the day's capacity rule. Admin-only;
    /// the caller checks the role.
    pub async fn create_pool(&self, day: &str) -> Result<PoolInfo, EngineError> {
        let day = Weekday::from_name(day).ok_or_else(|| EngineError::InvalidDay(day.to_string()))?;
        let creation = self.registry.lock_creation().await;
        if self.registry.id_for_day(day).is_some() {
            return Err(EngineError::PoolAlreadyExists(day.to_string()));
        }

        let pool = PoolState::new(Ulid::new(), day);
        let event = Event::PoolCreated {
            id: pool.id,
            day,
            capacity: pool.capacity,
            slot_numbers: pool.slot_numbers.clone(),
        };
        let registry = self.registry.clone();
        let info = self
            .committer
            .commit_detached(event, move |_, outcome| {
                let _creation = creation;
                let info = pool.info();
                match outcome {
                    Committed::Landed => {
                        registry.insert(pool);
                        Ok(info)
                    }
                    Committed::Kept(e) => {
                        registry.insert(pool);
                        Err(e)
                    }
                    Committed::Reverted(e) => Err(e),
                }
            })
            .await?;
        info!(pool_id = %info.id, day = %info.day, capacity = info.capacity, "pool created");
        Ok(info)
    }

    /// Claim `slot_number` in a pool for a claimant on `date`.
    pub async fn admit_reservation(
        &self,
        pool_id: Ulid,
        slot_number: u32,
        claimant_id: Ulid,
        principal: &Principal,
        date: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .admit(pool_id, slot_number, claimant_id, principal.requester_id, date)
            .await;
        self.release_claimant_lock(claimant_id);
        self.audit.record(AuditEvent::new(
            AuditAction::Admit,
            principal,
            Some(pool_id),
            result.as_ref().ok().map(|r| r.id),
            &result,
        ));
        result
    }

    async fn admit(
        &self,
        pool_id: Ulid,
        slot_number: u32,
        claimant_id: Ulid,
        requester_id: Ulid,
        date: Ms,
    ) -> Result<Reservation, EngineError> {
        let now = now_ms();
        validate_date(date, now)?;

        let claimant = self.claimant_lock(claimant_id).lock_owned().await;
        if let Some(existing) = weekly_conflict(&self.ledger.find_by_claimant(&claimant_id), date) {
            return Err(EngineError::DuplicateWeeklyClaim {
                claimant_id,
                existing,
            });
        }

        let shared = self
            .registry
            .get(&pool_id)
            .ok_or(EngineError::PoolNotFound(pool_id))?;
        let mut pool = shared.write_owned().await;
        validate_slot(&pool, slot_number)?;

        let reservation = Reservation {
            id: Ulid::new(),
            pool_id,
            slot_number,
            claimant_id,
            requester_id,
            date,
            created_at: now,
        };
        let event = Event::ReservationAdmitted {
            reservation: reservation.clone(),
        };
        occupy_for(&mut pool, &event).map_err(|e| unavailable(e, pool_id, slot_number))?;

        let ledger = self.ledger.clone();
        self.committer
            .commit_detached(event, move |event, outcome| {
                let _claimant = claimant;
                settle_reservation(&mut pool, &ledger, event, outcome).map(|()| reservation)
            })
            .await
    }

    /// Move a reservation to another slot in the same pool.
    pub async fn reassign_slot(
        &self,
        id: Ulid,
        slot_number: u32,
        principal: &Principal,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch::slot(slot_number), principal)
            .await
    }

    /// Apply a patch to a reservation's slot and/or date. A new date must
    /// pass the lead-time rule; weekly uniqueness is not re-evaluated.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        principal: &Principal,
    ) -> Result<Reservation, EngineError> {
        let result = self.update(id, patch, principal).await;
        self.audit.record(AuditEvent::new(
            AuditAction::Reassign,
            principal,
            result.as_ref().ok().map(|r| r.pool_id),
            Some(id),
            &result,
        ));
        result
    }

    async fn update(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        principal: &Principal,
    ) -> Result<Reservation, EngineError> {
        let current = self.ledger.find(&id).ok_or(EngineError::NotFound(id))?;
        if !principal.may_act_on(&current) {
            return Err(EngineError::Forbidden("reservation belongs to another requester"));
        }
        if let Some(date) = patch.date {
            validate_date(date, now_ms())?;
        }

        let pool_id = current.pool_id;
        let shared = self
            .registry
            .get(&pool_id)
            .ok_or(EngineError::PoolNotFound(pool_id))?;
        let mut pool = shared.write_owned().await;

        // Re-read under the pool lock: a concurrent move or release may have won.
        let current = self.ledger.find(&id).ok_or(EngineError::NotFound(id))?;
        let from = current.placement();
        let to = patch.apply_to(from);
        if from == to {
            return Ok(current);
        }
        if to.slot_number != from.slot_number {
            validate_slot(&pool, to.slot_number)?;
        }

        let event = Event::ReservationUpdated {
            id,
            pool_id,
            from,
            to,
        };
        occupy_for(&mut pool, &event).map_err(|e| unavailable(e, pool_id, to.slot_number))?;

        let ledger = self.ledger.clone();
        self.committer
            .commit_detached(event, move |event, outcome| {
                settle_reservation(&mut pool, &ledger, event, outcome)?;
                ledger.find(&id).ok_or(EngineError::NotFound(id))
            })
            .await
    }

    /// Self-service release. Only the requester that owns the record may release it.
    pub async fn release_reservation(&self, id: Ulid, principal: &Principal) -> Result<(), EngineError> {
        let result = self.release(id, Some(principal)).await;
        self.audit.record(AuditEvent::new(
            AuditAction::Release,
            principal,
            result.as_ref().ok().map(|r| r.pool_id),
            Some(id),
            &result,
        ));
        result.map(|_| ())
    }

    /// Release without the ownership check. Requires the admin role.
    pub async fn admin_release_reservation(&self, id: Ulid, admin: &Principal) -> Result<(), EngineError> {
        let result = match admin.require_admin() {
            Ok(()) => self.release(id, None).await,
            Err(e) => Err(e),
        };
        self.audit.record(AuditEvent::new(
            AuditAction::AdminRelease,
            admin,
            result.as_ref().ok().map(|r| r.pool_id),
            Some(id),
            &result,
        ));
        result.map(|_| ())
    }

    async fn release(&self, id: Ulid, owner: Option<&Principal>) -> Result<Reservation, EngineError> {
        let current = self.ledger.find(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(principal) = owner
            && current.requester_id != principal.requester_id
        {
            return Err(EngineError::Forbidden("reservation belongs to another requester"));
        }

        let pool_id = current.pool_id;
        let shared = self
            .registry
            .get(&pool_id)
            .ok_or(EngineError::PoolNotFound(pool_id))?;
        let mut pool = shared.write_owned().await;
        let current = self.ledger.find(&id).ok_or(EngineError::NotFound(id))?;

        let event = Event::ReservationReleased {
            reservation: current.clone(),
        };
        occupy_for(&mut pool, &event).map_err(|e| {
            EngineError::PartialFailure(format!(
                "reservation {id} holds slot {} in pool {pool_id}, but {e}",
                current.slot_number
            ))
        })?;

        let ledger = self.ledger.clone();
        self.committer
            .commit_detached(event, move |event, outcome| {
                settle_reservation(&mut pool, &ledger, event, outcome).map(|()| current)
            })
            .await
    }
}

/// Occupancy check failures surface as `SpotUnavailable`; anything else passes through.
fn unavailable(e: EngineError, pool_id: Ulid, slot: u32) -> EngineError {
    match e {
        EngineError::CapacityExceeded(_) | EngineError::SlotAlreadyTaken(_) => {
            EngineError::SpotUnavailable { pool_id, slot }
        }
        other => other,
    }
}

/// Bring memory in line with what the log says about `event`. Occupancy was
/// staged before the commit and the pool lock is still held.
fn settle_reservation(
    pool: &mut PoolState,
    ledger: &Ledger,
    event: &Event,
    outcome: Committed,
) -> Result<(), EngineError> {
    let stale = |e: EngineError| {
        EngineError::PartialFailure(format!("{} is durable but the ledger rejected it: {e}", event.label()))
    };
    match outcome {
        Committed::Landed => ledger.apply(event).map_err(stale),
        Committed::Kept(e) => {
            ledger.apply(event).map_err(stale)?;
            Err(e)
        }
        Committed::Reverted(e) => {
            if let Some(undo) = event.compensation() {
                occupy_for(pool, &undo).map_err(|undo_err| {
                    EngineError::PartialFailure(format!(
                        "could not unstage {} after {e}: {undo_err}",
                        event.label()
                    ))
                })?;
            }
            Err(e)
        }
    }
}
