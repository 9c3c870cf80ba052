use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Direction of an occupancy change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Claim,
    Release,
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// The single mutation point for a pool's occupancy. Taking `&mut PoolState`
/// means the caller holds the pool's write lock, so the check and the write
/// are one step for every other task.
pub(crate) fn adjust_occupancy(
    pool: &mut PoolState,
    slot: u32,
    delta: Delta,
) -> Result<(), EngineError> {
    match delta {
        Delta::Claim => {
            let pos = match pool.reserved_slots.binary_search(&slot) {
                Ok(_) => return Err(EngineError::SlotAlreadyTaken(slot)),
                Err(pos) => pos,
            };
            if pool.reserved_count >= pool.capacity {
                return Err(EngineError::CapacityExceeded(pool.capacity));
            }
            pool.reserved_slots.insert(pos, slot);
            pool.reserved_count += 1;
        }
        Delta::Release => {
            let pos = pool
                .reserved_slots
                .binary_search(&slot)
                .map_err(|_| EngineError::SlotNotReserved(slot))?;
            pool.reserved_slots.remove(pos);
            pool.reserved_count -= 1;
        }
    }
    debug_assert_eq!(pool.reserved_count as usize, pool.reserved_slots.len());
    Ok(())
}

/// Occupancy half of a reservation event. A move releases the old slot and
/// claims the new one; if the claim fails the old slot is taken back, so the
/// pool is untouched on error. Pool events carry no occupancy change.
pub(crate) fn occupy_for(pool: &mut PoolState, event: &Event) -> Result<(), EngineError> {
    match event {
        Event::ReservationAdmitted { reservation } => {
            adjust_occupancy(pool, reservation.slot_number, Delta::Claim)
        }
        Event::ReservationReleased { reservation } => {
            adjust_occupancy(pool, reservation.slot_number, Delta::Release)
        }
        Event::ReservationUpdated { from, to, .. } if from.slot_number != to.slot_number => {
            adjust_occupancy(pool, from.slot_number, Delta::Release)?;
            if let Err(e) = adjust_occupancy(pool, to.slot_number, Delta::Claim) {
                adjust_occupancy(pool, from.slot_number, Delta::Claim)?;
                return Err(e);
            }
            Ok(())
        }
        Event::ReservationUpdated { .. } | Event::PoolCreated { .. } | Event::PoolWithdrawn { .. } => {
            Ok(())
        }
    }
}

/// Reject dates that are not strictly more than a day ahead of `now`.
pub(crate) fn validate_date(date: Ms, now: Ms) -> Result<(), EngineError> {
    let earliest = now + MIN_LEAD_TIME_MS;
    if date <= earliest {
        return Err(EngineError::InvalidDate { date, earliest });
    }
    Ok(())
}

pub(crate) fn validate_slot(pool: &PoolState, slot: u32) -> Result<(), EngineError> {
    if !pool.has_slot(slot) {
        return Err(EngineError::InvalidSlot {
            pool_id: pool.id,
            slot,
        });
    }
    Ok(())
}

/// Find a live reservation that sits within the weekly window around `date`.
pub(crate) fn weekly_conflict(existing: &[Reservation], date: Ms) -> Option<Ulid> {
    let day = day_number(date);
    existing
        .iter()
        .find(|r| (r.day_number() - day).abs() < WEEKLY_WINDOW_DAYS)
        .map(|r| r.id)
}
