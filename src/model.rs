use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{DAY_MS, DEFAULT_CAPACITY, FRIDAY_CAPACITY};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Calendar day index of a timestamp (days since the Unix epoch, UTC).
pub fn day_number(t: Ms) -> i64 {
    t.div_euclid(DAY_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    /// Exact, case-sensitive match on the English day name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
            Weekday::Saturday => "Saturday",
            Weekday::Sunday => "Sunday",
        }
    }

    /// Number of spots a pool for this day holds.
    pub fn capacity(&self) -> u32 {
        match self {
            Weekday::Friday => FRIDAY_CAPACITY,
            _ => DEFAULT_CAPACITY,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one day's spots. Only reachable for writing through the
/// pool's write lock.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub id: Ulid,
    pub day: Weekday,
    pub capacity: u32,
    /// Valid slot identifiers, ascending. Fixed at creation.
    pub slot_numbers: Vec<u32>,
    /// Occupied slot identifiers, kept sorted.
    pub reserved_slots: Vec<u32>,
    /// Cached `reserved_slots.len()`.
    pub reserved_count: u32,
}

impl PoolState {
    /// Build a pool using the day's capacity rule: slots `1..=capacity`.
    pub fn new(id: Ulid, day: Weekday) -> Self {
        let capacity = day.capacity();
        Self::with_slots(id, day, capacity, (1..=capacity).collect())
    }

    pub fn with_slots(id: Ulid, day: Weekday, capacity: u32, slot_numbers: Vec<u32>) -> Self {
        Self {
            id,
            day,
            capacity,
            slot_numbers,
            reserved_slots: Vec::new(),
            reserved_count: 0,
        }
    }

    pub fn has_slot(&self, slot: u32) -> bool {
        self.slot_numbers.binary_search(&slot).is_ok()
    }

    pub fn is_reserved(&self, slot: u32) -> bool {
        self.reserved_slots.binary_search(&slot).is_ok()
    }

    pub fn free_slots(&self) -> Vec<u32> {
        self.slot_numbers
            .iter()
            .copied()
            .filter(|s| !self.is_reserved(*s))
            .collect()
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            id: self.id,
            day: self.day,
            capacity: self.capacity,
            slot_numbers: self.slot_numbers.clone(),
            reserved_slots: self.reserved_slots.clone(),
            reserved_count: self.reserved_count,
        }
    }
}

/// Where a reservation sits: which slot on which date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub slot_number: u32,
    pub date: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub pool_id: Ulid,
    pub slot_number: u32,
    /// The food truck this reservation is for.
    pub claimant_id: Ulid,
    /// The identity that created and owns the record.
    pub requester_id: Ulid,
    pub date: Ms,
    pub created_at: Ms,
}

impl Reservation {
    pub fn placement(&self) -> Placement {
        Placement {
            slot_number: self.slot_number,
            date: self.date,
        }
    }

    pub fn day_number(&self) -> i64 {
        day_number(self.date)
    }
}

/// The only fields of a reservation that may change after admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub slot_number: Option<u32>,
    pub date: Option<Ms>,
}

impl ReservationPatch {
    pub fn slot(slot_number: u32) -> Self {
        Self {
            slot_number: Some(slot_number),
            date: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot_number.is_none() && self.date.is_none()
    }

    /// Placement that results from applying this patch to `current`.
    pub fn apply_to(&self, current: Placement) -> Placement {
        Placement {
            slot_number: self.slot_number.unwrap_or(current.slot_number),
            date: self.date.unwrap_or(current.date),
        }
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PoolCreated {
        id: Ulid,
        day: Weekday,
        capacity: u32,
        slot_numbers: Vec<u32>,
    },
    /// Only ever written to undo a `PoolCreated` whose commit timed out.
    PoolWithdrawn {
        id: Ulid,
    },
    ReservationAdmitted {
        reservation: Reservation,
    },
    ReservationUpdated {
        id: Ulid,
        pool_id: Ulid,
        from: Placement,
        to: Placement,
    },
    ReservationReleased {
        reservation: Reservation,
    },
}

impl Event {
    pub fn pool_id(&self) -> Ulid {
        match self {
            Event::PoolCreated { id, .. } | Event::PoolWithdrawn { id } => *id,
            Event::ReservationAdmitted { reservation }
            | Event::ReservationReleased { reservation } => reservation.pool_id,
            Event::ReservationUpdated { pool_id, .. } => *pool_id,
        }
    }

    /// The event that undoes this one once both are replayed in order.
    pub fn compensation(&self) -> Option<Event> {
        match self {
            Event::PoolCreated { id, .. } => Some(Event::PoolWithdrawn { id: *id }),
            Event::PoolWithdrawn { .. } => None,
            Event::ReservationAdmitted { reservation } => Some(Event::ReservationReleased {
                reservation: reservation.clone(),
            }),
            Event::ReservationUpdated {
                id,
                pool_id,
                from,
                to,
            } => Some(Event::ReservationUpdated {
                id: *id,
                pool_id: *pool_id,
                from: *to,
                to: *from,
            }),
            Event::ReservationReleased { reservation } => Some(Event::ReservationAdmitted {
                reservation: reservation.clone(),
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Event::PoolCreated { .. } => "pool_created",
            Event::PoolWithdrawn { .. } => "pool_withdrawn",
            Event::ReservationAdmitted { .. } => "reservation_admitted",
            Event::ReservationUpdated { .. } => "reservation_updated",
            Event::ReservationReleased { .. } => "reservation_released",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub id: Ulid,
    pub day: Weekday,
    pub capacity: u32,
    pub slot_numbers: Vec<u32>,
    pub reserved_slots: Vec<u32>,
    pub reserved_count: u32,
}
