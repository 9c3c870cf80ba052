use ulid::Ulid;

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any state change; fix the input and retry.
    InputValidation,
    /// Rejected with no side effect; retry with different parameters.
    Conflict,
    /// Lookup miss.
    NotFound,
    Authorization,
    /// Backend trouble. Only `StorageError` is safe to retry.
    Infrastructure,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidDay(String),
    InvalidDate { date: i64, earliest: i64 },
    InvalidSlot { pool_id: Ulid, slot: u32 },
    PoolAlreadyExists(String),
    PoolNotFound(Ulid),
    DuplicateWeeklyClaim { claimant_id: Ulid, existing: Ulid },
    SpotUnavailable { pool_id: Ulid, slot: u32 },
    NotFound(Ulid),
    Forbidden(&'static str),
    /// Occupancy check failures. The protocol reports both as `SpotUnavailable`.
    CapacityExceeded(u32),
    SlotAlreadyTaken(u32),
    /// Release of a slot that is not marked occupied.
    SlotNotReserved(u32),
    StorageError(String),
    PartialFailure(String),
}

impl EngineError {
    /// Stable snake_case name, used for metrics labels and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidDay(_) => "invalid_day",
            EngineError::InvalidDate { .. } => "invalid_date",
            EngineError::InvalidSlot { .. } => "invalid_slot",
            EngineError::PoolAlreadyExists(_) => "pool_already_exists",
            EngineError::PoolNotFound(_) => "pool_not_found",
            EngineError::DuplicateWeeklyClaim { .. } => "duplicate_weekly_claim",
            EngineError::SpotUnavailable { .. } => "spot_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::CapacityExceeded(_) => "capacity_exceeded",
            EngineError::SlotAlreadyTaken(_) => "slot_already_taken",
            EngineError::SlotNotReserved(_) => "slot_not_reserved",
            EngineError::StorageError(_) => "storage_error",
            EngineError::PartialFailure(_) => "partial_failure",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidDay(_)
            | EngineError::InvalidDate { .. }
            | EngineError::InvalidSlot { .. } => ErrorClass::InputValidation,
            EngineError::PoolAlreadyExists(_)
            | EngineError::DuplicateWeeklyClaim { .. }
            | EngineError::SpotUnavailable { .. }
            | EngineError::CapacityExceeded(_)
            | EngineError::SlotAlreadyTaken(_) => ErrorClass::Conflict,
            EngineError::PoolNotFound(_) | EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::Forbidden(_) => ErrorClass::Authorization,
            EngineError::SlotNotReserved(_)
            | EngineError::StorageError(_)
            | EngineError::PartialFailure(_) => ErrorClass::Infrastructure,
        }
    }

    /// Whether the caller may resend the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidDay(day) => write!(f, "invalid day of the week: {day:?}"),
            EngineError::InvalidDate { date, earliest } => write!(
                f,
                "cannot reserve a spot for a past date or today: {date} (must be after {earliest})"
            ),
            EngineError::InvalidSlot { pool_id, slot } => {
                write!(f, "spot number {slot} does not exist in pool {pool_id}")
            }
            EngineError::PoolAlreadyExists(day) => {
                write!(f, "parking spot pool already exists for {day}")
            }
            EngineError::PoolNotFound(id) => write!(f, "pool not found: {id}"),
            EngineError::DuplicateWeeklyClaim {
                claimant_id,
                existing,
            } => write!(
                f,
                "food truck {claimant_id} already has a reservation for this week: {existing}"
            ),
            EngineError::SpotUnavailable { pool_id, slot } => {
                write!(f, "spot {slot} in pool {pool_id} is not available")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(why) => write!(f, "forbidden: {why}"),
            EngineError::CapacityExceeded(cap) => {
                write!(f, "capacity {cap} exceeded: all spots occupied")
            }
            EngineError::SlotAlreadyTaken(slot) => write!(f, "spot {slot} already taken"),
            EngineError::SlotNotReserved(slot) => write!(f, "spot {slot} is not reserved"),
            EngineError::StorageError(e) => write!(f, "storage error: {e}"),
            EngineError::PartialFailure(e) => {
                write!(f, "partial failure, reconciliation required: {e}")
            }
        }
    }
}

impl std::error::Error for EngineError {}
