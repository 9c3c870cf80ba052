use crate::model::Ms;

/// One calendar day in ms.
pub const DAY_MS: Ms = 86_400_000;

/// Reservations must start strictly later than this far in the future.
pub const MIN_LEAD_TIME_MS: Ms = DAY_MS;

/// Two reservations for the same claimant must be at least this many days apart.
pub const WEEKLY_WINDOW_DAYS: i64 = 7;

/// Spots available on the short day.
pub const FRIDAY_CAPACITY: u32 = 6;

/// Spots available on every other day.
pub const DEFAULT_CAPACITY: u32 = 7;

/// How many times a compensating WAL event is retried before escalating.
pub const MAX_COMPENSATION_ATTEMPTS: usize = 3;

pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 2_000;

/// Depth of the channel feeding the WAL writer.
pub const WAL_CHANNEL_DEPTH: usize = 4096;
