//! Hard limits on request shape. Anything beyond these is rejected with
//! `EngineError::LimitExceeded` before the engine touches shared state.

/// Candidate slot granularity in minutes.
pub const SLOT_STEP_MINUTES: u32 = 30;

pub const MAX_VEHICLES_PER_BOOKING: usize = 20;
pub const MAX_LINES_PER_VEHICLE: usize = 30;
pub const MAX_ADDITIONS_PER_REQUEST: usize = 50;
pub const MAX_QUANTITY: u32 = 100;

/// One day. No single booking may be longer than this.
pub const MAX_BOOKING_MINUTES: u32 = 24 * 60;

pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_VEHICLE_INFO_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 32;

/// Maximum length of one JSON request line on the wire.
pub const MAX_LINE_LEN: usize = 256 * 1024;

/// Rate limiter entries kept before the sweeper starts evicting idle keys.
pub const MAX_RATE_LIMIT_KEYS: usize = 100_000;

/// Attempts to re-resolve a booking whose date moved between index lookup and locking.
pub const MAX_RELOCK_ATTEMPTS: usize = 4;
