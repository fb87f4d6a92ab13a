/// Registered providers per engine.
pub const MAX_PROVIDERS: usize = 10_000;

/// Provider and user name length in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Active reservations on a single date.
pub const MAX_RESERVATIONS_PER_DAY: usize = 100_000;

/// Smallest and largest slot step accepted by the interval generator.
pub const MIN_STEP_MINUTES: u32 = 1;
pub const MAX_STEP_MINUTES: u32 = 24 * 60;

/// Hold durations outside this range are rejected at startup.
pub const MAX_HOLD_SECONDS: u32 = 24 * 3600;

/// Dates outside this range are rejected (keeps timestamp math in `i64` ms).
pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 9999;
