// Hard limits enforced at the engine and wire boundaries.

pub const MAX_RESOURCES_PER_VENUE: usize = 1_000;
pub const MAX_BOOKINGS_PER_DAY: usize = 2_000;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_CUSTOMER_KEY_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_VENUES: usize = 256;
pub const MAX_VENUE_NAME_LEN: usize = 128;
pub const MAX_LEGACY_BATCH: usize = 10_000;

/// Shortest and longest configurable reservation slot.
pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 240;

/// Largest single manual adjustment, in coins, either direction.
pub const MAX_ADJUSTMENT_COINS: i64 = 1_000_000;
