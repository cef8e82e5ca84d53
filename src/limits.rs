// Input and resource ceilings. Everything a client can grow is bounded here.

pub const MAX_OWNER_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 120;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_SERVICE_ID_LEN: usize = 64;

/// Services longer than a working day make no sense on a single chair.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 12 * 60;
/// In minor units. Keeps prices representable as INT8 on the wire.
pub const MAX_SERVICE_PRICE: u64 = 1_000_000_000;

pub const MAX_SHOPS: usize = 1024;
pub const MAX_SHOP_NAME_LEN: usize = 128;

/// Optimistic transactions are re-executed this many times before giving up.
pub const MAX_TXN_ATTEMPTS: usize = 16;

/// Upper bound for `booking_horizon_days` in configuration.
pub const MAX_HORIZON_DAYS: u32 = 3 * 365;

/// Queued promotions kept for retry before the oldest is dropped.
pub const MAX_PENDING_PROMOTIONS: usize = 4096;
