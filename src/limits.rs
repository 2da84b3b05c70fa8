// Hard caps that keep one tenant from exhausting memory or the WAL.

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Seats in the vehicle template.
pub const MAX_TEMPLATE_SEATS: usize = 512;
/// Seats named in one hold/confirm/release request.
pub const MAX_SEATS_PER_REQUEST: usize = 64;
pub const MAX_SEAT_CODE_LEN: usize = 16;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_BOOKING_CODE_LEN: usize = 64;

/// Live (HELD) holds per `(trip, date)`.
pub const MAX_HOLDS_PER_KEY: usize = 100_000;
/// `(trip, date)` keys with state, per tenant.
pub const MAX_KEYS_PER_TENANT: usize = 1_000_000;

pub const MAX_SQL_LEN: usize = 64 * 1024;
/// Largest WAL payload written or accepted on replay.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
