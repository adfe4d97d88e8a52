use crate::model::Ms;

// ── Tenancy ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_SERVICES: usize = 1_000;
pub const MAX_PROFESSIONALS: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;
/// A service may not last longer than a day.
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;

// ── Appointments ─────────────────────────────────────────────────

pub const MAX_CLIENT_ID_LEN: usize = 256;
pub const MAX_APPOINTMENTS_PER_SCOPE: usize = 200_000;
/// How far ahead a slot may be listed or booked.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 366;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
