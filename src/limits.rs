use crate::model::Ms;

/// One calendar day in milliseconds.
pub const DAY_MS: Ms = 86_400_000;

pub const MAX_VEHICLES_PER_STOREFRONT: usize = 100_000;
pub const MAX_ADD_ONS: usize = 1_000;
pub const MAX_ADD_ONS_PER_RESERVATION: usize = 32;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CATEGORY_LEN: usize = 64;
pub const MAX_CUSTOMER_ID_LEN: usize = 128;
pub const MAX_NOTE_LEN: usize = 1_024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single rental may not exceed one year.
pub const MAX_RENTAL_DURATION_MS: Ms = 366 * DAY_MS;
/// Widest window accepted by availability and search queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 3 * 366 * DAY_MS;

pub const MAX_STOREFRONT_NAME_LEN: usize = 128;
pub const MAX_STOREFRONTS: usize = 64;
pub const MAX_IN_CLAUSE_IDS: usize = MAX_ADD_ONS_PER_RESERVATION;
