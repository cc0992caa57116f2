/// Partitions (database names) per server.
pub const MAX_PARTITIONS: usize = 256;
pub const MAX_PARTITION_NAME_LEN: usize = 128;

pub const MAX_TENANTS_PER_PARTITION: usize = 10_000;
pub const MAX_STAFF_PER_TENANT: usize = 500;
pub const MAX_SERVICES_PER_TENANT: usize = 500;
pub const MAX_BOOKINGS_PER_STAFF: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_FIELD_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;

/// One slot per 15 minutes across a full day.
pub const MAX_GRID_SLOTS: usize = 96;

/// +/- 14h covers every real-world UTC offset.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

pub const MIN_BOOKING_YEAR: i32 = 2000;
pub const MAX_BOOKING_YEAR: i32 = 2200;

/// Largest framed WAL payload. A purge of a full staff history stays well under it.
pub const MAX_WAL_RECORD_LEN: usize = 16 * 1024 * 1024;
