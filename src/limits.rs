// Hard limits. Requests beyond these fail with `LimitExceeded`.

/// Free intervals submitted for (or held by) one day. One per five minutes.
pub const MAX_INTERVALS_PER_DAY: usize = 288;

/// Appointments recorded on one (owner, date) bucket.
pub const MAX_APPOINTMENTS_PER_DAY: usize = 1440;

/// Widest window accepted by a range schedule query.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Customer fields (names, email, phone, handle).
pub const MAX_FIELD_LEN: usize = 256;

pub const MAX_SERVICE_NAME_LEN: usize = 256;

pub const MAX_SERVICES_PER_TENANT: usize = 100_000;

pub const MAX_TENANTS: usize = 1024;

pub const MAX_TENANT_NAME_LEN: usize = 256;
