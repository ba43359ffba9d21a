//! Constants used throughout the EDC core crate.

/// Filename for schedule definitions inside the protocol directory.
pub const SCHEDULES_FILENAME: &str = "schedules.yaml";

/// Filename for facility definitions inside the protocol directory.
pub const FACILITIES_FILENAME: &str = "facilities.yaml";

/// Filename for public holidays inside the protocol directory.
pub const HOLIDAYS_FILENAME: &str = "holidays.yaml";

/// Filename for CRF metadata rule groups inside the protocol directory.
pub const RULES_FILENAME: &str = "rules.yaml";

/// Default protocol directory when none is configured.
pub const DEFAULT_PROTOCOL_DIR: &str = "protocol";

/// Months searched forward for an open facility date when the caller gives no window.
pub const DEFAULT_SEARCH_WINDOW_MONTHS: u32 = 1;

/// Days counted per month in window arithmetic. Not calendar-accurate.
pub const DAYS_PER_MONTH: i64 = 30;

/// Days counted per year in window arithmetic. Not calendar-accurate.
pub const DAYS_PER_YEAR: i64 = 365;

/// Longest interval, in days, a protocol may use for an offset or window.
pub const MAX_INTERVAL_DAYS: i64 = 100 * DAYS_PER_YEAR;

/// Default field and value that activate a consent extension.
pub const EXTENSION_AGREEMENT_FIELD: &str = "agrees_to_extension";
pub const YES: &str = "Yes";
