//! Timestamp and date host types.
//!
//! PostgreSQL timestamps are stored as microseconds since 2000-01-01 00:00:00 UTC,
//! dates as days since the same epoch. The extreme values of each integer width
//! are reserved for `-infinity` / `infinity`.

/// PostgreSQL epoch: 2000-01-01 00:00:00 UTC
/// Difference from Unix epoch (1970-01-01) in microseconds
pub const PG_EPOCH_OFFSET_USEC: i64 = 946_684_800_000_000;

/// Difference between the Unix epoch and the PostgreSQL epoch in days.
const PG_EPOCH_OFFSET_DAYS: i64 = 10_957;

const USEC_PER_DAY: i64 = 86_400_000_000;

/// Timestamp (microseconds since 2000-01-01), shared by `timestamp` and `timestamptz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Microseconds since PostgreSQL epoch (2000-01-01 00:00:00)
    pub usec: i64,
}

impl Timestamp {
    /// `infinity`
    pub const INFINITY: Self = Self { usec: i64::MAX };
    /// `-infinity`
    pub const NEG_INFINITY: Self = Self { usec: i64::MIN };

    /// Create from microseconds since PostgreSQL epoch
    pub fn from_pg_usec(usec: i64) -> Self {
        Self { usec }
    }

    /// Create from Unix timestamp (seconds since 1970-01-01)
    pub fn from_unix_secs(secs: i64) -> Self {
        Self {
            usec: secs * 1_000_000 - PG_EPOCH_OFFSET_USEC,
        }
    }

    /// Create from Unix timestamp with microseconds
    pub fn from_unix_usec(usec: i64) -> Self {
        Self {
            usec: usec - PG_EPOCH_OFFSET_USEC,
        }
    }

    /// Convert to Unix timestamp (seconds since 1970-01-01)
    pub fn to_unix_secs(&self) -> i64 {
        (self.usec + PG_EPOCH_OFFSET_USEC).div_euclid(1_000_000)
    }

    /// Convert to Unix timestamp with microseconds
    pub fn to_unix_usec(&self) -> i64 {
        self.usec + PG_EPOCH_OFFSET_USEC
    }

    /// False for the `infinity` / `-infinity` sentinels.
    pub fn is_finite(&self) -> bool {
        self.usec != i64::MAX && self.usec != i64::MIN
    }

    /// Calendar date this timestamp falls on (UTC).
    pub fn date(&self) -> Date {
        if !self.is_finite() {
            return if self.usec > 0 {
                Date::INFINITY
            } else {
                Date::NEG_INFINITY
            };
        }
        Date {
            days: self.usec.div_euclid(USEC_PER_DAY) as i32,
        }
    }
}

/// Date type (days since 2000-01-01)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date {
    pub days: i32,
}

impl Date {
    /// `infinity`
    pub const INFINITY: Self = Self { days: i32::MAX };
    /// `-infinity`
    pub const NEG_INFINITY: Self = Self { days: i32::MIN };

    /// Create from a proleptic Gregorian calendar date.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Self {
        Self {
            days: (days_from_civil(year as i64, month as i64, day as i64) - PG_EPOCH_OFFSET_DAYS)
                as i32,
        }
    }

    /// Split into (year, month, day).
    pub fn to_ymd(&self) -> (i32, u32, u32) {
        civil_from_days(self.days as i64 + PG_EPOCH_OFFSET_DAYS)
    }

    pub fn is_finite(&self) -> bool {
        self.days != i32::MAX && self.days != i32::MIN
    }
}

/// Days since 1970-01-01 for a Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year as i32, month as u32, day as u32)
}

#[cfg(feature = "chrono")]
mod chrono_impls {
    use super::{Date, PG_EPOCH_OFFSET_DAYS, Timestamp};
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

    impl From<DateTime<Utc>> for Timestamp {
        fn from(dt: DateTime<Utc>) -> Self {
            Timestamp::from_unix_usec(dt.timestamp_micros())
        }
    }

    impl From<NaiveDateTime> for Timestamp {
        fn from(dt: NaiveDateTime) -> Self {
            Timestamp::from_unix_usec(dt.and_utc().timestamp_micros())
        }
    }

    impl From<NaiveDate> for Date {
        fn from(d: NaiveDate) -> Self {
            let unix_days = d
                .signed_duration_since(DateTime::UNIX_EPOCH.date_naive())
                .num_days();
            Date {
                days: (unix_days - PG_EPOCH_OFFSET_DAYS) as i32,
            }
        }
    }

    impl Timestamp {
        /// Convert to `DateTime<Utc>`; `None` for the infinity sentinels.
        pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
            if !self.is_finite() {
                return None;
            }
            DateTime::from_timestamp_micros(self.to_unix_usec())
        }
    }
}
