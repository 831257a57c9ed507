use std::fmt;

use chrono::{DateTime, Utc};

/// Seconds between 1601-01-01 and 1970-01-01.
const EPOCH_DIFFERENCE_SECS: i64 = 11_644_473_600;
const TICKS_PER_SEC: i64 = 10_000_000;

/// NTFS timestamp: signed count of 100 ns intervals since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtfsTime(pub i64);

impl NtfsTime {
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(i64::from_le_bytes(bytes))
    }

    pub fn ticks(self) -> i64 {
        self.0
    }

    /// Convert to a UTC date-time, keeping the full 100 ns precision.
    /// `None` when the value is outside chrono's representable range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(TICKS_PER_SEC) - EPOCH_DIFFERENCE_SECS;
        let nanos = (self.0.rem_euclid(TICKS_PER_SEC) * 100) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos)
    }

    /// Inverse of [`NtfsTime::to_datetime`]; sub-100 ns digits are dropped.
    pub fn from_datetime(dt: DateTime<Utc>) -> Option<Self> {
        let secs = dt.timestamp().checked_add(EPOCH_DIFFERENCE_SECS)?;
        let ticks = secs
            .checked_mul(TICKS_PER_SEC)?
            .checked_add((dt.timestamp_subsec_nanos() / 100) as i64)?;
        Some(Self(ticks))
    }
}

impl fmt::Display for NtfsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.7f UTC")),
            None => write!(f, "<invalid time {}>", self.0),
        }
    }
}
