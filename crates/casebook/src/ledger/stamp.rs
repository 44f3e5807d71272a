use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use core::fmt;
use std::time::Duration;

/// Calendar year that year-cycle 0 refers to.
pub const STAMP_EPOCH_YEAR: i32 = 2015;

/// Compact 20-bit claim timestamp stored in the low bits of a spec word.
///
/// ```text
///  Bit Index:  19  18 17    14 13      9 8       4 3        0
///              +-----+--------+---------+---------+----------+
///  Field:      |year | month  |   day   |  hour   | minute/4 |
///              +-----+--------+---------+---------+----------+
/// ```
///
/// The year is kept modulo 4 relative to [`STAMP_EPOCH_YEAR`] and minutes are
/// kept at 4-minute resolution. All fields are UTC. Because months start at 1
/// a stamp produced by [`ClaimStamp::from_millis`] is never zero, which is
/// what lets a zero stamp mean "unclaimed".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClaimStamp(u32);

impl ClaimStamp {
    const MASK: u32 = (1 << 20) - 1;

    /// Granularity of the minute field. A stamp may read up to this much
    /// earlier than the time it encodes.
    pub const RESOLUTION: Duration = Duration::from_secs(4 * 60);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Encodes the UTC time `millis` milliseconds after the Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        let at = DateTime::from_timestamp_millis(millis as i64).unwrap_or_default();
        Self::from_datetime(&at)
    }

    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        let cycle = (at.year() - STAMP_EPOCH_YEAR).rem_euclid(4) as u32;
        let raw = (((((cycle << 4 | at.month()) << 5 | at.day()) << 5) | at.hour()) << 4)
            | at.minute() / 4;
        Self::from_raw(raw)
    }

    pub const fn year_cycle(self) -> u32 {
        self.0 >> 18
    }

    pub const fn month(self) -> u32 {
        (self.0 >> 14) & 0xF
    }

    pub const fn day(self) -> u32 {
        (self.0 >> 9) & 0x1F
    }

    pub const fn hour(self) -> u32 {
        (self.0 >> 4) & 0x1F
    }

    /// Minute of the hour, rounded down to a multiple of 4.
    pub const fn minute(self) -> u32 {
        (self.0 & 0xF) * 4
    }

    /// Resolves the stamp to the latest matching calendar year at or before
    /// the year of `now_millis`.
    ///
    /// Returns `None` for a stamp whose fields do not form a valid date.
    pub fn resolve(self, now_millis: u64) -> Option<DateTime<Utc>> {
        let now = DateTime::from_timestamp_millis(now_millis as i64)?;
        let back = (now.year() - STAMP_EPOCH_YEAR - self.year_cycle() as i32).rem_euclid(4);
        NaiveDate::from_ymd_opt(now.year() - back, self.month(), self.day())?
            .and_hms_opt(self.hour(), self.minute(), 0)
            .map(|t| t.and_utc())
    }

    /// Returns `true` if the stamp is older than `window` as seen from
    /// `now_millis`. Stamps that cannot be decoded count as stale.
    pub fn is_older_than(self, window: Duration, now_millis: u64) -> bool {
        match self.resolve(now_millis) {
            Some(at) => {
                let claimed = at.timestamp_millis().max(0) as u64;
                claimed.saturating_add(window.as_millis() as u64) < now_millis
            }
            None => true,
        }
    }
}

impl fmt::Display for ClaimStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}",
            STAMP_EPOCH_YEAR + self.year_cycle() as i32,
            self.month(),
            self.day(),
            self.hour(),
            self.minute()
        )
    }
}
