use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use thiserror::Error;

/// Earliest calendar year accepted for year, month and day keys.
pub const MIN_YEAR: i32 = 1900;
/// Latest calendar year accepted for year, month and day keys.
pub const MAX_YEAR: i32 = 2100;

// Canonical instants always render nine fractional digits so that equal
// instants render equal strings.
const INSTANT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";
const INSTANT_PARSE: &str = "%Y-%m-%dT%H:%M:%S%.fZ";
// File names drop the colons of the canonical form, see `file_name_part`.
const INSTANT_NAME_PARSE: &str = "%Y-%m-%dT%H%M%S%.fZ";

/// Errors from time key construction and parsing.
#[derive(Debug, Error)]
pub enum TimeError {
    /// Year component outside the supported range.
    #[error("year {0} outside supported range {MIN_YEAR}..={MAX_YEAR}")]
    YearOutOfRange(i32),
    /// Fields do not form a real calendar date.
    #[error("invalid calendar date {year:04}-{month:02}-{day:02}")]
    InvalidDate {
        /// Year component of the rejected date.
        year: i32,
        /// Month component of the rejected date.
        month: u32,
        /// Day component of the rejected date.
        day: u32,
    },
    /// The string matches no canonical time key form.
    #[error("unrecognized time key {0:?}")]
    Unrecognized(String),
    /// Interval construction with start after end.
    #[error("interval start {start} is after end {end}")]
    Inverted {
        /// Requested start.
        start: DateTime<Utc>,
        /// Requested end, earlier than `start`.
        end: DateTime<Utc>,
    },
}

/// The period of data a stored file claims, at one of four granularities.
///
/// Calendar variants hold validated fields: keys that enter through parsing
/// are checked, and keys derived from timestamps are valid by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeKey {
    /// A whole calendar year, `2021`.
    Year(i32),
    /// A calendar month, `2021-03`.
    Month(i32, u32),
    /// A calendar day, `2021-03-04`.
    Day(i32, u32, u32),
    /// A single instant, `2021-03-04T05:06:07.123456789Z`.
    Instant(DateTime<Utc>),
}

impl TimeKey {
    /// Calendar year of the claim start, one directory level on disk.
    pub fn year(&self) -> i32 {
        match *self {
            TimeKey::Year(y) | TimeKey::Month(y, _) | TimeKey::Day(y, _, _) => y,
            TimeKey::Instant(t) => t.year(),
        }
    }

    /// Inclusive start of the claimed period.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match *self {
            TimeKey::Year(y) => utc_midnight(y, 1, 1),
            TimeKey::Month(y, m) => utc_midnight(y, m, 1),
            TimeKey::Day(y, m, d) => utc_midnight(y, m, d),
            TimeKey::Instant(t) => t,
        }
    }

    /// The half-open span this key claims.
    ///
    /// Calendar keys claim their full unit. An instant claims the zero-length
    /// `[t, t)`: it names a moment, and widening it would let the compaction
    /// sweep treat a point file as covering data it does not contain.
    pub fn interval(&self) -> TimeInterval {
        let start = self.timestamp();
        let end = match *self {
            TimeKey::Year(_) => start + Months::new(12),
            TimeKey::Month(_, _) => start + Months::new(1),
            TimeKey::Day(_, _, _) => start + TimeDelta::days(1),
            TimeKey::Instant(_) => start,
        };
        TimeInterval { start, end }
    }

    /// Inverse of [`TimeKey::interval`]: a span that is exactly one calendar
    /// unit maps back to the calendar key, anything else to an instant at the
    /// span start.
    pub fn from_interval(interval: &TimeInterval) -> Self {
        let start = interval.start;
        if interval.is_year() {
            TimeKey::Year(start.year())
        } else if interval.is_month() {
            TimeKey::Month(start.year(), start.month())
        } else if interval.is_day() {
            TimeKey::Day(start.year(), start.month(), start.day())
        } else {
            TimeKey::Instant(start)
        }
    }

    /// Time component of a file name: the canonical form with colons dropped
    /// and the fraction dot replaced by an underscore.
    pub(crate) fn file_name_part(&self) -> String {
        self.to_string().replace(':', "").replace('.', "_")
    }

    /// Parses a file-name time component. The caller has already restored the
    /// underscore before the fraction to a dot.
    pub(crate) fn from_file_name_part(part: &str) -> Result<Self, TimeError> {
        if part.len() <= 10 {
            return part.parse();
        }
        let instant = NaiveDateTime::parse_from_str(part, INSTANT_NAME_PARSE)
            .map_err(|_| TimeError::Unrecognized(part.to_owned()))?;
        Ok(TimeKey::Instant(instant.and_utc()))
    }

    fn validate(&self) -> Result<(), TimeError> {
        let (year, month, day) = match *self {
            TimeKey::Year(y) => (y, 1, 1),
            TimeKey::Month(y, m) => (y, m, 1),
            TimeKey::Day(y, m, d) => (y, m, d),
            TimeKey::Instant(_) => return Ok(()),
        };
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(TimeError::YearOutOfRange(year));
        }
        if NaiveDate::from_ymd_opt(year, month, day).is_none() {
            return Err(TimeError::InvalidDate { year, month, day });
        }
        Ok(())
    }

    fn granularity(&self) -> u8 {
        match self {
            TimeKey::Year(_) => 0,
            TimeKey::Month(..) => 1,
            TimeKey::Day(..) => 2,
            TimeKey::Instant(_) => 3,
        }
    }
}

impl Ord for TimeKey {
    /// Chronological by claim start, coarser key first on ties. This equals
    /// the lexicographic order of the canonical strings: a calendar key is a
    /// strict prefix of every finer key starting at the same moment.
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| self.granularity().cmp(&other.granularity()))
    }
}

impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TimeKey::Year(y) => write!(f, "{y:04}"),
            TimeKey::Month(y, m) => write!(f, "{y:04}-{m:02}"),
            TimeKey::Day(y, m, d) => write!(f, "{y:04}-{m:02}-{d:02}"),
            TimeKey::Instant(t) => write!(f, "{}", t.format(INSTANT_FORMAT)),
        }
    }
}

impl FromStr for TimeKey {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unrecognized = || TimeError::Unrecognized(s.to_owned());
        let key = match s.len() {
            4 => TimeKey::Year(s.parse().map_err(|_| unrecognized())?),
            7 => {
                let (year, month) = s.split_once('-').ok_or_else(unrecognized)?;
                TimeKey::Month(
                    year.parse().map_err(|_| unrecognized())?,
                    month.parse().map_err(|_| unrecognized())?,
                )
            }
            10 => {
                let date =
                    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| unrecognized())?;
                TimeKey::Day(date.year(), date.month(), date.day())
            }
            _ => {
                let instant = NaiveDateTime::parse_from_str(s, INSTANT_PARSE)
                    .map_err(|_| unrecognized())?;
                TimeKey::Instant(instant.and_utc())
            }
        };
        key.validate()?;
        Ok(key)
    }
}

fn utc_midnight(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .expect("calendar key fields are validated on construction")
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Half-open span `[start, end)` over UTC timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeInterval {
    /// Builds a span, rejecting `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TimeError> {
        if start > end {
            return Err(TimeError::Inverted { start, end });
        }
        Ok(TimeInterval { start, end })
    }

    /// Inclusive start.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether the span covers no time at all.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Spans exactly one calendar year from January 1st.
    pub fn is_year(&self) -> bool {
        self.starts_at_midnight()
            && self.start.month() == 1
            && self.start.day() == 1
            && self.end == self.start + Months::new(12)
    }

    /// Spans exactly one calendar month from its first day.
    pub fn is_month(&self) -> bool {
        self.starts_at_midnight()
            && self.start.day() == 1
            && self.end == self.start + Months::new(1)
    }

    /// Spans exactly one calendar day from midnight.
    pub fn is_day(&self) -> bool {
        self.starts_at_midnight() && self.end == self.start + TimeDelta::days(1)
    }

    /// Whether `other` lies fully inside this span. A zero-length claim
    /// marks a moment, and the moment at `end` is outside the half-open
    /// span, so a point claim sitting exactly there is not contained.
    pub fn contains(&self, other: &TimeInterval) -> bool {
        self.start <= other.start && other.end <= self.end && other.start < self.end
    }

    fn starts_at_midnight(&self) -> bool {
        self.start.time() == NaiveTime::MIN
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format(INSTANT_FORMAT),
            self.end.format(INSTANT_FORMAT)
        )
    }
}
