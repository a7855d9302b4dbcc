//! Time-bin codec for time-partitioned tables.
//!
//! Tables are partitioned by event time at one of two nested granularities:
//! [`TimeBin::Hourly`] within [`TimeBin::Daily`]. A partition key is the ordered
//! tuple of zero-padded time components for its bin:
//!
//! ```text
//! Daily:  ["2020", "01", "15"]          -> year=2020/month=01/day=15/
//! Hourly: ["2020", "01", "15", "07"]    -> year=2020/month=01/day=15/hour=07/
//! ```
//!
//! Because every component is zero-padded to a fixed width, comparing two key
//! tuples lexicographically is the same as comparing the times they encode. The
//! range filters built here ([`PartitionFilter`]) rely on that.
//!
//! # Contract
//!
//! - `truncate` is idempotent
//! - `next(truncate(t)) > t`
//! - `from_key(&to_key(t)) == truncate(t)`
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use tidemark_core::timebin::TimeBin;
//!
//! let t = Utc.with_ymd_and_hms(2020, 1, 15, 7, 42, 0).unwrap();
//! assert_eq!(TimeBin::Hourly.to_key(t), ["2020", "01", "15", "07"]);
//! assert_eq!(TimeBin::Hourly.path(t), "year=2020/month=01/day=15/hour=07/");
//! ```

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

const KEY_NAMES: [&str; 4] = ["year", "month", "day", "hour"];

/// Partition granularity of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBin {
    /// One partition per hour.
    #[default]
    Hourly,
    /// One partition per day.
    Daily,
}

impl TimeBin {
    /// Returns the length of one bin.
    #[must_use]
    pub fn duration(self) -> TimeDelta {
        match self {
            Self::Hourly => TimeDelta::hours(1),
            Self::Daily => TimeDelta::days(1),
        }
    }

    /// Returns the next finer granularity nested inside this one.
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Daily => Some(Self::Hourly),
            Self::Hourly => None,
        }
    }

    /// Returns the partition key column names for this granularity.
    #[must_use]
    pub fn key_names(self) -> &'static [&'static str] {
        &KEY_NAMES[..self.key_len()]
    }

    /// Returns the number of components in a partition key.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Hourly => 4,
            Self::Daily => 3,
        }
    }

    /// Floors `t` to the start of its bin.
    #[must_use]
    pub fn truncate(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let day = t.date_naive().and_time(NaiveTime::MIN).and_utc();
        match self {
            Self::Daily => day,
            Self::Hourly => day + TimeDelta::hours(i64::from(t.hour())),
        }
    }

    /// Returns the start of the bin following the one containing `t`.
    #[must_use]
    pub fn next(self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.truncate(t) + self.duration()
    }

    /// Iterates bin starts of this granularity in `[truncate(start), end)`.
    #[must_use]
    pub fn bins_between(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Bins {
        Bins {
            bin: self,
            next: self.truncate(start),
            end,
        }
    }

    /// Encodes `t` as the ordered partition key of its bin.
    #[must_use]
    pub fn to_key(self, t: DateTime<Utc>) -> Vec<String> {
        let mut key = vec![
            format!("{:04}", t.year()),
            format!("{:02}", t.month()),
            format!("{:02}", t.day()),
        ];
        if self == Self::Hourly {
            key.push(format!("{:02}", t.hour()));
        }
        key
    }

    /// Decodes a partition key back into the start of its bin.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionKeyError`] if the key has the wrong number of components,
    /// a component is not a number, or the components do not form a valid date.
    pub fn from_key<S: AsRef<str>>(self, values: &[S]) -> Result<DateTime<Utc>, PartitionKeyError> {
        if values.len() != self.key_len() {
            return Err(PartitionKeyError::WrongLength {
                expected: self.key_len(),
                actual: values.len(),
            });
        }

        let mut parts = [0_u32; 4];
        for (i, value) in values.iter().enumerate() {
            let value = value.as_ref();
            parts[i] = parse_component(KEY_NAMES[i], value)?;
        }

        let year = i32::try_from(parts[0]).map_err(|_| PartitionKeyError::InvalidComponent {
            name: KEY_NAMES[0],
            value: values[0].as_ref().to_string(),
        })?;
        let date = NaiveDate::from_ymd_opt(year, parts[1], parts[2]).ok_or_else(|| {
            PartitionKeyError::InvalidDate {
                key: join_key(values),
            }
        })?;
        let time = NaiveTime::from_hms_opt(parts[3], 0, 0).ok_or_else(|| {
            PartitionKeyError::InvalidDate {
                key: join_key(values),
            }
        })?;

        Ok(date.and_time(time).and_utc())
    }

    /// Returns the object-store path segment for the bin containing `t`.
    ///
    /// The segment ends with `/` so it can be appended to a table location.
    #[must_use]
    pub fn path(self, t: DateTime<Utc>) -> String {
        self.key_names()
            .iter()
            .zip(self.to_key(t))
            .map(|(name, value)| format!("{name}={value}/"))
            .collect()
    }

    /// Builds a filter selecting partitions in `[start, end)`.
    #[must_use]
    pub fn between(self, start: DateTime<Utc>, end: DateTime<Utc>) -> PartitionFilter {
        PartitionFilter::Between {
            bin: self,
            start: self.to_key(start),
            end: self.to_key(end),
        }
    }

    /// Builds a filter selecting partitions from the bin containing `t` onwards.
    #[must_use]
    pub fn after(self, t: DateTime<Utc>) -> PartitionFilter {
        PartitionFilter::After {
            bin: self,
            start: self.to_key(t),
        }
    }
}

impl fmt::Display for TimeBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
        }
    }
}

/// Iterator over consecutive bin starts.
#[derive(Debug, Clone)]
pub struct Bins {
    bin: TimeBin,
    next: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Iterator for Bins {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let current = self.next;
        self.next = current + self.bin.duration();
        Some(current)
    }
}

fn parse_component(name: &'static str, value: &str) -> Result<u32, PartitionKeyError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PartitionKeyError::InvalidComponent {
            name,
            value: value.to_string(),
        });
    }
    value
        .parse::<u32>()
        .map_err(|_| PartitionKeyError::InvalidComponent {
            name,
            value: value.to_string(),
        })
}

fn join_key<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}

/// Errors that can occur when decoding a partition key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionKeyError {
    /// The key has the wrong number of components for its granularity.
    #[error("partition key has {actual} components, expected {expected}")]
    WrongLength {
        /// Components required by the granularity.
        expected: usize,
        /// Components present in the key.
        actual: usize,
    },

    /// A component is not a decimal number.
    #[error("partition key component {name}={value:?} is not a number")]
    InvalidComponent {
        /// Component name (`year`, `month`, ...).
        name: &'static str,
        /// The offending value.
        value: String,
    },

    /// The components do not form a valid calendar time.
    #[error("partition key {key} is not a valid date")]
    InvalidDate {
        /// The key joined with `/`.
        key: String,
    },
}

/// Half-open range filter over partition keys.
///
/// Renders to a catalog filter expression via [`fmt::Display`] and can be
/// evaluated locally with [`PartitionFilter::matches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionFilter {
    /// Keys in `[start, end)`.
    Between {
        /// Granularity of the compared keys.
        bin: TimeBin,
        /// Inclusive lower bound.
        start: Vec<String>,
        /// Exclusive upper bound.
        end: Vec<String>,
    },
    /// Keys at or after `start`.
    After {
        /// Granularity of the compared keys.
        bin: TimeBin,
        /// Inclusive lower bound.
        start: Vec<String>,
    },
}

impl PartitionFilter {
    /// Returns true if a partition with key `values` satisfies the filter.
    #[must_use]
    pub fn matches<S: AsRef<str>>(&self, values: &[S]) -> bool {
        let (bin, start, end) = match self {
            Self::Between { bin, start, end } => (*bin, start, Some(end)),
            Self::After { bin, start } => (*bin, start, None),
        };
        if values.len() != bin.key_len() {
            return false;
        }
        let key: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
        let lower: Vec<&str> = start.iter().map(String::as_str).collect();
        if key < lower {
            return false;
        }
        end.is_none_or(|end| {
            let upper: Vec<&str> = end.iter().map(String::as_str).collect();
            key < upper
        })
    }
}

impl fmt::Display for PartitionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Between { bin, start, end } => write!(
                f,
                "({}) AND ({})",
                tuple_expression(bin.key_names(), start, ">="),
                tuple_expression(bin.key_names(), end, "<")
            ),
            Self::After { bin, start } => {
                f.write_str(&tuple_expression(bin.key_names(), start, ">="))
            }
        }
    }
}

/// Expands a tuple comparison into a disjunction of column comparisons.
///
/// `(a, b) >= (1, 2)` becomes `(a > '1') OR (a = '1' AND b >= '2')`.
fn tuple_expression(names: &[&str], values: &[String], last_op: &str) -> String {
    let strict = if last_op.starts_with('>') { ">" } else { "<" };
    let mut terms = Vec::with_capacity(names.len());
    for i in 0..names.len() {
        let mut clauses: Vec<String> = names[..i]
            .iter()
            .zip(values)
            .map(|(name, value)| format!("{name} = '{value}'"))
            .collect();
        let op = if i + 1 == names.len() { last_op } else { strict };
        clauses.push(format!("{} {op} '{}'", names[i], values[i]));
        terms.push(format!("({})", clauses.join(" AND ")));
    }
    terms.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn truncate_and_next_respect_granularity() {
        let t = at(2020, 1, 31, 23, 59);
        assert_eq!(TimeBin::Hourly.truncate(t), at(2020, 1, 31, 23, 0));
        assert_eq!(TimeBin::Daily.truncate(t), at(2020, 1, 31, 0, 0));
        assert_eq!(TimeBin::Hourly.next(t), at(2020, 2, 1, 0, 0));
        assert_eq!(TimeBin::Daily.next(t), at(2020, 2, 1, 0, 0));
    }

    #[test]
    fn key_round_trip_at_hour_boundary() {
        let t = at(2021, 12, 31, 23, 15);
        let key = TimeBin::Hourly.to_key(t);
        assert_eq!(key, ["2021", "12", "31", "23"]);
        assert_eq!(TimeBin::Hourly.from_key(&key).unwrap(), at(2021, 12, 31, 23, 0));
        assert_eq!(
            TimeBin::Daily.from_key(&TimeBin::Daily.to_key(t)).unwrap(),
            at(2021, 12, 31, 0, 0)
        );
    }

    #[test]
    fn from_key_rejects_malformed_input() {
        assert_eq!(
            TimeBin::Hourly.from_key(&["2020", "01", "01"]),
            Err(PartitionKeyError::WrongLength {
                expected: 4,
                actual: 3
            })
        );
        assert!(matches!(
            TimeBin::Daily.from_key(&["2020", "x1", "01"]),
            Err(PartitionKeyError::InvalidComponent { name: "month", .. })
        ));
        assert!(matches!(
            TimeBin::Daily.from_key(&["2020", "02", "30"]),
            Err(PartitionKeyError::InvalidDate { .. })
        ));
        assert!(matches!(
            TimeBin::Hourly.from_key(&["2020", "02", "03", "24"]),
            Err(PartitionKeyError::InvalidDate { .. })
        ));
        assert!(matches!(
            TimeBin::Hourly.from_key(&["2020", "02", "03", "-1"]),
            Err(PartitionKeyError::InvalidComponent { name: "hour", .. })
        ));
    }

    #[test]
    fn path_appends_named_segments() {
        let t = at(2020, 3, 4, 5, 0);
        assert_eq!(TimeBin::Daily.path(t), "year=2020/month=03/day=04/");
        assert_eq!(TimeBin::Hourly.path(t), "year=2020/month=03/day=04/hour=05/");
    }

    #[test]
    fn bins_between_yields_children_of_a_day() {
        let day = at(2020, 1, 1, 0, 0);
        let hours: Vec<_> = TimeBin::Hourly
            .bins_between(day, TimeBin::Daily.next(day))
            .collect();
        assert_eq!(hours.len(), 24);
        assert_eq!(hours[0], day);
        assert_eq!(hours[23], at(2020, 1, 1, 23, 0));
        assert_eq!(TimeBin::Daily.child(), Some(TimeBin::Hourly));
        assert_eq!(TimeBin::Hourly.child(), None);
    }

    #[test]
    fn between_filter_is_half_open() {
        let filter = TimeBin::Hourly.between(at(2020, 1, 1, 0, 0), at(2020, 1, 2, 0, 0));
        assert!(filter.matches(&["2020", "01", "01", "00"]));
        assert!(filter.matches(&["2020", "01", "01", "23"]));
        assert!(!filter.matches(&["2020", "01", "02", "00"]));
        assert!(!filter.matches(&["2019", "12", "31", "23"]));
        assert!(!filter.matches(&["2020", "01", "01"]));
    }

    #[test]
    fn after_filter_includes_the_starting_bin() {
        let filter = TimeBin::Hourly.after(at(2020, 6, 1, 12, 30));
        assert!(filter.matches(&["2020", "06", "01", "12"]));
        assert!(filter.matches(&["2021", "01", "01", "00"]));
        assert!(!filter.matches(&["2020", "06", "01", "11"]));
    }

    #[test]
    fn filter_renders_lexicographic_expression() {
        let filter = TimeBin::Daily.after(at(2020, 6, 1, 0, 0));
        assert_eq!(
            filter.to_string(),
            "(year > '2020') OR (year = '2020' AND month > '06') \
             OR (year = '2020' AND month = '06' AND day >= '01')"
        );

        let between = TimeBin::Daily.between(at(2020, 6, 1, 0, 0), at(2020, 7, 1, 0, 0));
        let rendered = between.to_string();
        assert!(rendered.contains("day >= '01'"));
        assert!(rendered.contains("month < '07'"));
        assert!(rendered.contains(") AND ("));
    }
}
