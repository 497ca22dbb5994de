//! Core domain model for rscrape: calendar dates, day buckets and harvested records.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rscrape-core";

/// Reddit went public in 2005; nothing older can be harvested.
pub const FIRST_YEAR: i32 = 2005;

pub const DEFAULT_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

const LABEL_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DateError {
    #[error("{value} is an invalid year (expected {min}..={max})")]
    Year { value: i32, min: i32, max: i32 },
    #[error("{0} is an invalid month")]
    Month(u32),
    #[error("{day} is an invalid day for {year}-{month:02}")]
    Day { year: i32, month: u32, day: u32 },
    #[error("cannot parse date {0:?} (expected MM.DD.YYYY)")]
    Format(String),
    #[error("range begins on {begin} after it ends on {end}")]
    Reversed { begin: CalendarDate, end: CalendarDate },
    #[error("timestamp {0} is out of range")]
    Timestamp(f64),
}

pub fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

pub fn days_in_month(year: i32, month: u32) -> Result<u32, DateError> {
    let days = match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => return Err(DateError::Month(month)),
    };
    Ok(days)
}

pub fn validate_year(year: i32, current_year: i32) -> Result<i32, DateError> {
    if (FIRST_YEAR..=current_year).contains(&year) {
        Ok(year)
    } else {
        Err(DateError::Year {
            value: year,
            min: FIRST_YEAR,
            max: current_year,
        })
    }
}

pub fn validate_month(month: u32) -> Result<u32, DateError> {
    if (1..=12).contains(&month) {
        Ok(month)
    } else {
        Err(DateError::Month(month))
    }
}

pub fn validate_day(year: i32, month: u32, day: u32) -> Result<u32, DateError> {
    if (1..=days_in_month(year, month)?).contains(&day) {
        Ok(day)
    } else {
        Err(DateError::Day { year, month, day })
    }
}

/// A validated calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CalendarDate {
    year: i32,
    month: u32,
    day: u32,
}

impl CalendarDate {
    pub fn new(year: i32, month: u32, day: u32) -> Result<Self, DateError> {
        validate_month(month)?;
        validate_day(year, month, day)?;
        // The following day must exist too, so the day's bucket end is representable.
        NaiveDate::from_ymd_opt(year, month, day)
            .filter(|date| date.succ_opt().is_some())
            .map(Self::from)
            .ok_or(DateError::Day { year, month, day })
    }

    /// Parses the `MM.DD.YYYY` form accepted on the command line.
    pub fn parse_dotted(input: &str) -> Result<Self, DateError> {
        let format_err = || DateError::Format(input.to_string());
        let mut parts = input.trim().split('.');
        let (Some(month), Some(day), Some(year), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format_err());
        };
        let month = month.trim().parse::<u32>().map_err(|_| format_err())?;
        let day = day.trim().parse::<u32>().map_err(|_| format_err())?;
        let year = year.trim().parse::<i32>().map_err(|_| format_err())?;
        Self::new(year, month, day)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    fn to_naive(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
            .expect("CalendarDate is validated on construction")
    }
}

impl From<NaiveDate> for CalendarDate {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.month, self.day, self.year)
    }
}

/// One UTC calendar day: midnight through 23:59:59.999999.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateBucket {
    pub fn for_day(date: CalendarDate) -> Self {
        let start = date
            .to_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        let end = start + TimeDelta::days(1) - TimeDelta::microseconds(1);
        Self { start, end }
    }

    pub fn day(&self) -> CalendarDate {
        CalendarDate::from(self.start.date_naive())
    }

    pub fn start_epoch_seconds(&self) -> f64 {
        epoch_seconds(self.start)
    }

    pub fn end_epoch_seconds(&self) -> f64 {
        epoch_seconds(self.end)
    }

    pub fn contains(&self, created_utc: f64) -> bool {
        created_utc >= self.start_epoch_seconds() && created_utc <= self.end_epoch_seconds()
    }
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
}

/// Inclusive span of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    begin: CalendarDate,
    end: CalendarDate,
}

impl DateRange {
    pub fn new(begin: CalendarDate, end: CalendarDate) -> Result<Self, DateError> {
        if begin > end {
            return Err(DateError::Reversed { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> CalendarDate {
        self.begin
    }

    pub fn end(&self) -> CalendarDate {
        self.end
    }

    pub fn day_count(&self) -> usize {
        (self.end.to_naive() - self.begin.to_naive()).num_days() as usize + 1
    }

    /// Expands the range into one bucket per day, ascending.
    pub fn buckets(&self) -> Vec<DateBucket> {
        let end = self.end.to_naive();
        self.begin
            .to_naive()
            .iter_days()
            .take_while(|day| *day <= end)
            .map(|day| DateBucket::for_day(day.into()))
            .collect()
    }
}

/// `YYYYMMDD_HHMMSS` label for a post's UTC creation time.
pub fn created_label(created_utc: f64) -> Result<String, DateError> {
    let secs = created_utc.floor();
    if !secs.is_finite() {
        return Err(DateError::Timestamp(created_utc));
    }
    let at = DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .ok_or(DateError::Timestamp(created_utc))?;
    Ok(at.format(LABEL_FORMAT).to_string())
}

/// Last path segment of a media URL.
pub fn url_basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub url: String,
    pub created_label: String,
}

impl SubmissionRecord {
    pub fn new(url: impl Into<String>, created_label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            created_label: created_label.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}", self.created_label, url_basename(&self.url))
    }
}

pub type HarvestResult = Vec<SubmissionRecord>;

/// URL suffixes worth downloading. Matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Extensions(Vec<String>);

impl Extensions {
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for suffix in suffixes {
            let suffix = suffix.into();
            if !suffix.is_empty() && !out.contains(&suffix) {
                out.push(suffix);
            }
        }
        Self(out)
    }

    pub fn matches(&self, url: &str) -> bool {
        self.0.iter().any(|ext| url.ends_with(ext.as_str()))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for Extensions {
    fn from(suffixes: Vec<String>) -> Self {
        Self::new(suffixes)
    }
}

impl From<Extensions> for Vec<String> {
    fn from(extensions: Extensions) -> Self {
        extensions.0
    }
}

impl Default for Extensions {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

impl fmt::Display for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}
