//! UTC calendar-month bucketing.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A UTC calendar month. Quota counters and records are bucketed by this key,
/// so rollover happens by key change rather than by explicit reset.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && NaiveDate::from_ymd_opt(year, month, 1).is_some() {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Months since year zero; orders like the key itself.
    pub(crate) fn ordinal(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    /// First day of the month.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MAX)
    }

    /// Midnight UTC on the first day of the month.
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.first_day().and_time(NaiveTime::MIN).and_utc()
    }

    /// Midnight UTC on the first day of the following month, regardless of
    /// the caller's time zone.
    pub fn resets_at(&self) -> DateTime<Utc> {
        self.next().starts_at()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        Self::of(at) == *self
    }
}

impl std::fmt::Display for MonthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid month key '{0}': expected YYYY-MM")]
pub struct InvalidMonthKey(pub String);

impl FromStr for MonthKey {
    type Err = InvalidMonthKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMonthKey(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = InvalidMonthKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.to_string()
    }
}

impl From<NaiveDate> for MonthKey {
    fn from(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_month_of_instant() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 23, 59, 59).unwrap();
        let key = MonthKey::of(at);
        assert_eq!(key, MonthKey::new(2026, 10).unwrap());
        assert_eq!(key.to_string(), "2026-10");
        assert!(key.contains(at));
    }

    #[test]
    fn test_resets_at_first_of_next_month() {
        let key = MonthKey::new(2026, 10).unwrap();
        assert_eq!(
            key.resets_at(),
            Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap()
        );

        // December rolls into January of the next year
        let december = MonthKey::new(2026, 12).unwrap();
        assert_eq!(december.next(), MonthKey::new(2027, 1).unwrap());
        assert_eq!(
            december.resets_at(),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_boundary_instants() {
        let last_second = Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).unwrap();
        let first_second = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert_ne!(MonthKey::of(last_second), MonthKey::of(first_second));
        assert_eq!(MonthKey::of(last_second).resets_at(), first_second);
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "2027-03".parse::<MonthKey>().unwrap(),
            MonthKey::new(2027, 3).unwrap()
        );
        assert!("2027-13".parse::<MonthKey>().is_err());
        assert!("2027-3".parse::<MonthKey>().is_err());
        assert!("202703".parse::<MonthKey>().is_err());
        assert!(MonthKey::new(2027, 0).is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let key = MonthKey::new(2026, 7).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2026-07\"");
        let back: MonthKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
