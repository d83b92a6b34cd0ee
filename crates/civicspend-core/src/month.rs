//! Calendar-month keys for vendor-month time series.
//!
//! A [`YearMonth`] renders as `YYYY-MM`, which is also the on-disk format in
//! `monthly_vendor_spend.year_month`, so lexicographic and chronological
//! order coincide.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonthParseError {
    #[error("expected YYYY-MM, got {0:?}")]
    Format(String),
    #[error("month out of range in {0:?}")]
    Range(String),
}

/// A calendar month (year + month 1..=12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// Month of year, 1 = January.
    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Month of an ISO action date (`YYYY-MM-DD`, optionally followed by a
    /// time part). Returns `None` for anything unparseable.
    pub fn from_action_date(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let date_part = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .ok()
            .map(Self::from_date)
    }

    /// The following calendar month.
    pub fn succ(&self) -> Self {
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
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = MonthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| MonthParseError::Format(s.to_string()))?;
        let year: i32 = y
            .parse()
            .map_err(|_| MonthParseError::Format(s.to_string()))?;
        let month: u32 = m
            .parse()
            .map_err(|_| MonthParseError::Format(s.to_string()))?;
        Self::new(year, month).ok_or_else(|| MonthParseError::Range(s.to_string()))
    }
}

impl TryFrom<String> for YearMonth {
    type Error = MonthParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_zero_padded() {
        assert_eq!(YearMonth::new(2024, 3).unwrap().to_string(), "2024-03");
    }

    #[test]
    fn parse_roundtrips_display() {
        let ym: YearMonth = "2024-11".parse().unwrap();
        assert_eq!(ym, YearMonth::new(2024, 11).unwrap());
    }

    #[test]
    fn parse_rejects_bad_month() {
        assert!(matches!(
            "2024-13".parse::<YearMonth>(),
            Err(MonthParseError::Range(_))
        ));
        assert!(matches!(
            "2024".parse::<YearMonth>(),
            Err(MonthParseError::Format(_))
        ));
    }

    #[test]
    fn action_date_variants() {
        let expected = YearMonth::new(2024, 2);
        assert_eq!(YearMonth::from_action_date("2024-02-29"), expected);
        assert_eq!(YearMonth::from_action_date("2024-02-01T00:00:00"), expected);
        assert_eq!(YearMonth::from_action_date(" 2024-02-10 "), expected);
        assert_eq!(YearMonth::from_action_date("02/10/2024"), None);
        assert_eq!(YearMonth::from_action_date(""), None);
        assert_eq!(YearMonth::from_action_date("2023-02-29"), None);
    }

    #[test]
    fn chronological_order_matches_text_order() {
        let dec = YearMonth::new(2023, 12).unwrap();
        let jan = dec.succ();
        assert_eq!(jan, YearMonth::new(2024, 1).unwrap());
        assert!(dec < jan);
        assert!(dec.to_string() < jan.to_string());
    }

    #[test]
    fn serde_as_string() {
        let ym = YearMonth::new(2024, 7).unwrap();
        let json = serde_json::to_string(&ym).unwrap();
        assert_eq!(json, "\"2024-07\"");
        let back: YearMonth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ym);
    }
}
