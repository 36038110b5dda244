use chrono::format::{parse, Parsed, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::LastBackupError;

/// Year of the "never executed" sentinel.
pub const SENTINEL_YEAR: i32 = 1990;

/// Timestamp standing in for "no backup has ever been observed".
pub fn never_executed_sentinel() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(SENTINEL_YEAR, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

pub fn is_sentinel(ts: &NaiveDateTime) -> bool {
    use chrono::Datelike;
    ts.year() == SENTINEL_YEAR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalKind {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Hourly,
}

impl IntervalKind {
    /// Catalog iteration order, coarsest first.
    pub const ALL: [IntervalKind; 5] = [
        IntervalKind::Yearly,
        IntervalKind::Monthly,
        IntervalKind::Weekly,
        IntervalKind::Daily,
        IntervalKind::Hourly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalKind::Yearly => "yearly",
            IntervalKind::Monthly => "monthly",
            IntervalKind::Weekly => "weekly",
            IntervalKind::Daily => "daily",
            IntervalKind::Hourly => "hourly",
        }
    }

    pub fn definition(&self) -> &'static IntervalDefinition {
        definition_for(*self)
    }
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalKind {
    type Err = LastBackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntervalKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LastBackupError::UnknownIntervalKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalDefinition {
    pub kind: IntervalKind,
    pub date_format: &'static str,
    pub coarsening_format: Option<&'static str>,
    pub display_format: &'static str,
    pub unit_seconds: i64,
    pub unit_singular: &'static str,
    pub unit_plural: &'static str,
}

const DAY: i64 = 60 * 60 * 24;

static CATALOG: [IntervalDefinition; 5] = [
    IntervalDefinition {
        kind: IntervalKind::Yearly,
        date_format: "%Y",
        coarsening_format: None,
        display_format: "%Y",
        unit_seconds: DAY * 365,
        unit_singular: "year",
        unit_plural: "years",
    },
    IntervalDefinition {
        kind: IntervalKind::Monthly,
        date_format: "%Y%m",
        coarsening_format: None,
        display_format: "%m",
        unit_seconds: DAY * 31,
        unit_singular: "month",
        unit_plural: "months",
    },
    IntervalDefinition {
        kind: IntervalKind::Weekly,
        date_format: "%Y%V",
        // ISO week numbers cannot be parsed back without a weekday
        coarsening_format: Some("%Y%m%d"),
        display_format: "%V",
        unit_seconds: DAY * 7,
        unit_singular: "week",
        unit_plural: "weeks",
    },
    IntervalDefinition {
        kind: IntervalKind::Daily,
        date_format: "%Y%m%d",
        coarsening_format: None,
        display_format: "%d",
        unit_seconds: DAY,
        unit_singular: "day",
        unit_plural: "days",
    },
    IntervalDefinition {
        kind: IntervalKind::Hourly,
        date_format: "%Y%m%d%H",
        coarsening_format: None,
        display_format: "%H",
        unit_seconds: 60 * 60,
        unit_singular: "hour",
        unit_plural: "hours",
    },
];

pub fn definition_for(kind: IntervalKind) -> &'static IntervalDefinition {
    // CATALOG is laid out in IntervalKind::ALL order
    &CATALOG[kind as usize]
}

impl IntervalDefinition {
    /// Format used to strip precision finer than this interval.
    pub fn effective_coarsening_format(&self) -> &'static str {
        self.coarsening_format.unwrap_or(self.date_format)
    }

    /// Drops everything finer than the interval's granularity, e.g. the hour of a daily run.
    pub fn coarsen(&self, ts: &NaiveDateTime) -> Result<NaiveDateTime, chrono::ParseError> {
        let fmt = self.effective_coarsening_format();
        parse_lenient(&ts.format(fmt).to_string(), fmt)
    }

    pub fn unit_label(&self, count: i64) -> &'static str {
        if count == 1 {
            self.unit_singular
        } else {
            self.unit_plural
        }
    }
}

/// Parses `input` with a strftime `format` that may omit fields.
///
/// Missing month/day default to 1 and a missing time of day to midnight, so
/// `"2024"` parsed with `"%Y"` yields 2024-01-01T00:00:00.
pub fn parse_lenient(input: &str, format: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    let mut parsed = Parsed::new();
    parse(&mut parsed, input, StrftimeItems::new(format))?;

    if parsed.ordinal().is_none() {
        if parsed.month().is_none() {
            parsed.set_month(1)?;
        }
        if parsed.day().is_none() {
            parsed.set_day(1)?;
        }
    }
    if parsed.hour_div_12().is_none() && parsed.hour_mod_12().is_none() {
        parsed.set_hour(0)?;
    }
    if parsed.minute().is_none() {
        parsed.set_minute(0)?;
    }
    if parsed.second().is_none() {
        parsed.set_second(0)?;
    }

    parsed.to_naive_datetime_with_offset(0)
}
