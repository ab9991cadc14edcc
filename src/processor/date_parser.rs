use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StructuralError;

/// How to read slash dates such as `03/04/2024`, where day and month order
/// cannot be told from the text alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePolicy {
    #[default]
    DayFirst,
    MonthFirst,
    /// Reject slash dates that are valid under both orders and disagree.
    RejectAmbiguous,
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

const DAY_FIRST: SlashFormats = SlashFormats {
    datetime: &["%d/%m/%Y %H:%M:%S", "%d/%m/%Y %H:%M"],
    date: &["%d/%m/%Y"],
};

const MONTH_FIRST: SlashFormats = SlashFormats {
    datetime: &["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"],
    date: &["%m/%d/%Y"],
};

// Excel serials between 1970-01-01 and 2199-12-31.
const EXCEL_SERIAL_RANGE: std::ops::RangeInclusive<f64> = 25569.0..=109573.0;

struct SlashFormats {
    datetime: &'static [&'static str],
    date: &'static [&'static str],
}

impl SlashFormats {
    fn parse(&self, s: &str) -> Option<NaiveDateTime> {
        parse_naive(s, self.datetime, self.date)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DateParser {
    policy: DatePolicy,
}

impl DateParser {
    pub fn new(policy: DatePolicy) -> Self {
        Self { policy }
    }

    /// Parse a review date into a UTC instant truncated to whole seconds.
    /// Values without an offset are taken as UTC.
    pub fn parse(&self, raw: &str) -> Result<DateTime<Utc>, StructuralError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(StructuralError::new("review_date", "missing value"));
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc).trunc_subsecs(0));
        }

        for fmt in OFFSET_FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
                return Ok(dt.with_timezone(&Utc).trunc_subsecs(0));
            }
        }

        if let Some(naive) = parse_naive(s, NAIVE_DATETIME_FORMATS, NAIVE_DATE_FORMATS) {
            return Ok(naive.and_utc().trunc_subsecs(0));
        }

        if s.contains('/') {
            return self.parse_slash_date(s).map(|naive| naive.and_utc());
        }

        if let Some(dt) = parse_excel_serial(s) {
            return Ok(dt);
        }

        Err(StructuralError::new(
            "review_date",
            format!("unparsable date: {:?}", raw),
        ))
    }

    fn parse_slash_date(&self, s: &str) -> Result<NaiveDateTime, StructuralError> {
        let day_first = DAY_FIRST.parse(s);
        let month_first = MONTH_FIRST.parse(s);

        let chosen = match self.policy {
            DatePolicy::DayFirst => day_first.or(month_first),
            DatePolicy::MonthFirst => month_first.or(day_first),
            DatePolicy::RejectAmbiguous => match (day_first, month_first) {
                (Some(a), Some(b)) if a != b => {
                    return Err(StructuralError::new(
                        "review_date",
                        format!("ambiguous day/month order: {:?}", s),
                    ));
                }
                (a, b) => a.or(b),
            },
        };

        chosen.ok_or_else(|| StructuralError::new("review_date", format!("unparsable date: {:?}", s)))
    }
}

fn parse_naive(s: &str, datetime_formats: &[&str], date_formats: &[&str]) -> Option<NaiveDateTime> {
    datetime_formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            date_formats
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_excel_serial(s: &str) -> Option<DateTime<Utc>> {
    let serial: f64 = s.parse().ok()?;
    if !EXCEL_SERIAL_RANGE.contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let seconds = (serial * 86_400.0).round() as i64;
    Some((epoch + Duration::seconds(seconds)).and_utc())
}

/// Canonical text form used in staging and in the warehouse. Fixed width, so
/// lexical order matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
