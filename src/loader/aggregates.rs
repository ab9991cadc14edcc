//! Derived per-business, per-period review metrics. Summaries are always
//! recomputed from the fact table, never adjusted incrementally.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{PipelineError, Result};
use crate::processor::parse_timestamp;

/// Width of an aggregation period. `Days(n)` windows are aligned to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PeriodWidth {
    Day,
    #[default]
    Month,
    Days(u32),
}

impl FromStr for PeriodWidth {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "day" | "daily" => Ok(PeriodWidth::Day),
            "month" | "monthly" => Ok(PeriodWidth::Month),
            other => other
                .strip_suffix('d')
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .map(PeriodWidth::Days)
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "invalid aggregation period {:?}; expected day, month or <N>d",
                        other
                    ))
                }),
        }
    }
}

impl TryFrom<String> for PeriodWidth {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeriodWidth> for String {
    fn from(width: PeriodWidth) -> Self {
        width.to_string()
    }
}

impl fmt::Display for PeriodWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodWidth::Day => f.write_str("day"),
            PeriodWidth::Month => f.write_str("month"),
            PeriodWidth::Days(n) => write!(f, "{}d", n),
        }
    }
}

fn midnight(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}

impl PeriodWidth {
    /// Half-open `[start, end)` of the period containing `ts`, as warehouse timestamps.
    pub fn bounds(&self, ts: &DateTime<Utc>) -> Result<(String, String)> {
        let date = ts.date_naive();
        let range = match self {
            PeriodWidth::Day => date.succ_opt().map(|next| (date, next)),
            PeriodWidth::Month => date
                .with_day(1)
                .and_then(|start| start.checked_add_months(Months::new(1)).map(|end| (start, end))),
            PeriodWidth::Days(n) => {
                let width = i64::from(*n);
                NaiveDate::from_ymd_opt(1970, 1, 1).and_then(|epoch| {
                    let offset = (date - epoch).num_days().div_euclid(width) * width;
                    let start = epoch.checked_add_signed(Duration::days(offset))?;
                    let end = start.checked_add_signed(Duration::days(width))?;
                    Some((start, end))
                })
            }
        };

        range
            .map(|(start, end)| (midnight(start), midnight(end)))
            .ok_or_else(|| {
                PipelineError::WarehouseIntegrity(format!(
                    "timestamp {} has no {} period",
                    ts.to_rfc3339(),
                    self
                ))
            })
    }

    pub fn key(&self, business_id: &str, ts: &DateTime<Utc>) -> Result<PeriodKey> {
        let (start, end) = self.bounds(ts)?;
        Ok(PeriodKey {
            business_id: business_id.to_string(),
            start,
            end,
        })
    }

    /// Key for a timestamp already stored in the warehouse.
    pub fn key_for_stored(&self, business_id: &str, reviewed_at: &str) -> Result<PeriodKey> {
        let ts = parse_timestamp(reviewed_at).ok_or_else(|| {
            PipelineError::WarehouseIntegrity(format!("stored timestamp {:?} is unreadable", reviewed_at))
        })?;
        self.key(business_id, &ts)
    }
}

/// One (business, period) summary slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodKey {
    pub business_id: String,
    pub start: String,
    pub end: String,
}

/// Recompute the summary rows for `keys` from the fact table. Periods left
/// without reviews lose their row.
pub fn rebuild(conn: &Connection, keys: &BTreeSet<PeriodKey>) -> Result<usize> {
    let mut delete = conn.prepare_cached(
        "DELETE FROM metrics_summary WHERE business_id = ?1 AND period_start = ?2",
    )?;
    let mut insert = conn.prepare_cached(
        "INSERT INTO metrics_summary (
            business_id, period_start, total_reviews, avg_rating,
            rating_1, rating_2, rating_3, rating_4, rating_5
         )
         SELECT business_id, ?2, COUNT(*), AVG(rating),
                SUM(CASE WHEN rating = 1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN rating = 2 THEN 1 ELSE 0 END),
                SUM(CASE WHEN rating = 3 THEN 1 ELSE 0 END),
                SUM(CASE WHEN rating = 4 THEN 1 ELSE 0 END),
                SUM(CASE WHEN rating = 5 THEN 1 ELSE 0 END)
         FROM review
         WHERE business_id = ?1 AND reviewed_at >= ?2 AND reviewed_at < ?3
         GROUP BY business_id",
    )?;

    let mut written = 0;
    for key in keys {
        delete.execute(params![key.business_id, key.start])?;
        written += insert.execute(params![key.business_id, key.start, key.end])?;
    }

    debug!("Rebuilt {} of {} summary periods", written, keys.len());
    Ok(written)
}

/// Drop and recompute every summary row.
pub fn rebuild_all(conn: &Connection, width: PeriodWidth) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT business_id, reviewed_at FROM review")?;
    let reviews = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut keys = BTreeSet::new();
    for (business_id, reviewed_at) in &reviews {
        keys.insert(width.key_for_stored(business_id, reviewed_at)?);
    }

    conn.execute("DELETE FROM metrics_summary", [])?;
    let written = rebuild(conn, &keys)?;
    info!("Rebuilt all metrics: {} summary rows ({} periods)", written, width);
    Ok(written)
}
