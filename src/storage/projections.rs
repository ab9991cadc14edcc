//! Typed readers over the serving views. The public projection never carries
//! PII; the privileged one adds email, reviewer name and network address.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::loader::audit::AuditRecorder;
use crate::models::{Business, LoadAudit, MetricsSummary, Review, User};
use crate::processor::format_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    Public,
    Privileged,
}

impl Projection {
    fn view(&self) -> &'static str {
        match self {
            Projection::Public => "v_reviews_public",
            Projection::Privileged => "v_reviews_private",
        }
    }

    fn columns(&self) -> &'static str {
        match self {
            Projection::Public => {
                "review_id, business_id, user_id, reviewed_at, rating, title, content, \
                 NULL AS email, NULL AS user_name, NULL AS ip_address"
            }
            Projection::Privileged => {
                "review_id, business_id, user_id, reviewed_at, rating, title, content, \
                 email, user_name, ip_address"
            }
        }
    }
}

/// A review as seen by a consumer. PII fields are `None` in the public projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewView {
    pub review_id: String,
    pub business_id: String,
    pub user_id: String,
    pub reviewed_at: String,
    pub rating: i64,
    pub title: Option<String>,
    pub content: Option<String>,
    pub email: Option<String>,
    pub user_name: Option<String>,
    pub ip_address: Option<String>,
}

/// Half-open `[from, to)` window on the review timestamp; either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    fn bounds(&self) -> (Option<String>, Option<String>) {
        (
            self.from.as_ref().map(format_timestamp),
            self.to.as_ref().map(format_timestamp),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub total_reviews: i64,
    pub latest_load: Option<LoadAudit>,
}

fn review_view(row: &Row<'_>) -> rusqlite::Result<ReviewView> {
    Ok(ReviewView {
        review_id: row.get(0)?,
        business_id: row.get(1)?,
        user_id: row.get(2)?,
        reviewed_at: row.get(3)?,
        rating: row.get(4)?,
        title: row.get(5)?,
        content: row.get(6)?,
        email: row.get(7)?,
        user_name: row.get(8)?,
        ip_address: row.get(9)?,
    })
}

fn query_reviews(
    conn: &Connection,
    projection: Projection,
    key_column: &str,
    key: &str,
    range: DateRange,
) -> Result<Vec<ReviewView>> {
    let sql = format!(
        "SELECT {} FROM {}
         WHERE {} = ?1
           AND (?2 IS NULL OR reviewed_at >= ?2)
           AND (?3 IS NULL OR reviewed_at < ?3)
         ORDER BY reviewed_at, review_id",
        projection.columns(),
        projection.view(),
        key_column
    );
    let (from, to) = range.bounds();

    let mut stmt = conn.prepare(&sql)?;
    let reviews = stmt
        .query_map(params![key, from, to], review_view)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(reviews)
}

pub fn reviews_for_business(
    conn: &Connection,
    projection: Projection,
    business_id: &str,
    range: DateRange,
) -> Result<Vec<ReviewView>> {
    query_reviews(conn, projection, "business_id", business_id, range)
}

pub fn reviews_for_user(
    conn: &Connection,
    projection: Projection,
    user_id: &str,
    range: DateRange,
) -> Result<Vec<ReviewView>> {
    query_reviews(conn, projection, "user_id", user_id, range)
}

pub fn get_business(conn: &Connection, business_id: &str) -> Result<Option<Business>> {
    let business = conn
        .query_row(
            "SELECT business_id, business_name, first_review_at, last_review_at, total_reviews
             FROM business WHERE business_id = ?1",
            params![business_id],
            |row| {
                Ok(Business {
                    business_id: row.get(0)?,
                    business_name: row.get(1)?,
                    first_review_at: row.get(2)?,
                    last_review_at: row.get(3)?,
                    total_reviews: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(business)
}

/// Account lookup. Returns PII; callers gate access.
pub fn get_user(conn: &Connection, user_id: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            r#"SELECT user_id, email, user_name, country, first_review_at, total_reviews
               FROM "user" WHERE user_id = ?1"#,
            params![user_id],
            |row| {
                Ok(User {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                    user_name: row.get(2)?,
                    country: row.get(3)?,
                    first_review_at: row.get(4)?,
                    total_reviews: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

/// Full fact row including lineage.
pub fn get_review(conn: &Connection, review_id: &str) -> Result<Option<Review>> {
    let review = conn
        .query_row(
            "SELECT review_id, business_id, user_id, reviewed_at, rating, title, content,
                    ip_address, source_file, source_row
             FROM review WHERE review_id = ?1",
            params![review_id],
            |row| {
                Ok(Review {
                    review_id: row.get(0)?,
                    business_id: row.get(1)?,
                    user_id: row.get(2)?,
                    reviewed_at: row.get(3)?,
                    rating: row.get(4)?,
                    title: row.get(5)?,
                    content: row.get(6)?,
                    ip_address: row.get(7)?,
                    source_file: row.get(8)?,
                    source_row: row.get(9)?,
                })
            },
        )
        .optional()?;
    Ok(review)
}

pub fn metrics_for_business(conn: &Connection, business_id: &str) -> Result<Vec<MetricsSummary>> {
    let mut stmt = conn.prepare(
        "SELECT business_id, period_start, total_reviews, avg_rating,
                rating_1, rating_2, rating_3, rating_4, rating_5
         FROM metrics_summary
         WHERE business_id = ?1
         ORDER BY period_start",
    )?;
    let metrics = stmt
        .query_map(params![business_id], |row| {
            Ok(MetricsSummary {
                business_id: row.get(0)?,
                period_start: row.get(1)?,
                total_reviews: row.get(2)?,
                avg_rating: row.get(3)?,
                histogram: [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?],
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(metrics)
}

pub fn review_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM review", [], |row| row.get(0))?)
}

pub fn health(conn: &Connection) -> Result<Health> {
    Ok(Health {
        total_reviews: review_count(conn)?,
        latest_load: AuditRecorder::latest(conn)?,
    })
}
