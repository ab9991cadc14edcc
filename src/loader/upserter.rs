use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::errors::Result;
use crate::loader::aggregates::{self, PeriodKey, PeriodWidth};
use crate::models::StagedRecord;
use crate::processor::format_timestamp;

/// What a merge changed, and which dimension rows and summary periods need
/// recomputing as a consequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub businesses: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub periods: BTreeSet<PeriodKey>,
}

/// The comparable part of a review; lineage is not part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReviewContent {
    business_id: String,
    user_id: String,
    reviewed_at: String,
    rating: i64,
    title: Option<String>,
    content: Option<String>,
    ip_address: Option<String>,
}

impl ReviewContent {
    fn from_record(record: &StagedRecord) -> Self {
        Self {
            business_id: record.business_id.clone(),
            user_id: record.reviewer_id.clone(),
            reviewed_at: format_timestamp(&record.reviewed_at),
            rating: i64::from(record.rating),
            title: record.title.clone(),
            content: record.content.clone(),
            ip_address: record.ip_address.clone(),
        }
    }
}

/// Sole writer of the business, user and review tables.
pub struct WarehouseUpserter {
    period: PeriodWidth,
}

impl WarehouseUpserter {
    pub fn new(period: PeriodWidth) -> Self {
        Self { period }
    }

    /// Merge a run's staged rows. Call inside the run's transaction; the
    /// caller rebuilds `outcome.periods` afterwards.
    pub fn merge(&self, conn: &Connection, records: &[StagedRecord]) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();

        for record in records {
            let reviewed_at = format_timestamp(&record.reviewed_at);
            upsert_business(conn, record, &reviewed_at)?;
            upsert_user(conn, record, &reviewed_at)?;
            self.upsert_review(conn, record, &mut outcome)?;
        }

        for business_id in &outcome.businesses {
            refresh_business(conn, business_id)?;
        }
        for user_id in &outcome.users {
            refresh_user(conn, user_id)?;
        }

        info!(
            "Merged {} rows: {} inserted, {} replaced, {} unchanged",
            records.len(),
            outcome.inserted,
            outcome.replaced,
            outcome.unchanged
        );
        Ok(outcome)
    }

    fn upsert_review(&self, conn: &Connection, record: &StagedRecord, outcome: &mut UpsertOutcome) -> Result<()> {
        let incoming = ReviewContent::from_record(record);

        let existing = conn
            .query_row(
                "SELECT business_id, user_id, reviewed_at, rating, title, content, ip_address,
                        source_file, source_row
                 FROM review WHERE review_id = ?1",
                params![record.review_id],
                |row| {
                    Ok((
                        ReviewContent {
                            business_id: row.get(0)?,
                            user_id: row.get(1)?,
                            reviewed_at: row.get(2)?,
                            rating: row.get(3)?,
                            title: row.get(4)?,
                            content: row.get(5)?,
                            ip_address: row.get(6)?,
                        },
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO review (
                        review_id, business_id, user_id, reviewed_at, rating,
                        title, content, ip_address, source_file, source_row
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        record.review_id,
                        incoming.business_id,
                        incoming.user_id,
                        incoming.reviewed_at,
                        incoming.rating,
                        incoming.title,
                        incoming.content,
                        incoming.ip_address,
                        record.lineage.source_file,
                        record.lineage.source_row,
                    ],
                )?;
                outcome.inserted += 1;
            }
            Some((current, _, _)) if current == incoming => {
                outcome.unchanged += 1;
                return Ok(());
            }
            Some((current, old_file, old_row)) => {
                conn.execute(
                    "UPDATE review SET
                        business_id = ?2, user_id = ?3, reviewed_at = ?4, rating = ?5,
                        title = ?6, content = ?7, ip_address = ?8,
                        source_file = ?9, source_row = ?10
                     WHERE review_id = ?1",
                    params![
                        record.review_id,
                        incoming.business_id,
                        incoming.user_id,
                        incoming.reviewed_at,
                        incoming.rating,
                        incoming.title,
                        incoming.content,
                        incoming.ip_address,
                        record.lineage.source_file,
                        record.lineage.source_row,
                    ],
                )?;
                info!(
                    "Corrected review {}: {}:{} -> {}:{}",
                    record.review_id, old_file, old_row, record.lineage.source_file, record.lineage.source_row
                );
                outcome.replaced += 1;

                outcome
                    .periods
                    .insert(self.period.key_for_stored(&current.business_id, &current.reviewed_at)?);
                outcome.businesses.insert(current.business_id);
                outcome.users.insert(current.user_id);
            }
        }

        outcome.businesses.insert(incoming.business_id.clone());
        outcome.users.insert(incoming.user_id.clone());
        outcome
            .periods
            .insert(self.period.key(&incoming.business_id, &record.reviewed_at)?);
        Ok(())
    }

    /// Remove a business with all its reviews and summaries, keeping the
    /// affected users' counters consistent. Returns the number of reviews removed.
    pub fn delete_business(&self, conn: &Connection, business_id: &str) -> Result<usize> {
        let users = distinct_ids(conn, "SELECT DISTINCT user_id FROM review WHERE business_id = ?1", business_id)?;
        let reviews: i64 = conn.query_row(
            "SELECT COUNT(*) FROM review WHERE business_id = ?1",
            params![business_id],
            |row| row.get(0),
        )?;

        let deleted = conn.execute("DELETE FROM business WHERE business_id = ?1", params![business_id])?;
        if deleted == 0 {
            return Ok(0);
        }
        for user_id in &users {
            refresh_user(conn, user_id)?;
        }

        info!("Deleted business {} and {} reviews", business_id, reviews);
        Ok(reviews as usize)
    }

    /// Remove a user with all their reviews, recomputing the affected
    /// businesses and summary periods. Returns the number of reviews removed.
    pub fn delete_user(&self, conn: &Connection, user_id: &str) -> Result<usize> {
        let mut stmt = conn.prepare("SELECT business_id, reviewed_at FROM review WHERE user_id = ?1")?;
        let reviews = stmt
            .query_map(params![user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut businesses = BTreeSet::new();
        let mut periods = BTreeSet::new();
        for (business_id, reviewed_at) in &reviews {
            periods.insert(self.period.key_for_stored(business_id, reviewed_at)?);
            businesses.insert(business_id.clone());
        }

        let deleted = conn.execute(r#"DELETE FROM "user" WHERE user_id = ?1"#, params![user_id])?;
        if deleted == 0 {
            return Ok(0);
        }
        for business_id in &businesses {
            refresh_business(conn, business_id)?;
        }
        aggregates::rebuild(conn, &periods)?;

        info!("Deleted user {} and {} reviews", user_id, reviews.len());
        Ok(reviews.len())
    }
}

fn upsert_business(conn: &Connection, record: &StagedRecord, reviewed_at: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO business (business_id, business_name, first_review_at, last_review_at, total_reviews)
         VALUES (?1, ?2, ?3, ?3, 0)
         ON CONFLICT(business_id) DO UPDATE SET
            business_name   = COALESCE(NULLIF(excluded.business_name, ''), business.business_name),
            first_review_at = MIN(business.first_review_at, excluded.first_review_at),
            last_review_at  = MAX(business.last_review_at, excluded.last_review_at)",
        params![record.business_id, record.business_name, reviewed_at],
    )?;
    Ok(())
}

fn upsert_user(conn: &Connection, record: &StagedRecord, reviewed_at: &str) -> Result<()> {
    conn.execute(
        r#"INSERT INTO "user" (user_id, email, user_name, country, first_review_at, total_reviews)
           VALUES (?1, ?2, ?3, ?4, ?5, 0)
           ON CONFLICT(user_id) DO UPDATE SET
              email     = COALESCE(NULLIF(excluded.email, ''), "user".email),
              user_name = COALESCE(NULLIF(excluded.user_name, ''), "user".user_name),
              country   = COALESCE(NULLIF(excluded.country, ''), "user".country),
              first_review_at = MIN("user".first_review_at, excluded.first_review_at)"#,
        params![
            record.reviewer_id,
            record.email,
            record.reviewer_name,
            record.reviewer_country,
            reviewed_at
        ],
    )?;
    Ok(())
}

/// Counter from the fact table. First/last seen only ever widen: a
/// correction or deletion never moves them inwards.
fn refresh_business(conn: &Connection, business_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE business SET
            total_reviews   = (SELECT COUNT(*) FROM review WHERE business_id = ?1),
            first_review_at = MIN(first_review_at,
                COALESCE((SELECT MIN(reviewed_at) FROM review WHERE business_id = ?1), first_review_at)),
            last_review_at  = MAX(last_review_at,
                COALESCE((SELECT MAX(reviewed_at) FROM review WHERE business_id = ?1), last_review_at))
         WHERE business_id = ?1",
        params![business_id],
    )?;
    debug!("Refreshed business {}", business_id);
    Ok(())
}

fn refresh_user(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        r#"UPDATE "user" SET
              total_reviews   = (SELECT COUNT(*) FROM review WHERE user_id = ?1),
              first_review_at = MIN(first_review_at,
                  COALESCE((SELECT MIN(reviewed_at) FROM review WHERE user_id = ?1), first_review_at))
           WHERE user_id = ?1"#,
        params![user_id],
    )?;
    debug!("Refreshed user {}", user_id);
    Ok(())
}

fn distinct_ids(conn: &Connection, sql: &str, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![key], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}
