use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

use crate::errors::{PipelineError, Result};
use crate::models::{LoadAudit, NewAuditEntry, RunStatus};
use crate::processor::format_timestamp;

const AUDIT_COLUMNS: &str = "id, run_id, file_name, file_path, fingerprint, started_at, finished_at,
    rows_read, rows_accepted, rows_quarantined, status, message, stage_path, quarantine_path";

/// Sole writer of the append-only load ledger.
pub struct AuditRecorder;

impl AuditRecorder {
    /// Append one entry, stamped with the finish time. Pass the run's
    /// transaction to make the entry part of the merge.
    pub fn record(conn: &Connection, entry: &NewAuditEntry) -> Result<i64> {
        let finished_at = format_timestamp(&Utc::now());
        conn.execute(
            "INSERT INTO load_audit (
                run_id, file_name, file_path, fingerprint, started_at, finished_at,
                rows_read, rows_accepted, rows_quarantined, status, message,
                stage_path, quarantine_path
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.run_id,
                entry.file_name,
                entry.file_path,
                entry.fingerprint,
                entry.started_at,
                finished_at,
                entry.rows_read,
                entry.rows_accepted,
                entry.rows_quarantined,
                entry.status.as_str(),
                entry.message,
                entry.stage_path,
                entry.quarantine_path,
            ],
        )?;

        let id = conn.last_insert_rowid();
        info!(
            "Audit #{} {} {}: read={} accepted={} quarantined={}",
            id,
            entry.file_name,
            entry.status,
            entry.rows_read,
            entry.rows_accepted,
            entry.rows_quarantined
        );
        Ok(id)
    }

    pub fn latest(conn: &Connection) -> Result<Option<LoadAudit>> {
        let sql = format!("SELECT {} FROM load_audit ORDER BY id DESC LIMIT 1", AUDIT_COLUMNS);
        let entry = conn.query_row(&sql, [], audit_row).optional()?;
        entry.transpose()
    }

    /// Whole ledger, oldest first.
    pub fn entries(conn: &Connection) -> Result<Vec<LoadAudit>> {
        let sql = format!("SELECT {} FROM load_audit ORDER BY id", AUDIT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], audit_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Id of the first entry that loaded content with this fingerprint.
    pub fn loaded_entry(conn: &Connection, fingerprint: &str) -> Result<Option<i64>> {
        let id = conn
            .query_row(
                "SELECT id FROM load_audit
                 WHERE fingerprint = ?1 AND status IN ('success', 'degraded')
                 ORDER BY id LIMIT 1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

// Unknown status text is a ledger corruption, reported per row.
fn audit_row(row: &Row<'_>) -> rusqlite::Result<Result<LoadAudit>> {
    let status: String = row.get(10)?;
    let Some(status) = RunStatus::parse(&status) else {
        return Ok(Err(PipelineError::WarehouseIntegrity(format!(
            "unknown load status {:?}",
            status
        ))));
    };

    Ok(Ok(LoadAudit {
        id: row.get(0)?,
        run_id: row.get(1)?,
        file_name: row.get(2)?,
        file_path: row.get(3)?,
        fingerprint: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        rows_read: row.get(7)?,
        rows_accepted: row.get(8)?,
        rows_quarantined: row.get(9)?,
        status,
        message: row.get(11)?,
        stage_path: row.get(12)?,
        quarantine_path: row.get(13)?,
    }))
}
