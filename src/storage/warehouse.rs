//! SQLite warehouse handle: schema, pragmas and the per-run transaction scope.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::Result;

const PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;
PRAGMA synchronous=NORMAL;
";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS business (
    business_id       TEXT PRIMARY KEY,
    business_name     TEXT,
    first_review_at   TEXT NOT NULL,
    last_review_at    TEXT NOT NULL,
    total_reviews     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS "user" (
    user_id           TEXT PRIMARY KEY,
    email             TEXT,
    user_name         TEXT,
    country           TEXT,
    first_review_at   TEXT NOT NULL,
    total_reviews     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS review (
    review_id         TEXT PRIMARY KEY,
    business_id       TEXT NOT NULL,
    user_id           TEXT NOT NULL,
    reviewed_at       TEXT NOT NULL,
    rating            INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    title             TEXT,
    content           TEXT,
    ip_address        TEXT,
    source_file       TEXT NOT NULL,
    source_row        INTEGER NOT NULL,
    FOREIGN KEY (business_id) REFERENCES business(business_id) ON DELETE CASCADE,
    FOREIGN KEY (user_id)     REFERENCES "user"(user_id)       ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS metrics_summary (
    business_id       TEXT NOT NULL,
    period_start      TEXT NOT NULL,
    total_reviews     INTEGER NOT NULL,
    avg_rating        REAL NOT NULL,
    rating_1          INTEGER NOT NULL,
    rating_2          INTEGER NOT NULL,
    rating_3          INTEGER NOT NULL,
    rating_4          INTEGER NOT NULL,
    rating_5          INTEGER NOT NULL,
    PRIMARY KEY (business_id, period_start),
    FOREIGN KEY (business_id) REFERENCES business(business_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS load_audit (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id            TEXT NOT NULL,
    file_name         TEXT NOT NULL,
    file_path         TEXT NOT NULL,
    fingerprint       TEXT NOT NULL,
    started_at        TEXT NOT NULL,
    finished_at       TEXT NOT NULL,
    rows_read         INTEGER NOT NULL DEFAULT 0,
    rows_accepted     INTEGER NOT NULL DEFAULT 0,
    rows_quarantined  INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL
        CHECK (status IN ('success', 'degraded', 'skipped', 'failed', 'aborted')),
    message           TEXT,
    stage_path        TEXT,
    quarantine_path   TEXT
);

CREATE INDEX IF NOT EXISTS idx_review_business   ON review(business_id);
CREATE INDEX IF NOT EXISTS idx_review_user       ON review(user_id);
CREATE INDEX IF NOT EXISTS idx_review_date       ON review(reviewed_at);
CREATE INDEX IF NOT EXISTS idx_audit_fingerprint ON load_audit(fingerprint, status);

DROP VIEW IF EXISTS v_reviews_public;
CREATE VIEW v_reviews_public AS
SELECT
    r.review_id,
    r.business_id,
    r.user_id,
    r.reviewed_at,
    r.rating,
    r.title,
    r.content
FROM review r;

DROP VIEW IF EXISTS v_reviews_private;
CREATE VIEW v_reviews_private AS
SELECT
    r.review_id,
    r.business_id,
    r.user_id,
    r.reviewed_at,
    r.rating,
    r.title,
    r.content,
    u.email,
    u.user_name,
    r.ip_address
FROM review r
JOIN "user" u ON u.user_id = r.user_id;
"#;

/// Objects the serving layer depends on.
pub const EXPECTED_OBJECTS: [&str; 7] = [
    "business",
    "user",
    "review",
    "metrics_summary",
    "load_audit",
    "v_reviews_public",
    "v_reviews_private",
];

/// Explicit storage handle. Writers go through [`Warehouse::transaction`];
/// there is no shared global connection.
pub struct Warehouse {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    pub foreign_keys_on: bool,
    pub journal_mode: String,
    pub objects: Vec<(String, String)>,
    pub missing: Vec<String>,
}

impl Warehouse {
    /// Open (creating if needed) a warehouse file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(PRAGMAS)?;
        let warehouse = Self { conn };
        warehouse.init_schema()?;
        info!("Opened warehouse at {}", path.display());
        Ok(warehouse)
    }

    /// Read-only handle for the serving side. Sees only committed runs.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// In-memory warehouse (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let warehouse = Self { conn };
        warehouse.init_schema()?;
        Ok(warehouse)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        debug!("Warehouse schema ensured");
        Ok(())
    }

    /// Shared access for queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside one transaction. Commits when `f` returns `Ok`; any error
    /// (or unwinding) drops the transaction, which rolls it back.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn verify(&self) -> Result<SchemaReport> {
        let foreign_keys_on: i64 = self.conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let journal_mode: String = self.conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT name, type FROM sqlite_master
             WHERE type IN ('table', 'view')
             ORDER BY type, name",
        )?;
        let objects: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;

        let missing = EXPECTED_OBJECTS
            .iter()
            .filter(|name| !objects.iter().any(|(n, _)| n == *name))
            .map(|name| name.to_string())
            .collect();

        Ok(SchemaReport {
            foreign_keys_on: foreign_keys_on == 1,
            journal_mode,
            objects,
            missing,
        })
    }
}
