use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::Result;
use crate::loader::audit::AuditRecorder;

/// Streaming SHA-256 of the file bytes as lowercase hex.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { fingerprint: String },
    AlreadyLoaded { fingerprint: String, audit_id: i64 },
}

impl Admission {
    pub fn fingerprint(&self) -> &str {
        match self {
            Admission::Admitted { fingerprint } | Admission::AlreadyLoaded { fingerprint, .. } => fingerprint,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Decides by content alone whether a file still needs loading. Names, paths
/// and modification times play no part.
pub struct IdempotencyGuard;

impl IdempotencyGuard {
    pub fn check(conn: &Connection, path: &Path) -> Result<Admission> {
        let fingerprint = fingerprint_file(path)?;
        debug!("Fingerprint of {}: {}", path.display(), fingerprint);

        let admission = Self::check_fingerprint(conn, &fingerprint)?;
        if let Admission::AlreadyLoaded { audit_id, .. } = &admission {
            info!(
                "Skipping {}: identical content already loaded (audit entry {})",
                path.display(),
                audit_id
            );
        }
        Ok(admission)
    }

    pub fn check_fingerprint(conn: &Connection, fingerprint: &str) -> Result<Admission> {
        Ok(match AuditRecorder::loaded_entry(conn, fingerprint)? {
            Some(audit_id) => Admission::AlreadyLoaded {
                fingerprint: fingerprint.to_string(),
                audit_id,
            },
            None => Admission::Admitted {
                fingerprint: fingerprint.to_string(),
            },
        })
    }
}
