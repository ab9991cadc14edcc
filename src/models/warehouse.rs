use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub business_id: String,
    pub business_name: Option<String>,
    pub first_review_at: String,
    pub last_review_at: String,
    pub total_reviews: i64,
}

/// Reviewer dimension. `email` and `user_name` are PII and only leave the
/// warehouse through the privileged projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: Option<String>,
    pub user_name: Option<String>,
    pub country: Option<String>,
    pub first_review_at: String,
    pub total_reviews: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub review_id: String,
    pub business_id: String,
    pub user_id: String,
    pub reviewed_at: String,
    pub rating: i64,
    pub title: Option<String>,
    pub content: Option<String>,
    pub ip_address: Option<String>,
    pub source_file: String,
    pub source_row: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub business_id: String,
    pub period_start: String,
    pub total_reviews: i64,
    pub avg_rating: f64,
    /// Count of reviews per rating, index 0 holds rating 1.
    pub histogram: [i64; 5],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Loaded, but the quarantine rate crossed the configured threshold.
    Degraded,
    /// Content fingerprint already loaded; nothing was read.
    Skipped,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Degraded => "degraded",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "degraded" => Some(RunStatus::Degraded),
            "skipped" => Some(RunStatus::Skipped),
            "failed" => Some(RunStatus::Failed),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }

    /// Statuses that count as "already processed" for the idempotency guard.
    pub fn is_loaded(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Degraded)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry as written by the audit recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub run_id: String,
    pub file_name: String,
    pub file_path: String,
    pub fingerprint: String,
    pub started_at: String,
    pub rows_read: i64,
    pub rows_accepted: i64,
    pub rows_quarantined: i64,
    pub status: RunStatus,
    pub message: Option<String>,
    pub stage_path: Option<String>,
    pub quarantine_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAudit {
    pub id: i64,
    pub run_id: String,
    pub file_name: String,
    pub file_path: String,
    pub fingerprint: String,
    pub started_at: String,
    pub finished_at: String,
    pub rows_read: i64,
    pub rows_accepted: i64,
    pub rows_quarantined: i64,
    pub status: RunStatus,
    pub message: Option<String>,
    pub stage_path: Option<String>,
    pub quarantine_path: Option<String>,
}
