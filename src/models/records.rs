use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One spreadsheet row keyed by the header text exactly as it appeared in the
/// file. `source_row` is the spreadsheet row number (header is row 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_row: i64,
    pub values: BTreeMap<String, String>,
    /// Set when a cell could not be decoded; `values` then holds lossy text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_error: Option<String>,
}

impl RawRecord {
    pub fn new(source_row: i64) -> Self {
        Self {
            source_row,
            values: BTreeMap::new(),
            encoding_error: None,
        }
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.values.get(header).map(String::as_str)
    }

    pub fn is_blank(&self) -> bool {
        self.values.values().all(|v| v.trim().is_empty())
    }
}

/// Where a row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub source_file: String,
    pub source_row: i64,
}

/// A typed row that has not yet passed the data-quality rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub review_id: String,
    pub business_id: String,
    pub reviewer_id: String,
    pub rating: f64,
    pub reviewed_at: DateTime<Utc>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub ip_address: Option<String>,
    pub email: Option<String>,
    pub reviewer_name: Option<String>,
    pub reviewer_country: Option<String>,
    pub business_name: Option<String>,
    pub lineage: Lineage,
}

/// Canonical review row. Every instance has passed normalization and all
/// data-quality rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub review_id: String,
    pub business_id: String,
    pub reviewer_id: String,
    pub rating: u8,
    pub reviewed_at: DateTime<Utc>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub ip_address: Option<String>,
    pub email: Option<String>,
    pub reviewer_name: Option<String>,
    pub reviewer_country: Option<String>,
    pub business_name: Option<String>,
    pub lineage: Lineage,
}

impl StagedRecord {
    /// Promote a candidate whose rating has been checked to be an integer in 1..=5.
    pub(crate) fn from_candidate(candidate: ReviewCandidate, rating: u8) -> Self {
        Self {
            review_id: candidate.review_id,
            business_id: candidate.business_id,
            reviewer_id: candidate.reviewer_id,
            rating,
            reviewed_at: candidate.reviewed_at,
            title: candidate.title,
            content: candidate.content,
            ip_address: candidate.ip_address,
            email: candidate.email,
            reviewer_name: candidate.reviewer_name,
            reviewer_country: candidate.reviewer_country,
            business_name: candidate.business_name,
            lineage: candidate.lineage,
        }
    }
}

/// Identifiers of the rules a row can violate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    Structural,
    ReviewIdMissing,
    BusinessIdMissing,
    ReviewerIdMissing,
    RatingNotInteger,
    RatingOutOfRange,
    DateInFuture,
    EmailInvalid,
    IpInvalid,
    DuplicateReviewId,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::Structural => "structural",
            RuleId::ReviewIdMissing => "review_id_missing",
            RuleId::BusinessIdMissing => "business_id_missing",
            RuleId::ReviewerIdMissing => "reviewer_id_missing",
            RuleId::RatingNotInteger => "rating_not_integer",
            RuleId::RatingOutOfRange => "rating_out_of_range",
            RuleId::DateInFuture => "date_in_future",
            RuleId::EmailInvalid => "email_invalid",
            RuleId::IpInvalid => "ip_invalid",
            RuleId::DuplicateReviewId => "duplicate_review_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [RuleId; 10] = [
            RuleId::Structural,
            RuleId::ReviewIdMissing,
            RuleId::BusinessIdMissing,
            RuleId::ReviewerIdMissing,
            RuleId::RatingNotInteger,
            RuleId::RatingOutOfRange,
            RuleId::DateInFuture,
            RuleId::EmailInvalid,
            RuleId::IpInvalid,
            RuleId::DuplicateReviewId,
        ];
        ALL.into_iter().find(|rule| rule.as_str() == s.trim())
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule failure with a human readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule: RuleId,
    pub detail: String,
}

impl RuleViolation {
    pub fn new(rule: RuleId, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

/// A rejected row held for manual remediation. Never merged into the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub source_file: String,
    pub raw: RawRecord,
    pub rules: Vec<RuleId>,
    pub reason: String,
}

impl QuarantinedRecord {
    pub fn from_violations(source_file: &str, raw: RawRecord, violations: &[RuleViolation]) -> Self {
        let mut rules: Vec<RuleId> = violations.iter().map(|v| v.rule).collect();
        rules.dedup();
        let reason = violations
            .iter()
            .map(|v| v.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            source_file: source_file.to_string(),
            raw,
            rules,
            reason,
        }
    }

    pub fn has_rule(&self, rule: RuleId) -> bool {
        self.rules.contains(&rule)
    }
}

/// Every row leaves validation as exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Staged(StagedRecord),
    Quarantined(QuarantinedRecord),
}
