use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DqConfig;
use crate::errors::{PipelineError, Result, StructuralError};
use crate::models::{
    QuarantinedRecord, RawRecord, ReviewCandidate, RowOutcome, RuleId, RuleViolation, StagedRecord,
};

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$";

/// Which occurrence of a repeated review id survives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupePolicy {
    #[default]
    RetainFirst,
    RetainLatest,
}

/// A row as it leaves the normalizer: the raw text plus either a typed
/// candidate or the structural reason it could not be typed.
pub type NormalizedRow = (RawRecord, std::result::Result<ReviewCandidate, StructuralError>);

#[derive(Debug, Clone, Default)]
pub struct BatchValidation {
    pub rows_read: usize,
    pub accepted: Vec<StagedRecord>,
    pub quarantined: Vec<QuarantinedRecord>,
}

impl BatchValidation {
    pub fn quarantine_rate(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.quarantined.len() as f64 / self.rows_read as f64
        }
    }
}

pub struct DqValidator {
    config: DqConfig,
    future_tolerance: Duration,
    email_regex: Regex,
}

impl DqValidator {
    pub fn new(config: DqConfig) -> Result<Self> {
        let future_tolerance = Duration::try_hours(config.future_tolerance_hours)
            .filter(|tolerance| *tolerance >= Duration::zero())
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "dq.future_tolerance_hours out of range: {}",
                    config.future_tolerance_hours
                ))
            })?;

        Ok(DqValidator {
            config,
            future_tolerance,
            email_regex: Regex::new(EMAIL_PATTERN)?,
        })
    }

    pub fn config(&self) -> &DqConfig {
        &self.config
    }

    /// Apply every row rule and collect all violations. Duplicate detection
    /// needs the whole batch and lives in [`DqValidator::validate_batch`].
    pub fn validate_row(&self, candidate: &ReviewCandidate, now: DateTime<Utc>) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        for (value, rule, name) in [
            (&candidate.review_id, RuleId::ReviewIdMissing, "review id"),
            (&candidate.business_id, RuleId::BusinessIdMissing, "business id"),
            (&candidate.reviewer_id, RuleId::ReviewerIdMissing, "reviewer id"),
        ] {
            if value.is_empty() {
                violations.push(RuleViolation::new(rule, format!("{} is empty", name)));
            }
        }

        let rating = candidate.rating;
        if rating.fract() != 0.0 {
            violations.push(RuleViolation::new(
                RuleId::RatingNotInteger,
                format!("rating {} is not an integer", rating),
            ));
        }
        if !(1.0..=5.0).contains(&rating) {
            violations.push(RuleViolation::new(
                RuleId::RatingOutOfRange,
                format!("rating {} outside 1..=5", rating),
            ));
        }

        let future = now
            .checked_add_signed(self.future_tolerance)
            .is_none_or(|latest_allowed| candidate.reviewed_at > latest_allowed);
        if future {
            violations.push(RuleViolation::new(
                RuleId::DateInFuture,
                format!("review date {} is in the future", candidate.reviewed_at.to_rfc3339()),
            ));
        }

        if self.config.enforce_email {
            if let Some(email) = &candidate.email {
                if !self.email_regex.is_match(email) {
                    violations.push(RuleViolation::new(
                        RuleId::EmailInvalid,
                        format!("invalid email address: {:?}", email),
                    ));
                }
            }
        }

        if let Some(ip) = &candidate.ip_address {
            if ip.parse::<IpAddr>().is_err() {
                violations.push(RuleViolation::new(
                    RuleId::IpInvalid,
                    format!("not an IP address: {:?}", ip),
                ));
            }
        }

        violations
    }

    /// Classify one row given the index of the occurrence that keeps its review id.
    fn classify(
        &self,
        source_file: &str,
        index: usize,
        row: NormalizedRow,
        keepers: &HashMap<String, (usize, i64)>,
        now: DateTime<Utc>,
    ) -> RowOutcome {
        let (raw, result) = row;
        let candidate = match result {
            Ok(candidate) => candidate,
            Err(err) => {
                let violation = RuleViolation::new(RuleId::Structural, err.to_string());
                return RowOutcome::Quarantined(QuarantinedRecord::from_violations(
                    source_file,
                    raw,
                    &[violation],
                ));
            }
        };

        let mut violations = self.validate_row(&candidate, now);
        if let Some(&(keeper, keeper_row)) = keepers.get(&candidate.review_id) {
            if keeper != index {
                violations.push(RuleViolation::new(
                    RuleId::DuplicateReviewId,
                    format!(
                        "duplicate review id {:?} (kept source row {})",
                        candidate.review_id, keeper_row
                    ),
                ));
            }
        }

        if violations.is_empty() {
            let rating = candidate.rating as u8;
            RowOutcome::Staged(StagedRecord::from_candidate(candidate, rating))
        } else {
            RowOutcome::Quarantined(QuarantinedRecord::from_violations(source_file, raw, &violations))
        }
    }

    /// Partition a run's rows into accepted and quarantined.
    pub fn validate_batch(
        &self,
        source_file: &str,
        rows: Vec<NormalizedRow>,
        now: DateTime<Utc>,
    ) -> BatchValidation {
        let keepers = self.duplicate_keepers(&rows);

        let mut batch = BatchValidation {
            rows_read: rows.len(),
            ..Default::default()
        };

        for (index, row) in rows.into_iter().enumerate() {
            match self.classify(source_file, index, row, &keepers, now) {
                RowOutcome::Staged(record) => batch.accepted.push(record),
                RowOutcome::Quarantined(record) => batch.quarantined.push(record),
            }
        }

        info!(
            "DQ summary for {}: {} read, {} accepted, {} quarantined",
            source_file,
            batch.rows_read,
            batch.accepted.len(),
            batch.quarantined.len()
        );

        batch
    }

    /// For each review id, the row index (and source row) that survives under
    /// the configured policy.
    fn duplicate_keepers(&self, rows: &[NormalizedRow]) -> HashMap<String, (usize, i64)> {
        let mut keepers: HashMap<String, (usize, i64)> = HashMap::new();
        for (index, (raw, result)) in rows.iter().enumerate() {
            let Ok(candidate) = result else { continue };
            if candidate.review_id.is_empty() {
                continue;
            }
            match self.config.dedupe_policy {
                DedupePolicy::RetainFirst => {
                    keepers
                        .entry(candidate.review_id.clone())
                        .or_insert((index, raw.source_row));
                }
                DedupePolicy::RetainLatest => {
                    keepers.insert(candidate.review_id.clone(), (index, raw.source_row));
                }
            }
        }
        keepers
    }

    /// True when the run's quarantine rate crosses the configured threshold.
    pub fn is_degraded(&self, batch: &BatchValidation) -> bool {
        let rate = batch.quarantine_rate();
        let degraded = batch.rows_read > 0 && rate > self.config.quarantine_rate_threshold;
        if degraded {
            warn!(
                "Quarantine rate {:.1}% exceeds threshold {:.1}%",
                rate * 100.0,
                self.config.quarantine_rate_threshold * 100.0
            );
        }
        degraded
    }
}
