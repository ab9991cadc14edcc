use std::collections::HashMap;

use tracing::debug;

use crate::errors::StructuralError;
use crate::models::{Lineage, RawRecord, ReviewCandidate};
use crate::processor::date_parser::{DateParser, DatePolicy};

pub const REVIEW_ID: &str = "review_id";
pub const REVIEWER_ID: &str = "reviewer_id";
pub const BUSINESS_ID: &str = "business_id";
pub const RATING: &str = "rating";
pub const REVIEW_DATE: &str = "review_date";
pub const TITLE: &str = "title";
pub const CONTENT: &str = "content";
pub const IP_ADDRESS: &str = "ip_address";
pub const EMAIL: &str = "email";
pub const REVIEWER_NAME: &str = "reviewer_name";
pub const REVIEWER_COUNTRY: &str = "reviewer_country";
pub const BUSINESS_NAME: &str = "business_name";

/// Columns without which a file cannot be loaded at all.
pub const REQUIRED_FIELDS: [&str; 5] = [REVIEW_ID, REVIEWER_ID, BUSINESS_ID, RATING, REVIEW_DATE];

/// Resolved position of each canonical field in one file's header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    columns: HashMap<&'static str, String>,
}

impl HeaderMap {
    pub fn header_for(&self, field: &str) -> Option<&str> {
        self.columns.get(field).map(String::as_str)
    }

    fn value<'a>(&self, raw: &'a RawRecord, field: &str) -> Option<&'a str> {
        self.header_for(field).and_then(|header| raw.get(header))
    }
}

/// Maps the export's display-case headers onto canonical fields and types each row.
pub struct SchemaNormalizer {
    field_mappings: HashMap<String, &'static str>,
    date_parser: DateParser,
}

impl SchemaNormalizer {
    pub fn new(date_policy: DatePolicy) -> Self {
        let mut field_mappings = HashMap::new();

        // Export layout
        field_mappings.insert("Review Id".to_string(), REVIEW_ID);
        field_mappings.insert("Reviewer Id".to_string(), REVIEWER_ID);
        field_mappings.insert("Business Id".to_string(), BUSINESS_ID);
        field_mappings.insert("Review Rating".to_string(), RATING);
        field_mappings.insert("Review Date".to_string(), REVIEW_DATE);
        field_mappings.insert("Review Title".to_string(), TITLE);
        field_mappings.insert("Review Content".to_string(), CONTENT);
        field_mappings.insert("Review IP Address".to_string(), IP_ADDRESS);
        field_mappings.insert("Email Address".to_string(), EMAIL);
        field_mappings.insert("Reviewer Name".to_string(), REVIEWER_NAME);
        field_mappings.insert("Reviewer Country".to_string(), REVIEWER_COUNTRY);
        field_mappings.insert("Business Name".to_string(), BUSINESS_NAME);

        // Canonical names, so staged CSVs can be fed back in
        for field in [
            REVIEW_ID,
            REVIEWER_ID,
            BUSINESS_ID,
            RATING,
            REVIEW_DATE,
            TITLE,
            CONTENT,
            IP_ADDRESS,
            EMAIL,
            REVIEWER_NAME,
            REVIEWER_COUNTRY,
            BUSINESS_NAME,
        ] {
            field_mappings.insert(field.to_string(), field);
        }

        let field_mappings = field_mappings
            .into_iter()
            .map(|(name, canonical)| (normalize_field_name(&name), canonical))
            .collect();

        SchemaNormalizer {
            field_mappings,
            date_parser: DateParser::new(date_policy),
        }
    }

    /// Resolve a header row. Unknown columns are ignored; missing required
    /// columns fail the whole file.
    pub fn map_headers(&self, headers: &[String]) -> Result<HeaderMap, StructuralError> {
        let mut map = HeaderMap::default();
        for header in headers {
            if let Some(&canonical) = self.field_mappings.get(&normalize_field_name(header)) {
                // First matching column wins.
                map.columns.entry(canonical).or_insert_with(|| header.clone());
            } else if !header.trim().is_empty() {
                debug!("Ignoring unmapped column: {}", header);
            }
        }

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| map.header_for(field).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(StructuralError::new(
                "header",
                format!("missing required columns: {}", missing.join(", ")),
            ));
        }

        Ok(map)
    }

    /// Type one raw row. Only structural problems fail here; business rules are
    /// left to the DQ validator.
    pub fn normalize(
        &self,
        headers: &HeaderMap,
        raw: &RawRecord,
        source_file: &str,
    ) -> Result<ReviewCandidate, StructuralError> {
        if let Some(cause) = &raw.encoding_error {
            return Err(StructuralError::new("encoding", cause.clone()));
        }

        let rating = coerce_rating(headers.value(raw, RATING).unwrap_or(""))?;
        let reviewed_at = self
            .date_parser
            .parse(headers.value(raw, REVIEW_DATE).unwrap_or(""))?;

        Ok(ReviewCandidate {
            review_id: clean_identifier(headers.value(raw, REVIEW_ID)),
            business_id: clean_identifier(headers.value(raw, BUSINESS_ID)),
            reviewer_id: clean_identifier(headers.value(raw, REVIEWER_ID)),
            rating,
            reviewed_at,
            title: clean_text(headers.value(raw, TITLE)),
            content: clean_text(headers.value(raw, CONTENT)),
            ip_address: clean_text(headers.value(raw, IP_ADDRESS)),
            email: clean_text(headers.value(raw, EMAIL)).map(|e| e.to_lowercase()),
            reviewer_name: clean_name(headers.value(raw, REVIEWER_NAME)),
            reviewer_country: clean_text(headers.value(raw, REVIEWER_COUNTRY)).map(|c| c.to_uppercase()),
            business_name: clean_name(headers.value(raw, BUSINESS_NAME)),
            lineage: Lineage {
                source_file: source_file.to_string(),
                source_row: raw.source_row,
            },
        })
    }
}

impl Default for SchemaNormalizer {
    fn default() -> Self {
        Self::new(DatePolicy::default())
    }
}

fn normalize_field_name(name: &str) -> String {
    name.to_lowercase()
        .replace("_", "")
        .replace("-", "")
        .replace(" ", "")
}

fn clean_identifier(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or("").to_string()
}

fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn clean_name(value: Option<&str>) -> Option<String> {
    clean_text(value).map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn coerce_rating(value: &str) -> Result<f64, StructuralError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StructuralError::new(RATING, "missing value"));
    }
    match trimmed.parse::<f64>() {
        Ok(rating) if rating.is_finite() => Ok(rating),
        _ => Err(StructuralError::new(
            RATING,
            format!("not a number: {:?}", trimmed),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn export_headers() -> Vec<String> {
        [
            "Review Id",
            "Reviewer Id",
            "Business Id",
            "Review Rating",
            "Review Date",
            "Review Title",
            "Review Content",
            "Email Address",
            "Review IP Address",
            "Reviewer Name",
            "Reviewer Country",
            "Business Name",
        ]
        .iter()
        .map(|h| h.to_string())
        .collect()
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        let mut record = RawRecord::new(2);
        for (k, v) in pairs {
            record.values.insert(k.to_string(), v.to_string());
        }
        record
    }

    #[test]
    fn test_header_mapping_ignores_case_and_separators() {
        let normalizer = SchemaNormalizer::default();
        let headers: Vec<String> = ["REVIEW_ID", "reviewer-id", "business id", "Review Rating", "review date", "Notes"]
            .iter()
            .map(|h| h.to_string())
            .collect();

        let map = normalizer.map_headers(&headers).unwrap();
        assert_eq!(map.header_for(REVIEW_ID), Some("REVIEW_ID"));
        assert_eq!(map.header_for(REVIEWER_ID), Some("reviewer-id"));
        assert_eq!(map.header_for(REVIEW_DATE), Some("review date"));
        assert_eq!(map.header_for(EMAIL), None);
    }

    #[test]
    fn test_missing_required_columns() {
        let normalizer = SchemaNormalizer::default();
        let headers = vec!["Review Id".to_string(), "Review Rating".to_string()];

        let err = normalizer.map_headers(&headers).unwrap_err();
        assert_eq!(err.field, "header");
        assert!(err.cause.contains("reviewer_id"));
        assert!(err.cause.contains("business_id"));
        assert!(err.cause.contains("review_date"));
    }

    #[test]
    fn test_normalize_trims_and_cases() {
        let normalizer = SchemaNormalizer::default();
        let map = normalizer.map_headers(&export_headers()).unwrap();
        let row = raw(&[
            ("Review Id", " r-1 "),
            ("Reviewer Id", "u-1"),
            ("Business Id", "b-1"),
            ("Review Rating", "5.0"),
            ("Review Date", "2024-01-01T12:00:00Z"),
            ("Review Title", "  Great  "),
            ("Review Content", ""),
            ("Email Address", " Alice@Example.COM "),
            ("Review IP Address", "1.2.3.4"),
            ("Reviewer Name", "  Alice   Smith "),
            ("Reviewer Country", "gb"),
            ("Business Name", "Widgets   Inc"),
        ]);

        let candidate = normalizer.normalize(&map, &row, "reviews.xlsx").unwrap();
        assert_eq!(candidate.review_id, "r-1");
        assert_eq!(candidate.rating, 5.0);
        assert_eq!(candidate.reviewed_at, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        assert_eq!(candidate.title.as_deref(), Some("Great"));
        assert_eq!(candidate.content, None);
        assert_eq!(candidate.email.as_deref(), Some("alice@example.com"));
        assert_eq!(candidate.reviewer_name.as_deref(), Some("Alice Smith"));
        assert_eq!(candidate.reviewer_country.as_deref(), Some("GB"));
        assert_eq!(candidate.business_name.as_deref(), Some("Widgets Inc"));
        assert_eq!(candidate.lineage.source_file, "reviews.xlsx");
        assert_eq!(candidate.lineage.source_row, 2);
    }

    #[test]
    fn test_out_of_range_rating_is_not_structural() {
        let normalizer = SchemaNormalizer::default();
        let map = normalizer.map_headers(&export_headers()).unwrap();
        let row = raw(&[
            ("Review Id", "r-1"),
            ("Reviewer Id", ""),
            ("Business Id", "b-1"),
            ("Review Rating", "6"),
            ("Review Date", "2024-01-01"),
        ]);

        let candidate = normalizer.normalize(&map, &row, "f.csv").unwrap();
        assert_eq!(candidate.rating, 6.0);
        assert_eq!(candidate.reviewer_id, "");
    }

    #[test]
    fn test_structural_failures() {
        let normalizer = SchemaNormalizer::default();
        let map = normalizer.map_headers(&export_headers()).unwrap();

        let bad_rating = raw(&[("Review Rating", "five"), ("Review Date", "2024-01-01")]);
        let err = normalizer.normalize(&map, &bad_rating, "f.csv").unwrap_err();
        assert_eq!(err.field, RATING);

        let missing_rating = raw(&[("Review Date", "2024-01-01")]);
        assert_eq!(normalizer.normalize(&map, &missing_rating, "f.csv").unwrap_err().field, RATING);

        let bad_date = raw(&[("Review Rating", "4"), ("Review Date", "yesterday")]);
        let err = normalizer.normalize(&map, &bad_date, "f.csv").unwrap_err();
        assert_eq!(err.field, REVIEW_DATE);

        let nan_rating = raw(&[("Review Rating", "NaN"), ("Review Date", "2024-01-01")]);
        assert!(normalizer.normalize(&map, &nan_rating, "f.csv").is_err());
    }
}
