mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use common::{Fixture, files_in, review_line};
use review_warehouse::PipelineError;
use review_warehouse::models::{RuleId, RunStatus};
use review_warehouse::processor::DedupePolicy;
use review_warehouse::storage::{QuarantineStore, RunLock, STAGE_COLUMNS, projections, read_stage};

#[test]
fn out_of_range_rating_is_quarantined_and_audited() {
    let fixture = Fixture::new();
    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "4", "2024-01-10"),
            review_line("R2", "U2", "B1", "6", "2024-01-11"),
            review_line("R3", "U3", "B1", "2", "2024-01-12"),
        ],
    );

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert_eq!(summary.runs.len(), 1);
    let run = &summary.runs[0];
    assert_eq!((run.rows_read, run.rows_accepted, run.rows_quarantined), (3, 2, 1));

    let warehouse = fixture.warehouse();
    let conn = warehouse.connection();
    assert!(projections::get_review(conn, "R1").unwrap().is_some());
    assert!(projections::get_review(conn, "R2").unwrap().is_none());
    assert!(projections::get_review(conn, "R3").unwrap().is_some());

    let quarantined = QuarantineStore::read(run.quarantine_path.as_ref().expect("no quarantine file")).unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].raw.source_row, 3);
    assert_eq!(quarantined[0].rules, vec![RuleId::RatingOutOfRange]);
    assert_eq!(quarantined[0].raw.get("Review Rating"), Some("6"));

    let audit = fixture.audit();
    assert_eq!(audit.len(), 1);
    assert_eq!((audit[0].rows_read, audit[0].rows_accepted, audit[0].rows_quarantined), (3, 2, 1));
    // One bad row in three is above the default 20% threshold.
    assert_eq!(audit[0].status, RunStatus::Degraded);
}

#[test]
fn unchanged_file_is_skipped_on_reingest() {
    let fixture = Fixture::new();
    let source = fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "4", "2024-01-10"),
            review_line("R2", "U2", "B2", "5", "2024-01-11"),
        ],
    );

    let first = fixture.pipeline().ingest().expect("first ingest failed");
    assert_eq!(first.count(RunStatus::Success), 1);
    let reviews_before = fixture.count("SELECT COUNT(*) FROM review");

    let second = fixture.pipeline().ingest().expect("second ingest failed");
    assert_eq!(second.count(RunStatus::Skipped), 1);
    assert!(!second.has_failures());
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review"), reviews_before);

    // A renamed byte-identical copy is recognised by content.
    fs::rename(&source, fixture.raw_path("renamed.csv")).unwrap();
    let third = fixture.pipeline().ingest().expect("third ingest failed");
    assert_eq!(third.count(RunStatus::Skipped), 1);

    let audit = fixture.audit();
    let statuses: Vec<RunStatus> = audit.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![RunStatus::Success, RunStatus::Skipped, RunStatus::Skipped]);
    assert!(audit[1].message.as_deref().unwrap().contains("duplicate fingerprint"));
    assert_eq!(audit.iter().filter(|a| a.status.is_loaded()).count(), 1);
}

#[test]
fn byte_identical_copies_in_one_invocation_load_once() {
    let fixture = Fixture::new();
    let lines = vec![review_line("R1", "U1", "B1", "3", "2024-02-01")];
    fixture.write_source("a.csv", &lines);
    fixture.write_source("b.csv", &lines);

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert_eq!(summary.count(RunStatus::Success), 1);
    assert_eq!(summary.count(RunStatus::Skipped), 1);
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review"), 1);
    // Only the loaded run keeps a stage artifact.
    assert_eq!(files_in(&fixture.config.paths.stage_dir).len(), 1);
}

#[test]
fn duplicate_review_id_keeps_first_occurrence() {
    let fixture = Fixture::new();
    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "4", "2024-01-10"),
            review_line("R1", "U1", "B1", "5", "2024-01-11"),
        ],
    );

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert_eq!(summary.runs[0].rows_quarantined, 1);

    let warehouse = fixture.warehouse();
    let review = projections::get_review(warehouse.connection(), "R1").unwrap().unwrap();
    assert_eq!(review.rating, 4);
    assert_eq!(review.source_row, 2);
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review WHERE review_id = 'R1'"), 1);

    let quarantined = QuarantineStore::read(summary.runs[0].quarantine_path.as_ref().unwrap()).unwrap();
    assert!(quarantined[0].has_rule(RuleId::DuplicateReviewId));
}

#[test]
fn duplicate_review_id_keeps_latest_when_configured() {
    let mut fixture = Fixture::new();
    fixture.config.dq.dedupe_policy = DedupePolicy::RetainLatest;
    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "4", "2024-01-10"),
            review_line("R1", "U1", "B1", "5", "2024-01-11"),
        ],
    );

    fixture.pipeline().ingest().expect("ingest failed");
    let warehouse = fixture.warehouse();
    let review = projections::get_review(warehouse.connection(), "R1").unwrap().unwrap();
    assert_eq!((review.rating, review.source_row), (5, 3));
}

#[test]
fn every_violated_rule_is_recorded() {
    let fixture = Fixture::new();
    let bad = "R9,U9,B9,6,2024-01-10,t,c,not-an-ip,not-an-email,n,gb,b".to_string();
    fixture.write_source(
        "reviews.csv",
        &[
            bad,
            "R8,U8,B8,abc,2024-01-10,t,c,,,,,".to_string(),
            review_line("R1", "U1", "B1", "5", "2024-01-10"),
        ],
    );

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    let run = &summary.runs[0];
    assert_eq!((run.rows_accepted, run.rows_quarantined), (1, 2));

    let quarantined = QuarantineStore::read(run.quarantine_path.as_ref().unwrap()).unwrap();
    let multi = quarantined.iter().find(|q| q.raw.get("Review Id") == Some("R9")).unwrap();
    for rule in [RuleId::RatingOutOfRange, RuleId::IpInvalid, RuleId::EmailInvalid] {
        assert!(multi.has_rule(rule), "missing {}", rule);
    }
    let structural = quarantined.iter().find(|q| q.raw.get("Review Id") == Some("R8")).unwrap();
    assert_eq!(structural.rules, vec![RuleId::Structural]);

    assert_eq!(fixture.count("SELECT COUNT(*) FROM review WHERE review_id IN ('R8', 'R9')"), 0);
}

#[test]
fn monthly_summary_matches_fact_table() {
    let fixture = Fixture::new();
    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "5", "2024-03-01"),
            review_line("R2", "U2", "B1", "4", "2024-03-15"),
            review_line("R3", "U3", "B1", "3", "2024-03-31T23:59:59Z"),
            review_line("R4", "U1", "B1", "1", "2024-04-01"),
        ],
    );
    fixture.pipeline().ingest().expect("ingest failed");

    let warehouse = fixture.warehouse();
    let metrics = projections::metrics_for_business(warehouse.connection(), "B1").unwrap();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].period_start, "2024-03-01T00:00:00Z");
    assert_eq!(metrics[0].total_reviews, 3);
    assert!((metrics[0].avg_rating - 4.0).abs() < 1e-9);
    assert_eq!(metrics[0].histogram, [0, 0, 1, 1, 1]);
    assert_eq!(metrics[1].period_start, "2024-04-01T00:00:00Z");
    assert_eq!(metrics[1].histogram, [1, 0, 0, 0, 0]);

    let business = projections::get_business(warehouse.connection(), "B1").unwrap().unwrap();
    assert_eq!(business.total_reviews, 4);
    assert_eq!(business.business_name.as_deref(), Some("Business B1"));
    let user = projections::get_user(warehouse.connection(), "U1").unwrap().unwrap();
    assert_eq!((user.total_reviews, user.country.as_deref()), (2, Some("GB")));
}

#[test]
fn changed_file_with_same_name_corrects_reviews() {
    let fixture = Fixture::new();
    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "2", "2024-01-10"),
            review_line("R2", "U2", "B1", "4", "2024-01-11"),
        ],
    );
    fixture.pipeline().ingest().expect("first ingest failed");

    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R2", "U2", "B1", "4", "2024-01-11"),
            review_line("R1", "U1", "B1", "5", "2024-01-10"),
        ],
    );
    let summary = fixture.pipeline().ingest().expect("second ingest failed");
    assert_eq!(summary.count(RunStatus::Success), 1);
    assert_eq!((summary.runs[0].inserted, summary.runs[0].replaced), (0, 1));

    let warehouse = fixture.warehouse();
    let conn = warehouse.connection();
    let corrected = projections::get_review(conn, "R1").unwrap().unwrap();
    assert_eq!((corrected.rating, corrected.source_row), (5, 3));
    // Identical content keeps its original lineage.
    assert_eq!(projections::get_review(conn, "R2").unwrap().unwrap().source_row, 3);

    let metrics = projections::metrics_for_business(conn, "B1").unwrap();
    assert!((metrics[0].avg_rating - 4.5).abs() < 1e-9);
}

#[test]
fn missing_required_column_fails_the_run() {
    let fixture = Fixture::new();
    fs::write(
        fixture.raw_path("broken.csv"),
        "Review Id,Business Id,Review Rating,Review Date\nR1,B1,4,2024-01-10\n",
    )
    .unwrap();
    fixture.write_source("good.csv", &[review_line("R1", "U1", "B1", "4", "2024-01-10")]);

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert!(summary.has_failures());
    assert_eq!(summary.count(RunStatus::Failed), 1);
    assert_eq!(summary.count(RunStatus::Success), 1);

    let failed = fixture.audit().into_iter().find(|a| a.status == RunStatus::Failed).unwrap();
    assert_eq!(failed.file_name, "broken.csv");
    assert!(failed.message.unwrap().contains("reviewer_id"));
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review"), 1);
}

#[test]
fn failed_file_is_retried_by_next_invocation() {
    let fixture = Fixture::new();
    fs::write(fixture.raw_path("reviews.csv"), "Review Id\nR1\n").unwrap();
    fixture.pipeline().ingest().expect("ingest failed");

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert_eq!(summary.count(RunStatus::Failed), 1);
    assert_eq!(fixture.audit().len(), 2);
}

#[test]
fn concurrent_invocation_is_refused() {
    let fixture = Fixture::new();
    fixture.write_source("reviews.csv", &[review_line("R1", "U1", "B1", "4", "2024-01-10")]);

    let _held = RunLock::acquire(fixture.config.paths.lock_path()).unwrap();
    let err = fixture.pipeline().ingest().unwrap_err();
    assert!(matches!(err, PipelineError::LockHeld(_)));
}

#[test]
fn abort_leaves_warehouse_untouched() {
    let fixture = Fixture::new();
    fixture.write_source("a.csv", &[review_line("R1", "U1", "B1", "4", "2024-01-10")]);
    fixture.write_source("b.csv", &[review_line("R2", "U2", "B2", "4", "2024-01-10")]);

    let pipeline = fixture.pipeline();
    pipeline.abort_handle().store(true, Ordering::SeqCst);
    let summary = pipeline.ingest().expect("ingest failed");

    assert!(summary.aborted);
    assert!(summary.has_failures());
    assert_eq!(summary.count(RunStatus::Aborted), 1);
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review"), 0);

    // The next invocation picks both files up again.
    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert_eq!(summary.count(RunStatus::Success), 2);
}

#[test]
fn deleting_a_business_cascades_without_dangling_rows() {
    let fixture = Fixture::new();
    fixture.write_source(
        "reviews.csv",
        &[
            review_line("R1", "U1", "B1", "4", "2024-01-10"),
            review_line("R2", "U1", "B2", "2", "2024-01-11"),
        ],
    );
    let pipeline = fixture.pipeline();
    pipeline.ingest().expect("ingest failed");

    let mut warehouse = fixture.warehouse();
    let upserter = review_warehouse::loader::WarehouseUpserter::new(pipeline.config().aggregation.period);
    let removed = warehouse.transaction(|tx| upserter.delete_business(tx, "B1")).unwrap();
    assert_eq!(removed, 1);

    let conn = warehouse.connection();
    let dangling: i64 = conn
        .query_row(
            r#"SELECT COUNT(*) FROM review r
               WHERE NOT EXISTS (SELECT 1 FROM business b WHERE b.business_id = r.business_id)
                  OR NOT EXISTS (SELECT 1 FROM "user" u WHERE u.user_id = r.user_id)"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(dangling, 0);
    assert_eq!(fixture.count("SELECT COUNT(*) FROM metrics_summary WHERE business_id = 'B1'"), 0);
    assert_eq!(projections::get_user(conn, "U1").unwrap().unwrap().total_reviews, 1);
}

#[test]
fn undecodable_row_is_quarantined_without_blocking_the_file() {
    let fixture = Fixture::new();
    let mut bytes = format!("{}\n{}\n", common::HEADER, review_line("R1", "U1", "B1", "4", "2024-01-10")).into_bytes();
    let mut bad = review_line("R2", "U2", "B1", "5", "2024-01-11").into_bytes();
    // Corrupt the review content column.
    let at = bad.windows(7).position(|w| w == b"Content").unwrap();
    bad.splice(at..at, [0xff, 0xfe]);
    bytes.extend_from_slice(&bad);
    bytes.push(b'\n');
    bytes.extend_from_slice(review_line("R3", "U3", "B1", "3", "2024-01-12").as_bytes());
    bytes.push(b'\n');
    fs::write(fixture.raw_path("reviews.csv"), bytes).unwrap();

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    let run = &summary.runs[0];
    assert_ne!(run.status, RunStatus::Failed);
    assert_eq!((run.rows_read, run.rows_accepted, run.rows_quarantined), (3, 2, 1));
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review"), 2);
    assert_eq!(fixture.count("SELECT COUNT(*) FROM review WHERE review_id = 'R2'"), 0);

    let quarantined = QuarantineStore::read(run.quarantine_path.as_ref().unwrap()).unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].raw.source_row, 3);
    assert_eq!(quarantined[0].rules, vec![RuleId::Structural]);
    assert!(quarantined[0].reason.contains("UTF-8"));
}

#[test]
fn correction_to_a_later_date_keeps_first_seen() {
    let fixture = Fixture::new();
    fixture.write_source("a.csv", &[review_line("R1", "U1", "B1", "4", "2024-01-10")]);
    fixture.pipeline().ingest().expect("first ingest failed");

    fixture.write_source("a.csv", &[review_line("R1", "U1", "B1", "4", "2024-03-10")]);
    let summary = fixture.pipeline().ingest().expect("second ingest failed");
    assert_eq!(summary.runs[0].replaced, 1);

    let warehouse = fixture.warehouse();
    let conn = warehouse.connection();
    let business = projections::get_business(conn, "B1").unwrap().unwrap();
    assert_eq!(business.first_review_at, "2024-01-10T00:00:00Z");
    assert_eq!(business.last_review_at, "2024-03-10T00:00:00Z");
    assert_eq!(business.total_reviews, 1);
    let user = projections::get_user(conn, "U1").unwrap().unwrap();
    assert_eq!(user.first_review_at, "2024-01-10T00:00:00Z");
}

#[test]
fn lock_left_by_a_dead_holder_does_not_block() {
    let fixture = Fixture::new();
    fixture.write_source("reviews.csv", &[review_line("R1", "U1", "B1", "4", "2024-01-10")]);

    let lock_path = fixture.config.paths.lock_path();
    fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    // What a killed holder leaves behind: the file, without the OS lock.
    fs::write(&lock_path, "999999\n").unwrap();

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    assert_eq!(summary.count(RunStatus::Success), 1);
    // Released with the pipeline, so the next invocation gets it too.
    assert!(fixture.pipeline().ingest().is_ok());
}

#[test]
fn workbook_rows_keep_sheet_row_numbers_and_dates() {
    let fixture = Fixture::new();
    let workbook = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/reviews.xlsx");
    fs::copy(&workbook, fixture.raw_path("reviews.xlsx")).unwrap();

    let summary = fixture.pipeline().ingest().expect("ingest failed");
    let run = &summary.runs[0];
    assert_eq!(run.status, RunStatus::Success);
    // Sheet row 3 is empty and is not counted.
    assert_eq!((run.rows_read, run.rows_accepted, run.rows_quarantined), (2, 2, 0));

    let staged = read_stage(run.stage_path.as_ref().expect("no stage artifact")).unwrap();
    let rows: Vec<(&str, i64, u8, String)> = staged
        .iter()
        .map(|r| {
            (
                r.review_id.as_str(),
                r.lineage.source_row,
                r.rating,
                r.reviewed_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            )
        })
        .collect();
    assert_eq!(
        rows,
        vec![
            ("R1", 2, 4, "2024-01-10T12:00:00Z".to_string()),
            ("R2", 4, 5, "2024-02-01T00:00:00Z".to_string()),
        ]
    );

    let warehouse = fixture.warehouse();
    let review = projections::get_review(warehouse.connection(), "R1").unwrap().unwrap();
    assert_eq!((review.source_file.as_str(), review.source_row), ("reviews.xlsx", 2));
    assert_eq!(review.reviewed_at, "2024-01-10T12:00:00Z");
}

#[test]
fn integrity_violation_rolls_back_the_whole_run() {
    let fixture = Fixture::new();
    let artifact = fixture.dir.path().join("tampered.csv");
    let mut body = STAGE_COLUMNS.join(",");
    body.push_str("\nR1,U1,B1,2024-01-10T00:00:00Z,4,,,,,,,,reviews.csv,2");
    // Parses as a rating but breaks the table constraint.
    body.push_str("\nR2,U2,B1,2024-01-11T00:00:00Z,9,,,,,,,,reviews.csv,3\n");
    fs::write(&artifact, body).unwrap();

    let report = fixture.pipeline().replay_stage(&artifact).expect("replay errored");
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.message.as_deref().unwrap().contains("integrity"));
    assert_eq!((report.inserted, report.replaced), (0, 0));

    for table in ["review", "business", "\"user\"", "metrics_summary"] {
        assert_eq!(fixture.count(&format!("SELECT COUNT(*) FROM {}", table)), 0, "{} not rolled back", table);
    }
    let audit = fixture.audit();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status, RunStatus::Failed);
}
