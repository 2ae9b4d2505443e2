//! End-to-end tests over the service layer
//!
//! Concurrency tests use a file-backed database in a temporary directory so
//! every thread gets its own SQLite connection.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use impact_ledger::db::measurements::RecordMeasurementInput;
use impact_ledger::{
    Category, Config, IssueOutcome, LedgerDb, QuotaStatus, Services, TokenStatus,
};
use rust_decimal::Decimal;
use tempfile::TempDir;

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn memory_services() -> Services {
    let db = Arc::new(LedgerDb::open_in_memory().unwrap());
    Services::new(db, &Config::default()).unwrap()
}

fn file_services(dir: &TempDir) -> Arc<Services> {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    let db = Arc::new(LedgerDb::open(dir.path(), Duration::from_secs(10)).unwrap());
    Arc::new(Services::new(db, &config).unwrap())
}

fn record(services: &Services, category: Category, value: &str, at: &str) -> String {
    let outcome = services
        .intake
        .record(RecordMeasurementInput {
            id: None,
            category,
            raw_value: value.to_string(),
            recorded_at: Some(at.to_string()),
            source_kind: "delivery".to_string(),
            source_ref: None,
            subject_id: None,
            note: None,
        })
        .unwrap();
    match outcome {
        impact_ledger::db::measurements::RecordOutcome::Inserted(m) => m.id,
        other => panic!("expected insert, got {:?}", other),
    }
}

/// Mint exactly `residue / education / product` tokens through accrual
fn mint_stock(services: &Services, residue: u32, education: u32, product: u32) {
    for (category, n) in [
        (Category::Residue, residue),
        (Category::Education, education),
        (Category::Product, product),
    ] {
        if n > 0 {
            record(services, category, &n.to_string(), "2026-01-01T00:00:00Z");
        }
    }
    let report = services.accrual.run();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.tokens_created, (residue + education + product) as u64);
}

fn available(services: &Services, category: Category) -> u64 {
    services.stock.query(category, TokenStatus::Available).unwrap()
}

#[test]
fn scenario_a_carries_fraction_across_runs() {
    let services = memory_services();

    // Leave 0.4 kg in the residue balance
    let seed = record(&services, Category::Residue, "0.4", "2026-02-01T08:00:00Z");
    let first = services.accrual.run_category(Category::Residue).unwrap();
    assert_eq!(first.tokens_created, 0);
    assert_eq!(first.new_remainder, d("0.4"));

    let a = record(&services, Category::Residue, "0.3", "2026-02-02T08:00:00Z");
    let b = record(&services, Category::Residue, "0.5", "2026-02-02T09:00:00Z");
    let c = record(&services, Category::Residue, "0.2", "2026-02-02T10:00:00Z");

    let unit = services.accrual.run_category(Category::Residue).unwrap();
    assert_eq!(unit.previous_remainder, d("0.4"));
    assert_eq!(unit.amount, d("1.0"));
    assert_eq!(unit.tokens_created, 1);
    assert_eq!(unit.new_remainder, d("0.4"));
    assert_eq!(unit.measurements_consumed, 3);

    let tokens = services.stock.tokens(Category::Residue, None, 10).unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].sequence_number, 1);
    assert_eq!(tokens[0].origin_ids, vec![seed, a, b]);

    let consumed = services.intake.consumed_by_run(&unit.run_id).unwrap();
    assert_eq!(consumed.len(), 3);
    assert!(consumed.iter().any(|m| m.id == c));
}

#[test]
fn scenario_b_short_stock_leaves_state_untouched() {
    let services = memory_services();
    mint_stock(&services, 249, 5, 1);
    let quota = services.issuer.register_quota("reforest-01", Some("investor-1")).unwrap();

    match services.issuer.issue(&quota.id).unwrap() {
        IssueOutcome::InsufficientStock(short) => {
            assert_eq!(short.category, Category::Residue);
            assert_eq!(short.required, 250);
            assert_eq!(short.available, 249);
        }
        other => panic!("expected InsufficientStock, got {:?}", other),
    }

    assert_eq!(available(&services, Category::Residue), 249);
    assert_eq!(available(&services, Category::Education), 5);
    assert_eq!(available(&services, Category::Product), 1);
    assert_eq!(services.stock.query(Category::Residue, TokenStatus::Reserved).unwrap(), 0);
    assert_eq!(services.stock.stats().unwrap().certificate_count, 0);

    let quota = services.issuer.get_quota(&quota.id).unwrap().unwrap();
    assert_eq!(quota.status, QuotaStatus::AwaitingCertificate);

    // One more residue token and the same quota goes through
    mint_stock(&services, 1, 0, 0);
    assert!(matches!(services.issuer.issue(&quota.id).unwrap(), IssueOutcome::Issued(_)));
}

#[test]
fn scenario_c_concurrent_issue_for_one_bundle() {
    let dir = TempDir::new().unwrap();
    let services = file_services(&dir);
    mint_stock(&services, 250, 5, 1);

    let quotas: Vec<String> = (0..2)
        .map(|i| services.issuer.register_quota(&format!("p{}", i), None).unwrap().id)
        .collect();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = quotas
        .iter()
        .cloned()
        .map(|quota_id| {
            let services = services.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                services.issuer.issue(&quota_id).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<IssueOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let issued = outcomes.iter().filter(|o| matches!(o, IssueOutcome::Issued(_))).count();
    let short = outcomes
        .iter()
        .filter(|o| matches!(o, IssueOutcome::InsufficientStock(_)))
        .count();
    assert_eq!(issued, 1);
    assert_eq!(short, 1);

    let consumed: u64 = Category::ALL
        .iter()
        .map(|c| services.stock.query(*c, TokenStatus::Consumed).unwrap())
        .sum();
    assert_eq!(consumed, 256);
    for category in Category::ALL {
        assert_eq!(services.stock.query(category, TokenStatus::Reserved).unwrap(), 0);
    }

    let fulfilled = services.issuer.list_quotas(Some(QuotaStatus::Fulfilled)).unwrap();
    assert_eq!(fulfilled.len(), 1);
}

#[test]
fn certificate_matches_bundle_and_verifies() {
    let services = memory_services();
    mint_stock(&services, 260, 6, 2);
    let quota = services.issuer.register_quota("mangrove-02", None).unwrap();

    let certificate = match services.issuer.issue(&quota.id).unwrap() {
        IssueOutcome::Issued(c) => c,
        other => panic!("expected certificate, got {:?}", other),
    };

    assert_eq!(certificate.total_tokens, 256);
    assert_eq!(certificate.tokens_by_category[&Category::Residue].len(), 250);
    assert_eq!(certificate.tokens_by_category[&Category::Education].len(), 5);
    assert_eq!(certificate.tokens_by_category[&Category::Product].len(), 1);
    assert!(certificate.number.starts_with("CDV-"));
    assert!(certificate.number.ends_with("-000001"));
    assert_eq!(certificate.validation_hash.len(), 32);

    // FIFO: the oldest residue tokens went first
    let left = services
        .stock
        .tokens(Category::Residue, Some(TokenStatus::Available), 100)
        .unwrap();
    assert_eq!(left.len(), 10);
    assert_eq!(left[0].sequence_number, 251);

    let verified = services.issuer.verify(&certificate.validation_hash).unwrap().unwrap();
    assert_eq!(verified.id, certificate.id);
    assert_eq!(
        services.issuer.certificate_for_quota(&quota.id).unwrap().unwrap().id,
        certificate.id
    );

    let token = services
        .stock
        .token(&certificate.tokens_by_category[&Category::Product][0])
        .unwrap()
        .unwrap();
    assert_eq!(token.status, TokenStatus::Consumed);
    assert_eq!(token.certificate_id.as_deref(), Some(certificate.id.as_str()));
    assert_eq!(token.project_id.as_deref(), Some("mangrove-02"));

    assert!(matches!(
        services.issuer.issue(&quota.id).unwrap(),
        IssueOutcome::AlreadyFulfilled { .. }
    ));
}

#[test]
fn repeated_runs_are_idempotent() {
    let services = memory_services();
    record(&services, Category::Education, "2.75", "2026-03-01T10:00:00Z");

    let first = services.accrual.run();
    assert_eq!(first.tokens_created, 2);

    let stats_before = services.stock.stats().unwrap();
    let second = services.accrual.run();
    assert_eq!(second.tokens_created, 0);
    assert_eq!(second.measurements_consumed, 0);

    let stats_after = services.stock.stats().unwrap();
    assert_eq!(stats_before.token_count, stats_after.token_count);

    let report = services.stock.stock_report().unwrap();
    let education = report
        .categories
        .iter()
        .find(|c| c.category == Category::Education)
        .unwrap();
    assert_eq!(education.remainder, d("0.75"));
}

#[test]
fn concurrent_accrual_never_double_claims() {
    let dir = TempDir::new().unwrap();
    let services = file_services(&dir);

    for i in 0..40 {
        let category = Category::ALL[i % 3];
        record(&services, category, "1.25", &format!("2026-04-01T00:00:{:02}Z", i));
    }
    // 14 residue (17.5 kg -> 17), 13 education (16.25 -> 16), 13 product (-> 16)
    let expected = 17 + 16 + 16;

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let services = services.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                services.accrual.run()
            })
        })
        .collect();

    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let consumed: usize = reports.iter().map(|r| r.measurements_consumed).sum();
    let created: u64 = reports.iter().map(|r| r.tokens_created).sum();
    assert_eq!(consumed, 40);
    assert_eq!(created, expected);
    assert!(reports.iter().all(|r| r.errors.is_empty()));

    assert_no_double_counting(&services);
}

#[test]
fn origin_ids_never_repeat_across_runs() {
    let services = memory_services();
    let values = ["0.7", "2.6", "0.1", "0.3", "1.0", "0.45", "0.85"];
    for (i, v) in values.iter().enumerate() {
        record(&services, Category::Residue, v, &format!("2026-05-01T00:00:{:02}Z", i));
        services.accrual.run();
    }
    assert_no_double_counting(&services);

    // 6.0 kg in total: six tokens, nothing left over
    assert_eq!(available(&services, Category::Residue), 6);
    let report = services.stock.stock_report().unwrap();
    assert_eq!(report.categories[0].remainder, Decimal::ZERO);
}

fn assert_no_double_counting(services: &Services) {
    let mut seen = HashSet::new();
    for category in Category::ALL {
        for token in services.stock.tokens(category, None, 10_000).unwrap() {
            for id in token.origin_ids {
                assert!(seen.insert(id.clone()), "measurement {} in two tokens", id);
            }
        }
    }
}
