// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration engine tests against a file-backed SQLite control store.

mod common;

use common::{DEAD_PID, Harness, local_holder, table_exists};
use opsplane_core::locks::MIGRATION_LOCK;
use opsplane_core::migrate::{
    ApplyOptions, FailurePolicy, FindingKind, MigrationError, RollbackSelector, SkipReason,
};
use opsplane_core::persistence::MigrationStatus;
use opsplane_core::{Classify, Environment, ErrorKind, LockError};

fn completed_names(records: &[opsplane_core::persistence::HistoryRecord]) -> Vec<String> {
    records.iter().map(|r| r.name.clone()).collect()
}

#[tokio::test]
async fn test_apply_rollback_reapply_round_trip() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    let engine = h.engine();

    let report = engine.apply(ApplyOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.applied.len(), 3);
    assert!(table_exists(&h.db_url, "invoices").await);

    let rollback = engine.rollback(RollbackSelector::Steps(1)).await.unwrap();
    assert_eq!(rollback.rolled_back, vec!["003_invoices"]);
    assert!(!table_exists(&h.db_url, "invoices").await);

    let history = h.store.history().await.unwrap();
    let invoices: Vec<_> = history.iter().filter(|r| r.name == "003_invoices").collect();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status(), Some(MigrationStatus::RolledBack));
    assert!(invoices[0].rolled_back_at.is_some());

    let pending = engine.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "003_invoices");

    let again = engine.apply(ApplyOptions::default()).await.unwrap();
    assert_eq!(again.applied.len(), 1);
    assert!(table_exists(&h.db_url, "invoices").await);

    let completed = h.store.completed_units().await.unwrap();
    assert_eq!(
        completed_names(&completed),
        vec!["001_accounts", "002_orders", "003_invoices"]
    );
    let history = h.store.history().await.unwrap();
    assert_eq!(history.len(), 4, "rolled back row is kept, never deleted");
    assert!(history.iter().all(|r| r.actor == "integration-test"));
    assert!(history.iter().all(|r| r.commit_ref.as_deref() == Some("abc1234")));
}

#[tokio::test]
async fn test_checksum_drift_reported_but_not_blocking() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    h.write(
        "002_orders.sql",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, account_id INTEGER, note TEXT);",
    );

    let report = engine.verify().await.unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].name, "002_orders");
    match &report.findings[0].kind {
        FindingKind::ChecksumMismatch { recorded, current } => assert_ne!(recorded, current),
        other => panic!("unexpected finding: {:?}", other),
    }

    h.write("004_refunds.sql", "CREATE TABLE refunds (id INTEGER PRIMARY KEY);");
    let apply = engine.apply(ApplyOptions::default()).await.unwrap();
    assert_eq!(apply.planned, vec!["004_refunds"]);
    assert!(apply.is_success());
}

#[tokio::test]
async fn test_verify_reports_missing_file() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    h.remove("001_accounts.sql");
    h.remove("001_accounts.down.sql");

    let report = engine.verify().await.unwrap();
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].kind, FindingKind::MissingFile);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_concurrent_apply_blocked_with_precondition() {
    let h = Harness::new().await;
    h.write_standard_catalog();

    // Process A (this process) holds the lock mid-batch.
    let process_a = h.registry_as(local_holder(i64::from(std::process::id())));
    let held = process_a.acquire_guard(MIGRATION_LOCK).await.unwrap();

    // Process B has its own pool and its own identity.
    let store_b = h.second_store().await;
    let registry_b = opsplane_core::LockRegistry::new(store_b.clone(), h.events.clone())
        .with_holder(local_holder(DEAD_PID - 1));
    let engine_b = opsplane_core::MigrationEngine::new(
        store_b,
        registry_b,
        h.events.clone(),
        h.config(),
    );

    let err = engine_b.apply(ApplyOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(err.kind().exit_code(), 2);
    match &err {
        MigrationError::Lock(LockError::HeldByOther { pid, .. }) => {
            assert_eq!(*pid, i64::from(std::process::id()));
        }
        other => panic!("unexpected error: {other}"),
    }
    let message = err.to_string();
    assert!(message.contains(&std::process::id().to_string()));

    assert!(h.store.history().await.unwrap().is_empty());

    held.release().await.unwrap();
    let report = h.engine().apply(ApplyOptions::default()).await.unwrap();
    assert_eq!(report.applied.len(), 3);
}

#[tokio::test]
async fn test_failed_unit_aborts_batch_and_retries_later() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    h.write("002_orders.sql", "CREATE TABLE orders (id INTEGER PRIMARY KEY; -- broken");
    let engine = h.engine();

    let report = engine.apply(ApplyOptions::default()).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.failed[0].name, "002_orders");
    assert_eq!(report.not_attempted, vec!["003_invoices"]);
    assert!(!table_exists(&h.db_url, "orders").await);
    assert!(!table_exists(&h.db_url, "invoices").await);

    // Lock is released even though the batch failed.
    assert!(h.registry().inspect(MIGRATION_LOCK).await.unwrap().is_none());

    let history = h.store.history().await.unwrap();
    let failed = history.iter().find(|r| r.name == "002_orders").unwrap();
    assert_eq!(failed.status(), Some(MigrationStatus::Failed));
    assert!(failed.error.is_some());

    h.write(
        "002_orders.sql",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, account_id INTEGER);",
    );
    let retry = engine.apply(ApplyOptions::default()).await.unwrap();
    assert!(retry.is_success());
    assert_eq!(retry.planned, vec!["002_orders", "003_invoices"]);
}

#[tokio::test]
async fn test_continue_policy_outside_production() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    h.write("002_orders.sql", "THIS IS NOT SQL;");

    let mut config = h.config();
    config.failure_policy = FailurePolicy::Continue;
    let report = h.engine_with(config.clone()).apply(ApplyOptions::default()).await.unwrap();
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.not_attempted.is_empty());

    // Production ignores the configured policy.
    let h = Harness::new().await;
    h.write_standard_catalog();
    h.write("002_orders.sql", "THIS IS NOT SQL;");
    config.environment = Environment::Production;
    config.directory = h.migrations.clone();
    let report = h.engine_with(config).apply(ApplyOptions::default()).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.not_attempted, vec!["003_invoices"]);
}

#[tokio::test]
async fn test_target_is_inclusive_upper_bound() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    let engine = h.engine();

    let report = engine
        .apply(ApplyOptions {
            target: Some("002_orders".into()),
            dry_run: false,
        })
        .await
        .unwrap();
    assert_eq!(report.planned, vec!["001_accounts", "002_orders"]);
    assert!(!table_exists(&h.db_url, "invoices").await);
}

#[tokio::test]
async fn test_unknown_target_is_precondition() {
    let h = Harness::new().await;
    h.write_standard_catalog();

    let err = h
        .engine()
        .apply(ApplyOptions {
            target: Some("009_nope".into()),
            dry_run: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::UnknownTarget(_)));
    assert_eq!(err.kind().exit_code(), 2);

    let err = h
        .engine()
        .rollback(RollbackSelector::Target("009_nope".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::UnknownTarget(_)));
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let h = Harness::new().await;
    h.write_standard_catalog();

    let report = h
        .engine()
        .apply(ApplyOptions {
            target: None,
            dry_run: true,
        })
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.planned.len(), 3);
    assert!(report.applied.is_empty());
    assert!(h.store.history().await.unwrap().is_empty());
    assert!(!table_exists(&h.db_url, "accounts").await);
}

#[tokio::test]
async fn test_rollback_skips_unit_without_down_script() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    h.remove("003_invoices.down.sql");
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    let report = engine.rollback(RollbackSelector::Steps(1)).await.unwrap();
    assert!(report.rolled_back.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].reason, SkipReason::NoDownScript);

    assert_eq!(h.store.completed_units().await.unwrap().len(), 3);
    assert!(table_exists(&h.db_url, "invoices").await);
}

#[tokio::test]
async fn test_rollback_steps_ignore_missing_files() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    h.remove("003_invoices.sql");
    h.remove("003_invoices.down.sql");

    let report = engine.rollback(RollbackSelector::Steps(1)).await.unwrap();
    assert_eq!(report.rolled_back, vec!["002_orders"]);
    assert_eq!(report.skipped[0].name, "003_invoices");
    assert_eq!(report.skipped[0].reason, SkipReason::MissingFile);

    let completed = h.store.completed_units().await.unwrap();
    assert_eq!(completed_names(&completed), vec!["001_accounts", "003_invoices"]);
}

#[tokio::test]
async fn test_rollback_to_target_reverses_in_order() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    let report = engine
        .rollback(RollbackSelector::Target("001_accounts".into()))
        .await
        .unwrap();
    assert_eq!(report.rolled_back, vec!["003_invoices", "002_orders"]);
    assert!(table_exists(&h.db_url, "accounts").await);
    assert!(!table_exists(&h.db_url, "orders").await);
}

#[tokio::test]
async fn test_rollback_failure_aborts_remainder() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    h.write("003_invoices.down.sql", "DROP TABLE no_such_table;");
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    let report = engine.rollback(RollbackSelector::Steps(2)).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed.as_ref().unwrap().name, "003_invoices");
    assert_eq!(report.not_attempted, vec!["002_orders"]);

    // Both rows are still completed and both tables still exist.
    assert_eq!(h.store.completed_units().await.unwrap().len(), 3);
    assert!(table_exists(&h.db_url, "orders").await);
}

#[tokio::test]
async fn test_status_summarises_history() {
    let h = Harness::new().await;
    h.write_standard_catalog();
    h.write("003_invoices.sql", "NOT SQL;");
    let engine = h.engine();
    engine.apply(ApplyOptions::default()).await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.counts.get("completed"), Some(&2));
    assert_eq!(status.counts.get("failed"), Some(&1));
    assert_eq!(status.pending, vec!["003_invoices"]);
    assert_eq!(status.recent[0].name, "003_invoices");
    assert!(status.lock.is_none());
}

#[tokio::test]
async fn test_inconsistent_catalog_blocks_apply() {
    let h = Harness::new().await;
    h.write("001_a.sql", "CREATE TABLE a (id INTEGER);");
    h.write("001_b.sql", "CREATE TABLE b (id INTEGER);");

    let err = h.engine().apply(ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(err, MigrationError::InconsistentCatalog(_)));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(h.store.history().await.unwrap().is_empty());
}
