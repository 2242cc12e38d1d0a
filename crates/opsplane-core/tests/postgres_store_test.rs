// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL control store tests.
//!
//! Run with `TEST_OPSPLANE_DATABASE_URL=postgres://... cargo test`.

use chrono::Utc;
use opsplane_core::persistence::{
    ControlStore, LockRecord, MigrationStatus, PostgresStore, RevertOutcome, UnitAttempt,
};
use uuid::Uuid;

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_OPSPLANE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_OPSPLANE_DATABASE_URL not set");
            return;
        }
    };
}

async fn store() -> PostgresStore {
    let url = std::env::var("TEST_OPSPLANE_DATABASE_URL").expect("checked by skip_if_no_db");
    PostgresStore::connect(&url)
        .await
        .expect("Failed to connect to test database")
}

#[tokio::test]
async fn test_lock_exclusive_insert() {
    skip_if_no_db!();
    let store = store().await;
    let name = format!("test_lock_{}", Uuid::new_v4().simple());
    let now = Utc::now();
    let record = LockRecord {
        name: name.clone(),
        holder: "pg-test".into(),
        pid: 1,
        token: Uuid::new_v4().to_string(),
        acquired_at: now,
        heartbeat_at: now,
    };

    assert!(store.insert_lock(&record).await.unwrap());
    let mut rival = record.clone();
    rival.token = Uuid::new_v4().to_string();
    assert!(!store.insert_lock(&rival).await.unwrap());

    assert!(store.delete_lock(&name, &record.token).await.unwrap());
    assert!(store.get_lock(&name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_unit_rolls_back_to_savepoint() {
    skip_if_no_db!();
    let store = store().await;
    let suffix = Uuid::new_v4().simple().to_string();
    let table = format!("pg_half_{suffix}");
    let name = format!("001_pg_{suffix}");
    let script = format!("CREATE TABLE {table} (id INT); SELECT * FROM missing_{suffix};");

    let record = store
        .apply_unit(&UnitAttempt {
            name: &name,
            checksum: "x",
            script: &script,
            actor: "pg-test",
            environment: "development",
            commit_ref: None,
        })
        .await
        .unwrap();
    assert_eq!(record.status(), Some(MigrationStatus::Failed));

    let exists: Option<(String,)> =
        sqlx::query_as("SELECT table_name::text FROM information_schema.tables WHERE table_name = $1")
            .bind(&table)
            .fetch_optional(store.pool())
            .await
            .unwrap();
    assert!(exists.is_none());
}

#[tokio::test]
async fn test_apply_and_revert_unit() {
    skip_if_no_db!();
    let store = store().await;
    let suffix = Uuid::new_v4().simple().to_string();
    let table = format!("pg_unit_{suffix}");
    let name = format!("001_pg_{suffix}");
    let up = format!("CREATE TABLE {table} (id INT);");
    let down = format!("DROP TABLE {table};");

    let record = store
        .apply_unit(&UnitAttempt {
            name: &name,
            checksum: "x",
            script: &up,
            actor: "pg-test",
            environment: "development",
            commit_ref: Some("abc"),
        })
        .await
        .unwrap();
    assert!(record.is_completed());

    match store.revert_unit(record.id, &down).await.unwrap() {
        RevertOutcome::Reverted(reverted) => {
            assert_eq!(reverted.status(), Some(MigrationStatus::RolledBack));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}
