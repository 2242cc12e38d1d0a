// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for opsplane-core integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use opsplane_core::locks::{Holder, LockRegistry, local_hostname};
use opsplane_core::migrate::{MigrationConfig, MigrationEngine};
use opsplane_core::{ControlStore, EventBus, connect};

/// A pid that cannot exist on Linux (`pid_max` tops out at 2^22).
pub const DEAD_PID: i64 = (i32::MAX - 1) as i64;

/// A file-backed SQLite control store plus a migration directory, both in a
/// temp dir that lives as long as the harness.
pub struct Harness {
    pub store: Arc<dyn ControlStore>,
    pub events: EventBus,
    pub migrations: PathBuf,
    pub db_url: String,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrations = dir.path().join("migrations");
        std::fs::create_dir_all(&migrations).expect("create migrations dir");
        let db_url = format!("sqlite:{}", dir.path().join("control.db").display());
        let store = connect(&db_url).await.expect("connect sqlite store");

        Self {
            store,
            events: EventBus::new(256),
            migrations,
            db_url,
            _dir: dir,
        }
    }

    /// Open a second, independent connection pool to the same database, as
    /// another process would.
    pub async fn second_store(&self) -> Arc<dyn ControlStore> {
        connect(&self.db_url).await.expect("connect second store")
    }

    pub fn write(&self, file: &str, body: &str) {
        std::fs::write(self.migrations.join(file), body).expect("write migration");
    }

    pub fn remove(&self, file: &str) {
        std::fs::remove_file(self.migrations.join(file)).expect("remove migration");
    }

    /// Registry acting as the current process.
    pub fn registry(&self) -> LockRegistry {
        LockRegistry::new(self.store.clone(), self.events.clone())
    }

    /// Registry acting as `holder`.
    pub fn registry_as(&self, holder: Holder) -> LockRegistry {
        LockRegistry::new(self.store.clone(), self.events.clone()).with_holder(holder)
    }

    pub fn config(&self) -> MigrationConfig {
        let mut config = MigrationConfig::new(&self.migrations);
        config.actor = "integration-test".to_string();
        config.commit_ref = Some("abc1234".to_string());
        config
    }

    pub fn engine(&self) -> MigrationEngine {
        self.engine_with(self.config())
    }

    pub fn engine_with(&self, config: MigrationConfig) -> MigrationEngine {
        MigrationEngine::new(
            self.store.clone(),
            self.registry(),
            self.events.clone(),
            config,
        )
    }

    /// The standard three-unit catalog with down scripts.
    pub fn write_standard_catalog(&self) {
        self.write("001_accounts.sql", "CREATE TABLE accounts (id INTEGER PRIMARY KEY);");
        self.write("001_accounts.down.sql", "DROP TABLE accounts;");
        self.write(
            "002_orders.sql",
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, account_id INTEGER);",
        );
        self.write("002_orders.down.sql", "DROP TABLE orders;");
        self.write("003_invoices.sql", "CREATE TABLE invoices (id INTEGER PRIMARY KEY);");
        self.write("003_invoices.down.sql", "DROP TABLE invoices;");
    }
}

/// Holder on this host with the given pid.
pub fn local_holder(pid: i64) -> Holder {
    Holder::new(local_hostname(), pid)
}

/// Whether `table` exists in the SQLite database at `db_url`.
pub async fn table_exists(db_url: &str, table: &str) -> bool {
    let pool = sqlx::SqlitePool::connect(db_url).await.expect("connect");
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&pool)
            .await
            .expect("query sqlite_master");
    pool.close().await;
    row.is_some()
}
