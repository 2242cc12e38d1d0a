// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the control plane's own bookkeeping tables.
//!
//! These are sqlx migrations for the lock registry, migration history and
//! recovery audit tables. They are unrelated to the operator's migration
//! units, which the [`crate::migrate`] engine applies and records.
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! opsplane_core::schema::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator for the control plane tables.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator for the control plane tables.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Apply the PostgreSQL schema. Safe to call repeatedly.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Apply the SQLite schema. Safe to call repeatedly.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
