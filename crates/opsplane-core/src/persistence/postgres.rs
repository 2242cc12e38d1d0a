// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed control store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool};
use sqlx::postgres::PgPoolOptions;

use crate::error::StoreError;
use crate::schema;

use super::{
    ControlStore, EvictionRecord, HistoryRecord, LockRecord, MigrationStatus, RecoveryRunRecord,
    RecoveryStepRecord, RevertOutcome, UnitAttempt,
};

/// PostgreSQL-backed control store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. The schema must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and apply the control plane schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        schema::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ControlStore for PostgresStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_lock(&self, lock: &LockRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (name, holder, pid, token, acquired_at, heartbeat_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&lock.name)
        .bind(&lock.holder)
        .bind(lock.pid)
        .bind(&lock.token)
        .bind(lock.acquired_at)
        .bind(lock.heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        let record = sqlx::query_as::<_, LockRecord>(
            r#"
            SELECT name, holder, pid, token, acquired_at, heartbeat_at
            FROM resource_locks
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_lock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM resource_locks WHERE name = $1 AND token = $2")
            .bind(name)
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch_lock(
        &self,
        name: &str,
        token: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE resource_locks SET heartbeat_at = $1 WHERE name = $2 AND token = $3")
                .bind(at)
                .bind(name)
                .bind(token)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_eviction(
        &self,
        evicted: &LockRecord,
        evicted_by: &str,
        evicted_by_pid: i64,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO lock_evictions
                (name, evicted_holder, evicted_pid, evicted_token, evicted_by, evicted_by_pid, reason, evicted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&evicted.name)
        .bind(&evicted.holder)
        .bind(evicted.pid)
        .bind(&evicted.token)
        .bind(evicted_by)
        .bind(evicted_by_pid)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_evictions(&self, name: &str) -> Result<Vec<EvictionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, EvictionRecord>(
            r#"
            SELECT id, name, evicted_holder, evicted_pid, evicted_token,
                   evicted_by, evicted_by_pid, reason, evicted_at
            FROM lock_evictions
            WHERE name = $1
            ORDER BY id
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn apply_unit(&self, attempt: &UnitAttempt<'_>) -> Result<HistoryRecord, StoreError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut tx = self.pool.begin().await?;

        Executor::execute(&mut *tx, sqlx::raw_sql("SAVEPOINT migration_unit"))
            .await?;

        let (status, error) = match Executor::execute(&mut *tx, sqlx::raw_sql(attempt.script)).await {
            Ok(_) => {
                Executor::execute(&mut *tx, sqlx::raw_sql("RELEASE SAVEPOINT migration_unit"))
                    .await?;
                (MigrationStatus::Completed, None)
            }
            Err(e) => {
                Executor::execute(&mut *tx, sqlx::raw_sql("ROLLBACK TO SAVEPOINT migration_unit"))
                    .await?;
                Executor::execute(&mut *tx, sqlx::raw_sql("RELEASE SAVEPOINT migration_unit"))
                    .await?;
                (MigrationStatus::Failed, Some(e.to_string()))
            }
        };

        let record = sqlx::query_as::<_, HistoryRecord>(
            r#"
            INSERT INTO migration_history
                (name, checksum, started_at, finished_at, duration_ms, status,
                 actor, environment, commit_ref, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, name, checksum, started_at, finished_at, duration_ms, status,
                      actor, environment, commit_ref, error, rolled_back_at
            "#,
        )
        .bind(attempt.name)
        .bind(attempt.checksum)
        .bind(started_at)
        .bind(Utc::now())
        .bind(clock.elapsed().as_millis() as i64)
        .bind(status.as_str())
        .bind(attempt.actor)
        .bind(attempt.environment)
        .bind(attempt.commit_ref)
        .bind(error)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn revert_unit(&self, id: i64, down_script: &str) -> Result<RevertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Err(e) = Executor::execute(&mut *tx, sqlx::raw_sql(down_script)).await {
            tx.rollback().await?;
            return Ok(RevertOutcome::Failed(e.to_string()));
        }

        let record = sqlx::query_as::<_, HistoryRecord>(
            r#"
            UPDATE migration_history
            SET status = 'rolled_back', rolled_back_at = $1
            WHERE id = $2 AND status = 'completed'
            RETURNING id, name, checksum, started_at, finished_at, duration_ms, status,
                      actor, environment, commit_ref, error, rolled_back_at
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        match record {
            Some(record) => {
                tx.commit().await?;
                Ok(RevertOutcome::Reverted(record))
            }
            None => {
                tx.rollback().await?;
                Ok(RevertOutcome::NotCompleted)
            }
        }
    }

    async fn completed_units(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRecord>(
            r#"
            SELECT id, name, checksum, started_at, finished_at, duration_ms, status,
                   actor, environment, commit_ref, error, rolled_back_at
            FROM migration_history
            WHERE status = 'completed'
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn recent_attempts(&self, limit: i64) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRecord>(
            r#"
            SELECT id, name, checksum, started_at, finished_at, duration_ms, status,
                   actor, environment, commit_ref, error, rolled_back_at
            FROM migration_history
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn history(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRecord>(
            r#"
            SELECT id, name, checksum, started_at, finished_at, duration_ms, status,
                   actor, environment, commit_ref, error, rolled_back_at
            FROM migration_history
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn status_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM migration_history GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn insert_recovery_run(&self, run: &RecoveryRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recovery_runs
                (run_id, scenario_id, severity, actor, started_at, ended_at, current_step,
                 completed_steps, failed_steps, outcome, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.scenario_id)
        .bind(&run.severity)
        .bind(&run.actor)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.current_step)
        .bind(&run.completed_steps)
        .bind(&run.failed_steps)
        .bind(&run.outcome)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_recovery_run(&self, run: &RecoveryRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE recovery_runs
            SET ended_at = $1, current_step = $2, completed_steps = $3, failed_steps = $4,
                outcome = $5, error = $6
            WHERE run_id = $7
            "#,
        )
        .bind(run.ended_at)
        .bind(&run.current_step)
        .bind(&run.completed_steps)
        .bind(&run.failed_steps)
        .bind(&run.outcome)
        .bind(&run.error)
        .bind(&run.run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_recovery_step(&self, step: &RecoveryStepRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recovery_steps (run_id, step_name, started_at, duration_ms, outcome, error)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&step.run_id)
        .bind(&step.step_name)
        .bind(step.started_at)
        .bind(step.duration_ms)
        .bind(&step.outcome)
        .bind(&step.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_recovery_run(
        &self,
        run_id: &str,
    ) -> Result<Option<RecoveryRunRecord>, StoreError> {
        let record = sqlx::query_as::<_, RecoveryRunRecord>(
            r#"
            SELECT run_id, scenario_id, severity, actor, started_at, ended_at, current_step,
                   completed_steps, failed_steps, outcome, error
            FROM recovery_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_recovery_steps(
        &self,
        run_id: &str,
    ) -> Result<Vec<RecoveryStepRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RecoveryStepRecord>(
            r#"
            SELECT run_id, step_name, started_at, duration_ms, outcome, error
            FROM recovery_steps
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn abandon_running_recovery_runs(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE recovery_runs SET outcome = 'abandoned', ended_at = $1 WHERE outcome = 'running'",
        )
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
