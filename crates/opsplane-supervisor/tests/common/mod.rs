// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for opsplane-supervisor integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsplane_core::persistence::{
    EvictionRecord, HistoryRecord, LockRecord, RecoveryRunRecord, RecoveryStepRecord, RevertOutcome,
    UnitAttempt,
};
use opsplane_core::{ControlStore, EventBus, LockRegistry, StoreError, connect};
use opsplane_supervisor::launcher::MockLauncher;
use opsplane_supervisor::pool::{PoolConfig, PoolStatus, Supervisor, SupervisorHandle};
use opsplane_supervisor::recovery::{Alert, AlertKind, AlertSink};
use opsplane_supervisor::recovery::alerts::AlertError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Pool timings short enough for tests. Health checks are effectively off
/// unless a test lowers `health_interval`.
pub fn fast_pool(workers: usize) -> PoolConfig {
    PoolConfig {
        ports: vec![3000, 3001],
        workers,
        min_workers: 1,
        max_workers: 6,
        restart_delay: Duration::from_millis(20),
        health_interval: Duration::from_secs(60),
        graceful_timeout: Duration::from_millis(300),
        start_retry_limit: 3,
        stagger_interval: Duration::from_millis(10),
        warmup_interval: Duration::from_millis(50),
    }
}

pub struct Pool {
    pub handle: SupervisorHandle,
    pub launcher: MockLauncher,
    pub events: EventBus,
    pub task: JoinHandle<()>,
}

pub fn start_pool(config: PoolConfig, launcher: MockLauncher) -> Pool {
    let events = EventBus::new(1024);
    let (handle, task) = Supervisor::spawn(config, Arc::new(launcher.clone()), events.clone());
    Pool {
        handle,
        launcher,
        events,
        task,
    }
}

/// Poll `status()` until `predicate` holds or `timeout` passes.
pub async fn wait_for_status<F>(handle: &SupervisorHandle, timeout: Duration, predicate: F) -> PoolStatus
where
    F: Fn(&PoolStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = handle.status().await.expect("supervisor running");
        if predicate(&status) {
            return status;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}; last status: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an async condition until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("{what} not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A file-backed SQLite control store in a temp dir.
pub struct StoreHarness {
    pub store: Arc<dyn ControlStore>,
    pub events: EventBus,
    pub dir: tempfile::TempDir,
}

impl StoreHarness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_url = format!("sqlite:{}", dir.path().join("control.db").display());
        let store = connect(&db_url).await.expect("connect sqlite store");
        Self {
            store,
            events: EventBus::new(256),
            dir,
        }
    }

    pub fn registry(&self) -> LockRegistry {
        LockRegistry::new(self.store.clone(), self.events.clone())
    }
}

/// Alert sink that keeps every alert.
#[derive(Default)]
pub struct RecordingSink {
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub async fn kinds(&self) -> Vec<AlertKind> {
        self.alerts.lock().await.iter().map(|a| a.kind).collect()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

/// Alert sink whose every delivery fails.
pub struct FailingSink;

#[async_trait]
impl AlertSink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn send(&self, _alert: &Alert) -> Result<(), AlertError> {
        Err(AlertError::Status(500))
    }
}

/// Store wrapper that can be told to reject recovery step rows.
pub struct FlakyStore {
    inner: Arc<dyn ControlStore>,
    pub fail_step_inserts: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ControlStore>) -> Self {
        Self {
            inner,
            fail_step_inserts: AtomicBool::new(false),
        }
    }

    pub fn set_fail_step_inserts(&self, fail: bool) {
        self.fail_step_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn insert_lock(&self, lock: &LockRecord) -> Result<bool, StoreError> {
        self.inner.insert_lock(lock).await
    }

    async fn get_lock(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        self.inner.get_lock(name).await
    }

    async fn delete_lock(&self, name: &str, token: &str) -> Result<bool, StoreError> {
        self.inner.delete_lock(name, token).await
    }

    async fn touch_lock(&self, name: &str, token: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.touch_lock(name, token, at).await
    }

    async fn record_eviction(
        &self,
        evicted: &LockRecord,
        evicted_by: &str,
        evicted_by_pid: i64,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .record_eviction(evicted, evicted_by, evicted_by_pid, reason)
            .await
    }

    async fn list_evictions(&self, name: &str) -> Result<Vec<EvictionRecord>, StoreError> {
        self.inner.list_evictions(name).await
    }

    async fn apply_unit(&self, attempt: &UnitAttempt<'_>) -> Result<HistoryRecord, StoreError> {
        self.inner.apply_unit(attempt).await
    }

    async fn revert_unit(&self, id: i64, down_script: &str) -> Result<RevertOutcome, StoreError> {
        self.inner.revert_unit(id, down_script).await
    }

    async fn completed_units(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        self.inner.completed_units().await
    }

    async fn recent_attempts(&self, limit: i64) -> Result<Vec<HistoryRecord>, StoreError> {
        self.inner.recent_attempts(limit).await
    }

    async fn history(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        self.inner.history().await
    }

    async fn status_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.inner.status_counts().await
    }

    async fn insert_recovery_run(&self, run: &RecoveryRunRecord) -> Result<(), StoreError> {
        self.inner.insert_recovery_run(run).await
    }

    async fn update_recovery_run(&self, run: &RecoveryRunRecord) -> Result<(), StoreError> {
        self.inner.update_recovery_run(run).await
    }

    async fn insert_recovery_step(&self, step: &RecoveryStepRecord) -> Result<(), StoreError> {
        if self.fail_step_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidRecord("recovery_steps is read-only".into()));
        }
        self.inner.insert_recovery_step(step).await
    }

    async fn get_recovery_run(&self, run_id: &str) -> Result<Option<RecoveryRunRecord>, StoreError> {
        self.inner.get_recovery_run(run_id).await
    }

    async fn list_recovery_steps(&self, run_id: &str) -> Result<Vec<RecoveryStepRecord>, StoreError> {
        self.inner.list_recovery_steps(run_id).await
    }

    async fn abandon_running_recovery_runs(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.abandon_running_recovery_runs(at).await
    }
}
