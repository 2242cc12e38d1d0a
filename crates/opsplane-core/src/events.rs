// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed operational events.
//!
//! Components publish [`OpsEvent`]s on an [`EventBus`]; subscribers (the
//! structured-log sink, tests, the control socket) consume them
//! independently. Publishing never blocks and never fails: with no
//! subscribers the event is simply dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default channel capacity for [`EventBus::default`].
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Operational event emitted by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OpsEvent {
    LockAcquired {
        name: String,
        holder: String,
        pid: i64,
    },
    LockReleased {
        name: String,
    },
    LockEvicted {
        name: String,
        evicted_holder: String,
        evicted_pid: i64,
        evicted_by: String,
        evicted_by_pid: i64,
        reason: String,
    },
    MigrationStarted {
        name: String,
    },
    MigrationCompleted {
        name: String,
        duration_ms: i64,
    },
    MigrationFailed {
        name: String,
        error: String,
    },
    MigrationRolledBack {
        name: String,
    },
    MigrationRollbackFailed {
        name: String,
        error: String,
    },
    WorkerSpawned {
        worker_id: String,
        index: u32,
        pid: Option<u32>,
    },
    WorkerOnline {
        worker_id: String,
        index: u32,
    },
    WorkerUnresponsive {
        worker_id: String,
        index: u32,
    },
    WorkerExited {
        worker_id: String,
        index: u32,
        code: Option<i32>,
        signal: Option<i32>,
        state: String,
    },
    WorkerRestartScheduled {
        index: u32,
        delay_ms: u64,
    },
    WorkerStartupFailed {
        index: u32,
        attempts: u32,
    },
    ScaledUp {
        live: usize,
    },
    ScaledDown {
        live: usize,
        worker_id: String,
    },
    ReloadStarted {
        replacing: usize,
    },
    ReloadCompleted {
        replaced: usize,
    },
    RecoveryStarted {
        run_id: String,
        scenario: String,
    },
    RecoveryStepCompleted {
        run_id: String,
        step: String,
        duration_ms: i64,
    },
    RecoveryStepFailed {
        run_id: String,
        step: String,
        error: String,
    },
    RecoveryCompleted {
        run_id: String,
        scenario: String,
    },
    RecoveryFailed {
        run_id: String,
        scenario: String,
        error: String,
    },
    ShutdownStarted,
    ShutdownCompleted {
        workers: usize,
        forced: usize,
    },
}

impl OpsEvent {
    /// The snake_case event name.
    pub fn name(&self) -> &'static str {
        match self {
            OpsEvent::LockAcquired { .. } => "lock_acquired",
            OpsEvent::LockReleased { .. } => "lock_released",
            OpsEvent::LockEvicted { .. } => "lock_evicted",
            OpsEvent::MigrationStarted { .. } => "migration_started",
            OpsEvent::MigrationCompleted { .. } => "migration_completed",
            OpsEvent::MigrationFailed { .. } => "migration_failed",
            OpsEvent::MigrationRolledBack { .. } => "migration_rolled_back",
            OpsEvent::MigrationRollbackFailed { .. } => "migration_rollback_failed",
            OpsEvent::WorkerSpawned { .. } => "worker_spawned",
            OpsEvent::WorkerOnline { .. } => "worker_online",
            OpsEvent::WorkerUnresponsive { .. } => "worker_unresponsive",
            OpsEvent::WorkerExited { .. } => "worker_exited",
            OpsEvent::WorkerRestartScheduled { .. } => "worker_restart_scheduled",
            OpsEvent::WorkerStartupFailed { .. } => "worker_startup_failed",
            OpsEvent::ScaledUp { .. } => "scaled_up",
            OpsEvent::ScaledDown { .. } => "scaled_down",
            OpsEvent::ReloadStarted { .. } => "reload_started",
            OpsEvent::ReloadCompleted { .. } => "reload_completed",
            OpsEvent::RecoveryStarted { .. } => "recovery_started",
            OpsEvent::RecoveryStepCompleted { .. } => "recovery_step_completed",
            OpsEvent::RecoveryStepFailed { .. } => "recovery_step_failed",
            OpsEvent::RecoveryCompleted { .. } => "recovery_completed",
            OpsEvent::RecoveryFailed { .. } => "recovery_failed",
            OpsEvent::ShutdownStarted => "shutdown_started",
            OpsEvent::ShutdownCompleted { .. } => "shutdown_completed",
        }
    }
}

/// An event together with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OpsEvent,
}

/// Fan-out channel for [`OpsEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: OpsEvent) {
        let _ = self.tx.send(EventEnvelope {
            at: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Spawn a task that writes every event to the tracing log as a
    /// structured record. The task ends when the last bus handle is dropped.
    pub fn spawn_logger(&self) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        let payload = serde_json::to_string(&envelope.event)
                            .unwrap_or_else(|_| "{}".to_string());
                        info!(
                            target: "opsplane::events",
                            event = envelope.event.name(),
                            at = %envelope.at.to_rfc3339(),
                            payload = %payload,
                            "Operational event"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger lagged behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
