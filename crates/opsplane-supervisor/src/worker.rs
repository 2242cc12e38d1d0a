// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker record and lifecycle state machine.
//!
//! ```text
//!   starting ──online / health──► online ──drain──► draining ──exit──► dead
//!       │                           │                                   ▲
//!       └──────────crash / exit─────┴──────────crash / exit─────────────┘
//! ```
//!
//! The pool actor is the only owner of [`Worker`] values; every transition
//! below runs on the actor task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opsplane_protocol::HealthReport;
use serde::Serialize;
use tokio::time::Instant;

use crate::launcher::WorkerControl;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Online,
    Draining,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Online => "online",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Dead => "dead",
        }
    }

    /// Starting and online workers count toward the pool size.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerStatus::Starting | WorkerStatus::Online)
    }
}

/// Rolling counters fed by worker IPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub requests: u64,
    pub errors: u64,
    pub cpu: f64,
    pub memory_pct: f64,
    pub response_time_ms: f64,
}

/// A supervised worker process.
pub struct Worker {
    pub id: String,
    pub index: u32,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub spawned_at: Instant,
    pub last_health_at: Instant,
    pub stats: WorkerStats,
    /// Set once the health scan has asked the worker to terminate.
    pub unresponsive: bool,
    /// Startup attempt this spawn belongs to; 0 once the slot has been online.
    pub start_attempt: u32,
    pub control: Arc<dyn WorkerControl>,
}

impl Worker {
    pub fn new(
        id: String,
        index: u32,
        port: u16,
        start_attempt: u32,
        control: Arc<dyn WorkerControl>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            index,
            port,
            pid: control.pid(),
            status: WorkerStatus::Starting,
            started_at: Utc::now(),
            spawned_at: now,
            last_health_at: now,
            stats: WorkerStats::default(),
            unresponsive: false,
            start_attempt,
            control,
        }
    }

    /// Handle an explicit readiness signal. Returns `true` if the worker
    /// moved from starting to online.
    pub fn mark_online(&mut self, now: Instant) -> bool {
        self.last_health_at = now;
        if self.status == WorkerStatus::Starting {
            self.status = WorkerStatus::Online;
            self.start_attempt = 0;
            true
        } else {
            false
        }
    }

    /// Apply a health sample. A health report from a starting worker counts
    /// as readiness; the return value is the same as [`Worker::mark_online`].
    pub fn record_health(&mut self, report: &HealthReport, now: Instant) -> bool {
        self.stats.cpu = report.cpu;
        self.stats.memory_pct = report.memory_pct;
        self.stats.response_time_ms = report.response_time_ms;
        self.stats.requests = self.stats.requests.max(report.requests);
        self.stats.errors = self.stats.errors.max(report.errors);
        self.mark_online(now)
    }

    pub fn record_request(&mut self) {
        self.stats.requests += 1;
    }

    pub fn record_error(&mut self) {
        self.stats.errors += 1;
    }

    /// Move to draining. Returns `false` if the worker was not live.
    pub fn begin_drain(&mut self) -> bool {
        if self.status.is_live() {
            self.status = WorkerStatus::Draining;
            true
        } else {
            false
        }
    }

    /// Whether the last health sample is older than twice the interval.
    pub fn health_overdue(&self, now: Instant, health_interval: Duration) -> bool {
        self.status.is_live()
            && !self.unresponsive
            && now.saturating_duration_since(self.last_health_at) > health_interval * 2
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.spawned_at)
    }

    pub fn snapshot(&self, now: Instant) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            index: self.index,
            port: self.port,
            pid: self.pid,
            status: self.status,
            started_at: self.started_at,
            age_ms: self.age(now).as_millis() as u64,
            last_health_ms_ago: now.saturating_duration_since(self.last_health_at).as_millis()
                as u64,
            unresponsive: self.unresponsive,
            stats: self.stats,
        }
    }
}

/// Point-in-time view of a worker, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub index: u32,
    pub port: u16,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub age_ms: u64,
    pub last_health_ms_ago: u64,
    pub unresponsive: bool,
    #[serde(flatten)]
    pub stats: WorkerStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{Launcher, MockLauncher, LaunchSpec};
    use tokio::sync::mpsc;

    async fn worker() -> Worker {
        let launcher = MockLauncher::silent();
        let (tx, _rx) = mpsc::channel(4);
        let spec = LaunchSpec {
            worker_id: "w-0".into(),
            index: 0,
            port: 3000,
        };
        let control = launcher.launch(&spec, tx).await.unwrap();
        Worker::new("w-0".into(), 0, 3000, 2, control, Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_from_starting_worker_counts_as_online() {
        let mut w = worker().await;
        assert_eq!(w.status, WorkerStatus::Starting);

        let report = HealthReport {
            cpu: 40.0,
            requests: 12,
            ..Default::default()
        };
        assert!(w.record_health(&report, Instant::now()));
        assert_eq!(w.status, WorkerStatus::Online);
        assert_eq!(w.start_attempt, 0);
        assert_eq!(w.stats.requests, 12);

        // Already online: no transition reported.
        assert!(!w.record_health(&report, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_overdue_after_twice_the_interval() {
        let mut w = worker().await;
        w.mark_online(Instant::now());
        let interval = Duration::from_secs(5);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!w.health_overdue(Instant::now(), interval));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(w.health_overdue(Instant::now(), interval));

        w.unresponsive = true;
        assert!(!w.health_overdue(Instant::now(), interval));
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_worker_is_not_live() {
        let mut w = worker().await;
        w.mark_online(Instant::now());
        assert!(w.begin_drain());
        assert!(!w.status.is_live());
        assert!(!w.begin_drain());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!w.health_overdue(Instant::now(), Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_counter_never_goes_backwards() {
        let mut w = worker().await;
        w.record_request();
        w.record_request();
        w.record_error();
        let stale = HealthReport {
            requests: 1,
            ..Default::default()
        };
        w.record_health(&stale, Instant::now());
        assert_eq!(w.stats.requests, 2);
        assert_eq!(w.stats.errors, 1);
    }
}
