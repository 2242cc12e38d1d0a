// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zero-downtime reload coordinator.
//!
//! Runs as its own task and drives the pool actor through the public
//! handle, so worker events keep flowing while the reload waits:
//!
//! 1. fork one replacement per old worker at fresh indices, staggered
//! 2. wait `warmup` for replacements to come online
//! 3. drain each old worker, staggered
//! 4. wait until every old worker has exited

use std::time::Duration;

use opsplane_core::{EventBus, OpsEvent};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::pool::SupervisorHandle;
use crate::worker::WorkerStatus;

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Inputs captured by the pool actor when the reload starts.
#[derive(Debug, Clone)]
pub struct ReloadPlan {
    /// Live workers at reload start, ordered by index.
    pub old: Vec<String>,
    /// Workers to fork: one per old worker plus one per slot that was
    /// waiting for a restart.
    pub replacements: usize,
    /// First index for replacements, above the current high-water mark.
    pub first_index: u32,
    pub stagger: Duration,
    pub warmup: Duration,
    /// How long to wait for drained workers to exit.
    pub drain_deadline: Duration,
}

/// Outcome of a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadReport {
    /// Old workers that were drained.
    pub replaced: Vec<String>,
    /// Replacement workers that were forked.
    pub started: Vec<String>,
    /// Replacements that had not reported online when warmup ended.
    pub not_online: Vec<String>,
    /// Old workers still present at the drain deadline.
    pub lingering: Vec<String>,
}

pub(crate) async fn run(handle: SupervisorHandle, plan: ReloadPlan, events: EventBus) -> ReloadReport {
    let mut report = ReloadReport::default();
    events.emit(OpsEvent::ReloadStarted {
        replacing: plan.old.len(),
    });

    for i in 0..plan.replacements {
        if i > 0 {
            tokio::time::sleep(plan.stagger).await;
        }
        let index = plan.first_index + i as u32;
        match handle.spawn_at(index).await {
            Ok(worker) => report.started.push(worker.id),
            Err(e) => warn!(index, error = %e, "Reload replacement failed to launch"),
        }
    }

    tokio::time::sleep(plan.warmup).await;

    if let Ok(status) = handle.status().await {
        report.not_online = report
            .started
            .iter()
            .filter(|id| {
                status
                    .get(id)
                    .is_none_or(|w| w.status != WorkerStatus::Online)
            })
            .cloned()
            .collect();
    }
    if !report.not_online.is_empty() {
        warn!(
            not_online = ?report.not_online,
            "Replacements not online after warmup, draining old workers anyway"
        );
    }

    for (i, worker_id) in plan.old.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(plan.stagger).await;
        }
        match handle.drain(worker_id).await {
            Ok(()) => report.replaced.push(worker_id.clone()),
            // Exited on its own in the meantime.
            Err(e) => info!(worker_id = %worker_id, error = %e, "Old worker not drained"),
        }
    }

    let deadline = Instant::now() + plan.drain_deadline;
    loop {
        let Ok(status) = handle.status().await else {
            break;
        };
        let remaining: Vec<String> = plan
            .old
            .iter()
            .filter(|id| status.get(id).is_some())
            .cloned()
            .collect();
        if remaining.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            warn!(remaining = ?remaining, "Old workers still present after drain deadline");
            report.lingering = remaining;
            break;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    info!(
        replaced = report.replaced.len(),
        started = report.started.len(),
        "Reload completed"
    );
    events.emit(OpsEvent::ReloadCompleted {
        replaced: report.replaced.len(),
    });
    report
}
