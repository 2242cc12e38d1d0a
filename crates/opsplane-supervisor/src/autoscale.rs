// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autoscaling controller.
//!
//! Every `scale_interval` the controller reads the pool status, averages the
//! health samples of `online` workers, and asks the pool actor for at most
//! one scale action. After any action the next evaluation window is skipped
//! so new or drained workers can settle into the averages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::pool::{PoolStatus, SupervisorHandle};
use crate::worker::{WorkerSnapshot, WorkerStatus};

/// Scale-down fires below this fraction of `cpu_threshold`.
const SCALE_DOWN_CPU_FACTOR: f64 = 0.3;
/// Scale-down fires below this fraction of `response_time_threshold_ms`.
const SCALE_DOWN_RT_FACTOR: f64 = 0.5;

/// Configuration for the autoscaler.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    /// Evaluation period.
    pub interval: Duration,
    /// Average CPU percent above which the pool grows.
    pub cpu_threshold: f64,
    /// Average response time above which the pool grows.
    pub response_time_threshold_ms: f64,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Workers younger than this are spared by scale-down when possible.
    pub warmup: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            cpu_threshold: 80.0,
            response_time_threshold_ms: 1000.0,
            min_workers: 1,
            max_workers: 4,
            warmup: Duration::from_secs(5),
        }
    }
}

/// Aggregates the controller decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScaleSample {
    /// Starting plus online workers.
    pub live: usize,
    pub online: usize,
    pub avg_cpu: f64,
    pub avg_memory_pct: f64,
    pub avg_response_time_ms: f64,
}

impl ScaleSample {
    pub fn from_status(status: &PoolStatus) -> Self {
        Self {
            live: status.live,
            online: status.metrics.online,
            avg_cpu: status.metrics.avg_cpu,
            avg_memory_pct: status.metrics.avg_memory_pct,
            avg_response_time_ms: status.metrics.avg_response_time_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Apply the scale-up and scale-down predicates to a sample.
pub fn evaluate(sample: &ScaleSample, config: &AutoscaleConfig) -> ScalingDecision {
    if sample.online == 0 {
        return ScalingDecision::Hold;
    }

    let hot = sample.avg_cpu > config.cpu_threshold
        || sample.avg_response_time_ms > config.response_time_threshold_ms;
    if hot && sample.live < config.max_workers {
        return ScalingDecision::ScaleUp;
    }

    let cold = sample.avg_cpu < SCALE_DOWN_CPU_FACTOR * config.cpu_threshold
        && sample.avg_response_time_ms < SCALE_DOWN_RT_FACTOR * config.response_time_threshold_ms;
    if cold && sample.live > config.min_workers {
        return ScalingDecision::ScaleDown;
    }

    ScalingDecision::Hold
}

/// Choose the online worker to drain: lowest `requests`, ties broken by
/// lowest `index`. Workers past `warmup` are preferred so a freshly started
/// worker is not drained just because it has not served anything yet.
pub fn pick_scale_down(workers: &[WorkerSnapshot], warmup: Duration) -> Option<&WorkerSnapshot> {
    let warmup_ms = warmup.as_millis() as u64;
    let online: Vec<&WorkerSnapshot> = workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Online)
        .collect();
    let settled: Vec<&WorkerSnapshot> = online
        .iter()
        .copied()
        .filter(|w| w.age_ms >= warmup_ms)
        .collect();

    if settled.is_empty() {
        lowest(online)
    } else {
        lowest(settled)
    }
}

fn lowest<'a>(candidates: Vec<&'a WorkerSnapshot>) -> Option<&'a WorkerSnapshot> {
    candidates
        .into_iter()
        .min_by(|a, b| a.stats.requests.cmp(&b.stats.requests).then(a.index.cmp(&b.index)))
}

/// What a single evaluation did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Hysteresis window after a previous action.
    Settling,
    /// Reload or shutdown in progress.
    Paused,
    Held,
    ScaledUp(WorkerSnapshot),
    ScaledDown(WorkerSnapshot),
    /// The pool refused or failed the action.
    Refused(String),
}

/// Background autoscaling controller.
pub struct Autoscaler {
    handle: SupervisorHandle,
    config: AutoscaleConfig,
    skip_next: bool,
    shutdown: Arc<Notify>,
}

impl Autoscaler {
    pub fn new(handle: SupervisorHandle, config: AutoscaleConfig) -> Self {
        Self {
            handle,
            config,
            skip_next: false,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run one evaluation window.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.skip_next {
            self.skip_next = false;
            debug!("Autoscaler skipping window after scale action");
            return TickOutcome::Settling;
        }

        let status = match self.handle.status().await {
            Ok(status) => status,
            Err(e) => return TickOutcome::Refused(e.to_string()),
        };
        if status.reloading || status.shutting_down {
            return TickOutcome::Paused;
        }

        let sample = ScaleSample::from_status(&status);
        let decision = evaluate(&sample, &self.config);
        debug!(
            live = sample.live,
            online = sample.online,
            avg_cpu = sample.avg_cpu,
            avg_memory_pct = sample.avg_memory_pct,
            avg_response_time_ms = sample.avg_response_time_ms,
            decision = ?decision,
            "Autoscaler evaluated pool"
        );

        let result = match decision {
            ScalingDecision::Hold => return TickOutcome::Held,
            ScalingDecision::ScaleUp => self.handle.scale_up().await.map(TickOutcome::ScaledUp),
            ScalingDecision::ScaleDown => {
                self.handle.scale_down().await.map(TickOutcome::ScaledDown)
            }
        };

        match result {
            Ok(outcome) => {
                self.skip_next = true;
                outcome
            }
            Err(e @ (SupervisorError::ReloadInProgress | SupervisorError::ShuttingDown)) => {
                debug!(error = %e, "Autoscaler action deferred");
                TickOutcome::Paused
            }
            Err(e) => {
                warn!(error = %e, decision = ?decision, "Autoscaler action failed");
                TickOutcome::Refused(e.to_string())
            }
        }
    }

    /// Run the controller until shutdown is signalled.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            cpu_threshold = self.config.cpu_threshold,
            response_time_threshold_ms = self.config.response_time_threshold_ms,
            "Autoscaler started"
        );

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!("Autoscaler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Autoscaler stopped");
    }
}
