// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool actor.
//!
//! A single task owns every [`Worker`] record. All pool mutations (worker
//! events from launchers, operator commands, timer expiries) arrive on
//! channels and are applied one at a time, so lifecycle transitions for a
//! worker are totally ordered.
//!
//! ```text
//!   SupervisorHandle ──Command──┐
//!   timers (respawn, kill) ─────┼──► Supervisor::run ──► Launcher
//!   Launcher ──WorkerEvent──────┘          │
//!                                          └──► EventBus
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use opsplane_core::{EventBus, OpsEvent};
use opsplane_protocol::messages::worker_message;
use opsplane_protocol::SupervisorMessage;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::autoscale::pick_scale_down;
use crate::error::{Result, SupervisorError};
use crate::launcher::{EventSender, ExitStatus, LaunchSpec, Launcher, WorkerEvent};
use crate::reload::{self, ReloadPlan, ReloadReport};
use crate::worker::{Worker, WorkerSnapshot, WorkerStatus};

const COMMAND_CAPACITY: usize = 256;
const WORKER_EVENT_CAPACITY: usize = 1024;
/// Extra time after `graceful_timeout` before shutdown gives up on exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Cap on the startup backoff multiplier.
const MAX_BACKOFF_SHIFT: u32 = 5;

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub ports: Vec<u16>,
    /// Workers started at boot.
    pub workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub restart_delay: Duration,
    pub health_interval: Duration,
    pub graceful_timeout: Duration,
    pub start_retry_limit: u32,
    pub stagger_interval: Duration,
    pub warmup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ports: vec![3000],
            workers: 1,
            min_workers: 1,
            max_workers: 4,
            restart_delay: Duration::from_secs(1),
            health_interval: Duration::from_secs(5),
            graceful_timeout: Duration::from_secs(30),
            start_retry_limit: 5,
            stagger_interval: Duration::from_secs(1),
            warmup_interval: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// `ports[index mod len(ports)]`.
    pub fn port_for(&self, index: u32) -> u16 {
        if self.ports.is_empty() {
            return 0;
        }
        self.ports[index as usize % self.ports.len()]
    }

    /// The health scan runs at a tenth of the health interval so an overdue
    /// worker is caught shortly after twice the interval has passed.
    pub fn health_scan_period(&self) -> Duration {
        (self.health_interval / 10).max(Duration::from_millis(50))
    }

    /// Delay before the restart that follows `failures` consecutive failed
    /// starts.
    pub fn start_backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.restart_delay * (1u32 << shift)
    }
}

/// Averages over online workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub online: usize,
    pub avg_cpu: f64,
    pub avg_memory_pct: f64,
    pub avg_response_time_ms: f64,
    pub total_requests: u64,
    pub total_errors: u64,
}

/// Snapshot of the pool returned by [`SupervisorHandle::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerSnapshot>,
    pub live: usize,
    pub starting: usize,
    pub online: usize,
    pub draining: usize,
    /// Slots with a restart scheduled. Counted in `live`.
    pub restarting: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub ports: Vec<u16>,
    pub reloading: bool,
    pub shutting_down: bool,
    pub metrics: PoolMetrics,
}

impl PoolStatus {
    pub fn online_workers(&self) -> impl Iterator<Item = &WorkerSnapshot> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Online)
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.id == worker_id)
    }
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers present when shutdown began.
    pub workers: usize,
    /// Workers that exited on their own after `drain`.
    pub graceful: usize,
    /// Workers killed after `graceful_timeout`.
    pub forced: usize,
}

enum Command {
    Status(oneshot::Sender<PoolStatus>),
    ScaleUp(oneshot::Sender<Result<WorkerSnapshot>>),
    ScaleDown(oneshot::Sender<Result<WorkerSnapshot>>),
    SpawnAt {
        index: u32,
        reply: oneshot::Sender<Result<WorkerSnapshot>>,
    },
    Drain {
        worker_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Kill {
        worker_id: String,
        signal: Signal,
        reply: oneshot::Sender<Result<()>>,
    },
    Forward {
        signal: Signal,
        reply: oneshot::Sender<usize>,
    },
    Reload(oneshot::Sender<Result<ReloadReport>>),
    ReloadFinished {
        report: ReloadReport,
        reply: oneshot::Sender<Result<ReloadReport>>,
    },
    Shutdown(oneshot::Sender<ShutdownReport>),
    Respawn {
        index: u32,
        attempt: u32,
    },
    HardKill {
        worker_id: String,
    },
    ShutdownDeadline,
}

/// Cloneable handle to the pool actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    shutdown_rx: watch::Receiver<Option<ShutdownReport>>,
    fatal_rx: watch::Receiver<Option<String>>,
}

impl SupervisorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    pub async fn status(&self) -> Result<PoolStatus> {
        self.request(Command::Status).await
    }

    /// Fork one worker at `1 + max(indices)`.
    pub async fn scale_up(&self) -> Result<WorkerSnapshot> {
        self.request(Command::ScaleUp).await?
    }

    /// Drain the worker chosen by the scale-down policy.
    pub async fn scale_down(&self) -> Result<WorkerSnapshot> {
        self.request(Command::ScaleDown).await?
    }

    /// Fork a worker at an explicit index.
    pub async fn spawn_at(&self, index: u32) -> Result<WorkerSnapshot> {
        self.request(|reply| Command::SpawnAt { index, reply }).await?
    }

    /// Send `drain` to one worker and schedule its hard kill.
    pub async fn drain(&self, worker_id: &str) -> Result<()> {
        let worker_id = worker_id.to_string();
        self.request(|reply| Command::Drain { worker_id, reply })
            .await?
    }

    /// Replace every live worker without dropping traffic.
    pub async fn reload(&self) -> Result<ReloadReport> {
        self.request(Command::Reload).await?
    }

    /// Deliver `signal` to one worker.
    pub async fn kill(&self, worker_id: &str, signal: Signal) -> Result<()> {
        let worker_id = worker_id.to_string();
        self.request(|reply| Command::Kill {
            worker_id,
            signal,
            reply,
        })
        .await?
    }

    /// Deliver `signal` to every worker. Returns how many were signalled.
    pub async fn forward_signal(&self, signal: Signal) -> Result<usize> {
        self.request(|reply| Command::Forward { signal, reply }).await
    }

    /// Drain every worker and wait for them to exit, killing stragglers
    /// after `graceful_timeout`. Calling it again returns the same report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let cached = self.shutdown_rx.borrow().clone();
        if let Some(report) = cached {
            return report;
        }

        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).await.is_ok()
            && let Ok(report) = rx.await
        {
            return report;
        }

        let mut watch = self.shutdown_rx.clone();
        match watch.wait_for(Option::is_some).await {
            Ok(report) => (*report).clone().unwrap_or_default(),
            Err(_) => ShutdownReport::default(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_rx.borrow().is_some()
    }

    /// Resolves with the reason once the supervisor hits a fatal condition.
    pub async fn fatal(&self) -> String {
        let mut rx = self.fatal_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone().unwrap_or_default(),
            Err(_) => std::future::pending().await,
        }
    }

    /// The fatal reason, if one has been published.
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_rx.borrow().clone()
    }
}

struct ShutdownState {
    waiters: Vec<oneshot::Sender<ShutdownReport>>,
    workers: usize,
    forced: usize,
}

/// The pool actor.
pub struct Supervisor {
    config: PoolConfig,
    launcher: Arc<dyn Launcher>,
    events: EventBus,
    workers: HashMap<String, Worker>,
    /// Indices with a restart scheduled but not yet forked.
    pending_respawn: BTreeSet<u32>,
    reloading: bool,
    reload_old: HashSet<String>,
    shutdown: Option<ShutdownState>,
    finished: bool,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    worker_tx: EventSender,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    shutdown_tx: watch::Sender<Option<ShutdownReport>>,
    fatal_tx: watch::Sender<Option<String>>,
}

impl Supervisor {
    /// Start the pool actor. `config.workers` workers are forked before the
    /// actor begins serving commands.
    pub fn spawn(
        config: PoolConfig,
        launcher: Arc<dyn Launcher>,
        events: EventBus,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let handle = SupervisorHandle {
            tx: cmd_tx.clone(),
            shutdown_rx,
            fatal_rx,
        };

        let supervisor = Self {
            config,
            launcher,
            events,
            workers: HashMap::new(),
            pending_respawn: BTreeSet::new(),
            reloading: false,
            reload_old: HashSet::new(),
            shutdown: None,
            finished: false,
            cmd_tx,
            cmd_rx,
            worker_tx,
            worker_rx,
            shutdown_tx,
            fatal_tx,
        };

        let task = tokio::spawn(supervisor.run());
        (handle, task)
    }

    fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.cmd_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            fatal_rx: self.fatal_tx.subscribe(),
        }
    }

    async fn run(mut self) {
        info!(
            launcher = self.launcher.launcher_type(),
            workers = self.config.workers,
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            ports = ?self.config.ports,
            "Worker supervisor starting"
        );

        for index in 0..self.config.workers as u32 {
            if let Err(e) = self.spawn_worker(index, 0).await {
                warn!(index, error = %e, "Initial worker failed to launch");
            }
        }

        let mut scan = tokio::time::interval(self.config.health_scan_period());
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished {
            tokio::select! {
                biased;

                Some(event) = self.worker_rx.recv() => {
                    self.on_worker_event(event).await;
                }
                Some(command) = self.cmd_rx.recv() => {
                    self.on_command(command).await;
                }
                _ = scan.tick() => {
                    self.health_scan().await;
                }
            }
        }

        info!("Worker supervisor stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::ScaleUp(reply) => {
                let result = self.scale_up().await;
                let _ = reply.send(result);
            }
            Command::ScaleDown(reply) => {
                let result = self.scale_down().await;
                let _ = reply.send(result);
            }
            Command::SpawnAt { index, reply } => {
                let result = if self.shutdown.is_some() {
                    Err(SupervisorError::ShuttingDown)
                } else {
                    self.spawn_worker(index, 0).await
                };
                let _ = reply.send(result);
            }
            Command::Drain { worker_id, reply } => {
                let result = self.drain_worker(&worker_id).await;
                let _ = reply.send(result);
            }
            Command::Kill {
                worker_id,
                signal,
                reply,
            } => {
                let result = match self.workers.get(&worker_id) {
                    Some(worker) => worker.control.signal(signal).await.map_err(Into::into),
                    None => Err(SupervisorError::UnknownWorker(worker_id)),
                };
                let _ = reply.send(result);
            }
            Command::Forward { signal, reply } => {
                let mut delivered = 0;
                for worker in self.workers.values() {
                    match worker.control.signal(signal).await {
                        Ok(()) => delivered += 1,
                        Err(e) => debug!(worker_id = %worker.id, error = %e, "Signal not delivered"),
                    }
                }
                info!(signal = %signal, delivered, "Forwarded signal to workers");
                let _ = reply.send(delivered);
            }
            Command::Reload(reply) => self.begin_reload(reply),
            Command::ReloadFinished { report, reply } => {
                self.reloading = false;
                self.reload_old.clear();
                let _ = reply.send(Ok(report));
            }
            Command::Shutdown(reply) => self.begin_shutdown(reply).await,
            Command::Respawn { index, attempt } => {
                if !self.pending_respawn.remove(&index) {
                    debug!(index, "Restart cancelled");
                    return;
                }
                if self.shutdown.is_some() || self.fatal_tx.borrow().is_some() {
                    return;
                }
                if self.index_occupied(index) {
                    debug!(index, "Slot already occupied, skipping restart");
                    return;
                }
                let live = self.live_count();
                if live >= self.config.max_workers {
                    warn!(index, live, max_workers = self.config.max_workers, "Pool at max_workers, dropping restart");
                    return;
                }
                if let Err(e) = self.spawn_worker(index, attempt).await {
                    warn!(index, error = %e, "Worker restart failed to launch");
                }
            }
            Command::HardKill { worker_id } => self.hard_kill(&worker_id).await,
            Command::ShutdownDeadline => {
                if self.shutdown.is_some() && !self.workers.is_empty() {
                    warn!(
                        remaining = self.workers.len(),
                        "Workers did not exit after SIGKILL, abandoning them"
                    );
                    self.workers.clear();
                    self.finish_shutdown_if_done();
                }
            }
        }
    }

    fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let mut workers: Vec<WorkerSnapshot> =
            self.workers.values().map(|w| w.snapshot(now)).collect();
        workers.sort_by(|a, b| a.index.cmp(&b.index).then(a.started_at.cmp(&b.started_at)));

        let count = |status: WorkerStatus| workers.iter().filter(|w| w.status == status).count();
        let starting = count(WorkerStatus::Starting);
        let online = count(WorkerStatus::Online);
        let draining = count(WorkerStatus::Draining);

        let mut metrics = PoolMetrics {
            online,
            ..Default::default()
        };
        for w in workers.iter().filter(|w| w.status == WorkerStatus::Online) {
            metrics.avg_cpu += w.stats.cpu;
            metrics.avg_memory_pct += w.stats.memory_pct;
            metrics.avg_response_time_ms += w.stats.response_time_ms;
        }
        if online > 0 {
            let n = online as f64;
            metrics.avg_cpu /= n;
            metrics.avg_memory_pct /= n;
            metrics.avg_response_time_ms /= n;
        }
        metrics.total_requests = workers.iter().map(|w| w.stats.requests).sum();
        metrics.total_errors = workers.iter().map(|w| w.stats.errors).sum();

        PoolStatus {
            live: self.live_count(),
            starting,
            online,
            draining,
            restarting: self.restarting_count(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            ports: self.config.ports.clone(),
            reloading: self.reloading,
            shutting_down: self.shutdown.is_some(),
            metrics,
            workers,
        }
    }

    /// Starting and online workers plus slots waiting for a restart.
    fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.status.is_live()).count() + self.restarting_count()
    }

    fn restarting_count(&self) -> usize {
        self.pending_respawn
            .iter()
            .filter(|index| !self.index_occupied(**index))
            .count()
    }

    fn index_occupied(&self, index: u32) -> bool {
        self.workers.values().any(|w| w.index == index && w.status.is_live())
    }

    fn next_index(&self) -> u32 {
        let used = self.workers.values().map(|w| w.index + 1).max().unwrap_or(0);
        let reserved = self.pending_respawn.iter().next_back().map(|i| i + 1).unwrap_or(0);
        used.max(reserved)
    }

    async fn scale_up(&mut self) -> Result<WorkerSnapshot> {
        if self.shutdown.is_some() {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.reloading {
            return Err(SupervisorError::ReloadInProgress);
        }
        if self.live_count() >= self.config.max_workers {
            return Err(SupervisorError::AtMaxWorkers(self.config.max_workers));
        }
        let snapshot = self.spawn_worker(self.next_index(), 0).await?;
        let live = self.live_count();
        info!(worker_id = %snapshot.id, index = snapshot.index, port = snapshot.port, live, "Scaled up");
        self.events.emit(OpsEvent::ScaledUp { live });
        Ok(snapshot)
    }

    async fn scale_down(&mut self) -> Result<WorkerSnapshot> {
        if self.shutdown.is_some() {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.reloading {
            return Err(SupervisorError::ReloadInProgress);
        }
        if self.live_count() <= self.config.min_workers {
            return Err(SupervisorError::AtMinWorkers(self.config.min_workers));
        }
        let status = self.status();
        let victim = pick_scale_down(&status.workers, self.config.warmup_interval)
            .cloned()
            .ok_or(SupervisorError::NoScaleDownCandidate)?;

        self.drain_worker(&victim.id).await?;
        let live = self.live_count();
        info!(worker_id = %victim.id, index = victim.index, requests = victim.stats.requests, live, "Scaled down");
        self.events.emit(OpsEvent::ScaledDown {
            live,
            worker_id: victim.id.clone(),
        });
        Ok(victim)
    }

    fn begin_reload(&mut self, reply: oneshot::Sender<Result<ReloadReport>>) {
        if self.shutdown.is_some() {
            let _ = reply.send(Err(SupervisorError::ShuttingDown));
            return;
        }
        if self.reloading {
            let _ = reply.send(Err(SupervisorError::ReloadInProgress));
            return;
        }

        let mut old: Vec<&Worker> = self.workers.values().filter(|w| w.status.is_live()).collect();
        old.sort_by_key(|w| w.index);
        let old: Vec<String> = old.iter().map(|w| w.id.clone()).collect();
        // Pending restarts are folded into the replacement set.
        let restarting = self.restarting_count();
        let first_index = self.next_index();
        if !self.pending_respawn.is_empty() {
            debug!(slots = ?self.pending_respawn, "Cancelling pending restarts for reload");
            self.pending_respawn.clear();
        }
        let plan = ReloadPlan {
            replacements: old.len() + restarting,
            old,
            first_index,
            stagger: self.config.stagger_interval,
            warmup: self.config.warmup_interval,
            drain_deadline: self.config.graceful_timeout + SHUTDOWN_GRACE,
        };

        self.reloading = true;
        self.reload_old = plan.old.iter().cloned().collect();
        info!(replacing = plan.old.len(), first_index = plan.first_index, "Reload started");

        let handle = self.handle();
        let events = self.events.clone();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let report = reload::run(handle, plan, events).await;
            let _ = tx.send(Command::ReloadFinished { report, reply }).await;
        });
    }

    async fn begin_shutdown(&mut self, reply: oneshot::Sender<ShutdownReport>) {
        let cached = self.shutdown_tx.borrow().clone();
        if let Some(report) = cached {
            let _ = reply.send(report);
            return;
        }
        if let Some(state) = self.shutdown.as_mut() {
            debug!("Shutdown already in progress");
            state.waiters.push(reply);
            return;
        }

        info!(workers = self.workers.len(), "Shutdown started, draining workers");
        self.events.emit(OpsEvent::ShutdownStarted);
        self.shutdown = Some(ShutdownState {
            waiters: vec![reply],
            workers: self.workers.len(),
            forced: 0,
        });

        let live: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.status.is_live())
            .map(|w| w.id.clone())
            .collect();
        for worker_id in live {
            if let Err(e) = self.drain_worker(&worker_id).await {
                debug!(worker_id = %worker_id, error = %e, "Drain during shutdown failed");
            }
        }
        self.schedule(
            self.config.graceful_timeout + SHUTDOWN_GRACE,
            Command::ShutdownDeadline,
        );
        self.finish_shutdown_if_done();
    }

    fn finish_shutdown_if_done(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        let Some(state) = self.shutdown.take() else {
            return;
        };

        let report = ShutdownReport {
            workers: state.workers,
            graceful: state.workers.saturating_sub(state.forced),
            forced: state.forced,
        };
        info!(
            workers = report.workers,
            graceful = report.graceful,
            forced = report.forced,
            "Shutdown complete"
        );
        self.events.emit(OpsEvent::ShutdownCompleted {
            workers: report.workers,
            forced: report.forced,
        });
        self.shutdown_tx.send_replace(Some(report.clone()));
        for waiter in state.waiters {
            let _ = waiter.send(report.clone());
        }
        self.finished = true;
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    async fn spawn_worker(&mut self, index: u32, attempt: u32) -> Result<WorkerSnapshot> {
        let simple = Uuid::new_v4().simple().to_string();
        let spec = LaunchSpec {
            worker_id: format!("w{}-{}", index, &simple[..8]),
            index,
            port: self.config.port_for(index),
        };

        match self.launcher.launch(&spec, self.worker_tx.clone()).await {
            Ok(control) => {
                let now = Instant::now();
                let worker = Worker::new(spec.worker_id.clone(), index, spec.port, attempt, control, now);
                info!(worker_id = %worker.id, index, port = spec.port, pid = ?worker.pid, "Worker spawned");
                self.events.emit(OpsEvent::WorkerSpawned {
                    worker_id: worker.id.clone(),
                    index,
                    pid: worker.pid,
                });
                let snapshot = worker.snapshot(now);
                self.workers.insert(worker.id.clone(), worker);
                Ok(snapshot)
            }
            Err(e) => {
                warn!(index, port = spec.port, error = %e, "Worker launch failed");
                self.on_start_failure(index, attempt);
                Err(e.into())
            }
        }
    }

    /// A slot failed to reach `online`. `attempt` is the number of earlier
    /// consecutive failures.
    fn on_start_failure(&mut self, index: u32, attempt: u32) {
        let failures = attempt + 1;
        if failures >= self.config.start_retry_limit {
            let reason = format!("worker slot {index} failed to start {failures} times");
            error!(index, attempts = failures, "Worker keeps failing during startup");
            self.events.emit(OpsEvent::WorkerStartupFailed {
                index,
                attempts: failures,
            });
            self.fatal_tx.send_replace(Some(reason));
            return;
        }
        let delay = self.config.start_backoff(failures);
        self.schedule_respawn(index, failures, delay);
    }

    fn schedule_respawn(&mut self, index: u32, attempt: u32, delay: Duration) {
        info!(index, attempt, delay_ms = delay.as_millis() as u64, "Worker restart scheduled");
        self.events.emit(OpsEvent::WorkerRestartScheduled {
            index,
            delay_ms: delay.as_millis() as u64,
        });
        self.pending_respawn.insert(index);
        self.schedule(delay, Command::Respawn { index, attempt });
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command).await;
        });
    }

    async fn drain_worker(&mut self, worker_id: &str) -> Result<()> {
        let graceful_timeout = self.config.graceful_timeout;
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SupervisorError::UnknownWorker(worker_id.to_string()))?;
        if !worker.begin_drain() {
            return Ok(());
        }

        debug!(worker_id = %worker.id, index = worker.index, "Draining worker");
        if let Err(e) = worker.control.send(SupervisorMessage::drain()).await {
            warn!(worker_id = %worker.id, error = %e, "Drain message not delivered, sending SIGTERM");
            if let Err(e) = worker.control.signal(Signal::SIGTERM).await {
                debug!(worker_id = %worker.id, error = %e, "SIGTERM not delivered");
            }
        }
        self.schedule(
            graceful_timeout,
            Command::HardKill {
                worker_id: worker_id.to_string(),
            },
        );
        Ok(())
    }

    async fn hard_kill(&mut self, worker_id: &str) {
        let Some(worker) = self.workers.get(worker_id) else {
            return;
        };
        if worker.status != WorkerStatus::Draining && !worker.unresponsive {
            return;
        }
        warn!(worker_id = %worker.id, index = worker.index, "Worker did not exit in time, sending SIGKILL");
        if let Err(e) = worker.control.signal(Signal::SIGKILL).await {
            debug!(worker_id = %worker.id, error = %e, "SIGKILL not delivered");
        }
        if let Some(state) = self.shutdown.as_mut() {
            state.forced += 1;
        }
    }

    async fn health_scan(&mut self) {
        if self.shutdown.is_some() {
            return;
        }
        let now = Instant::now();
        let interval = self.config.health_interval;
        let overdue: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.health_overdue(now, interval))
            .map(|w| w.id.clone())
            .collect();

        for worker_id in overdue {
            let Some(worker) = self.workers.get_mut(&worker_id) else {
                continue;
            };
            worker.unresponsive = true;
            warn!(
                worker_id = %worker.id,
                index = worker.index,
                silent_ms = now.saturating_duration_since(worker.last_health_at).as_millis() as u64,
                "Worker unresponsive, sending SIGTERM"
            );
            self.events.emit(OpsEvent::WorkerUnresponsive {
                worker_id: worker.id.clone(),
                index: worker.index,
            });
            if let Err(e) = worker.control.signal(Signal::SIGTERM).await {
                warn!(worker_id = %worker.id, error = %e, "SIGTERM not delivered");
            }
            self.schedule(
                self.config.graceful_timeout,
                Command::HardKill { worker_id },
            );
        }
    }

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Connected { worker_id, pid } => {
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    debug!(worker_id = %worker_id, pid, "Worker IPC connected");
                    worker.pid.get_or_insert(pid);
                }
            }
            WorkerEvent::Message { worker_id, message } => {
                self.on_worker_message(&worker_id, message.kind).await;
            }
            WorkerEvent::Disconnected { worker_id } => {
                if let Some(worker) = self.workers.get(&worker_id)
                    && worker.status.is_live()
                {
                    warn!(worker_id = %worker_id, index = worker.index, "Worker IPC channel closed");
                }
            }
            WorkerEvent::Exited { worker_id, status } => self.on_exit(&worker_id, status),
        }
    }

    async fn on_worker_message(&mut self, worker_id: &str, kind: Option<worker_message::Kind>) {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            debug!(worker_id = %worker_id, "Message from unknown worker ignored");
            return;
        };
        let now = Instant::now();

        let became_online = match kind {
            Some(worker_message::Kind::Online(_)) => worker.mark_online(now),
            Some(worker_message::Kind::Health(report)) => worker.record_health(&report, now),
            Some(worker_message::Kind::Request(_)) => {
                worker.record_request();
                false
            }
            Some(worker_message::Kind::Error(e)) => {
                worker.record_error();
                warn!(worker_id = %worker.id, index = worker.index, error = %e.error, "Worker reported error");
                false
            }
            Some(worker_message::Kind::DrainReady(_)) => {
                if worker.status == WorkerStatus::Draining {
                    debug!(worker_id = %worker.id, "Worker drained, sending SIGTERM");
                    if let Err(e) = worker.control.signal(Signal::SIGTERM).await {
                        debug!(worker_id = %worker.id, error = %e, "SIGTERM not delivered");
                    }
                } else {
                    debug!(worker_id = %worker.id, status = worker.status.as_str(), "Unsolicited drain_ready ignored");
                }
                false
            }
            None => {
                debug!(worker_id = %worker.id, "Unknown worker message ignored");
                false
            }
        };

        if became_online {
            info!(worker_id = %worker.id, index = worker.index, port = worker.port, "Worker online");
            self.events.emit(OpsEvent::WorkerOnline {
                worker_id: worker.id.clone(),
                index: worker.index,
            });
        }
    }

    fn on_exit(&mut self, worker_id: &str, status: ExitStatus) {
        let Some(worker) = self.workers.remove(worker_id) else {
            debug!(worker_id = %worker_id, "Exit of unknown worker ignored");
            return;
        };
        let prior = worker.status;
        let replaced = self.reload_old.remove(worker_id);

        if prior == WorkerStatus::Draining {
            info!(worker_id = %worker.id, index = worker.index, code = ?status.code, signal = ?status.signal, "Worker exited after drain");
        } else {
            warn!(worker_id = %worker.id, index = worker.index, state = prior.as_str(), code = ?status.code, signal = ?status.signal, "Worker exited");
        }
        self.events.emit(OpsEvent::WorkerExited {
            worker_id: worker.id.clone(),
            index: worker.index,
            code: status.code,
            signal: status.signal,
            state: prior.as_str().to_string(),
        });

        if self.shutdown.is_some() {
            self.finish_shutdown_if_done();
            return;
        }
        if self.fatal_tx.borrow().is_some() || replaced {
            return;
        }

        match prior {
            WorkerStatus::Starting => self.on_start_failure(worker.index, worker.start_attempt),
            WorkerStatus::Online => {
                self.schedule_respawn(worker.index, 0, self.config.restart_delay)
            }
            WorkerStatus::Draining | WorkerStatus::Dead => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_assignment_wraps() {
        let config = PoolConfig {
            ports: vec![3000, 3001],
            ..Default::default()
        };
        assert_eq!(config.port_for(0), 3000);
        assert_eq!(config.port_for(1), 3001);
        assert_eq!(config.port_for(2), 3000);
        assert_eq!(config.port_for(7), 3001);
    }

    #[test]
    fn test_start_backoff_doubles_and_caps() {
        let config = PoolConfig {
            restart_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.start_backoff(1), Duration::from_millis(100));
        assert_eq!(config.start_backoff(2), Duration::from_millis(200));
        assert_eq!(config.start_backoff(3), Duration::from_millis(400));
        assert_eq!(config.start_backoff(20), Duration::from_millis(3200));
    }

    #[test]
    fn test_health_scan_period_has_floor() {
        let config = PoolConfig {
            health_interval: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.health_scan_period(), Duration::from_millis(50));
    }
}
