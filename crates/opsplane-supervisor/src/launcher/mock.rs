// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! A launcher implementation that simulates worker processes without
//! spawning anything. Tests drive the simulated workers (health reports,
//! crashes) through the helper methods, and read back the signals and
//! messages the pool sent them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use opsplane_protocol::{HealthReport, SupervisorMessage, WorkerMessage};
use tokio::sync::Mutex;

use super::traits::*;

/// Simulated worker state.
#[derive(Debug, Clone)]
pub struct MockWorker {
    pub spec: LaunchSpec,
    pub pid: u32,
    pub alive: bool,
    /// Signals delivered by the pool, in order.
    pub signals: Vec<Signal>,
    /// Messages sent by the pool, in order.
    pub messages: Vec<SupervisorMessage>,
    events: EventSender,
}

#[derive(Default)]
struct MockState {
    workers: HashMap<String, MockWorker>,
    launches: Vec<LaunchSpec>,
    next_pid: u32,
}

/// Mock launcher for testing.
#[derive(Clone)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
    /// Report `online` right after launch.
    pub auto_online: bool,
    /// Answer `drain` with `drain_ready`.
    pub auto_drain: bool,
    /// Ignore SIGTERM; only SIGKILL ends the worker.
    pub ignore_term: bool,
    /// Exit with code 1 right after launch, before coming online.
    pub crash_on_start: bool,
    /// Fail `launch` itself.
    pub fail_launch: bool,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    /// Workers come online immediately and drain cooperatively.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_pid: 10_000,
                ..Default::default()
            })),
            auto_online: true,
            auto_drain: true,
            ignore_term: false,
            crash_on_start: false,
            fail_launch: false,
        }
    }

    /// Workers never report `online` by themselves.
    pub fn silent() -> Self {
        Self {
            auto_online: false,
            ..Self::new()
        }
    }

    /// Every worker dies during startup.
    pub fn crash_looping() -> Self {
        Self {
            auto_online: false,
            crash_on_start: true,
            ..Self::new()
        }
    }

    /// Workers ignore both `drain` and SIGTERM.
    pub fn stubborn() -> Self {
        Self {
            auto_drain: false,
            ignore_term: true,
            ..Self::new()
        }
    }

    /// Every launch fails.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new()
        }
    }

    /// Every launch request seen so far, in order.
    pub async fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().await.launches.clone()
    }

    pub async fn worker(&self, worker_id: &str) -> Option<MockWorker> {
        self.state.lock().await.workers.get(worker_id).cloned()
    }

    /// Simulated workers that have not exited, ordered by index.
    pub async fn live_workers(&self) -> Vec<MockWorker> {
        let state = self.state.lock().await;
        let mut live: Vec<MockWorker> = state.workers.values().filter(|w| w.alive).cloned().collect();
        live.sort_by_key(|w| w.spec.index);
        live
    }

    /// The live simulated worker holding `index`, if any.
    pub async fn worker_at(&self, index: u32) -> Option<MockWorker> {
        self.live_workers()
            .await
            .into_iter()
            .find(|w| w.spec.index == index)
    }

    /// Deliver a worker message as if `worker_id` had sent it.
    pub async fn send(&self, worker_id: &str, message: WorkerMessage) -> bool {
        let events = {
            let state = self.state.lock().await;
            match state.workers.get(worker_id) {
                Some(w) if w.alive => w.events.clone(),
                _ => return false,
            }
        };
        events
            .send(WorkerEvent::Message {
                worker_id: worker_id.to_string(),
                message,
            })
            .await
            .is_ok()
    }

    pub async fn send_online(&self, worker_id: &str) -> bool {
        self.send(worker_id, WorkerMessage::online()).await
    }

    pub async fn send_health(&self, worker_id: &str, report: HealthReport) -> bool {
        self.send(worker_id, WorkerMessage::health(report)).await
    }

    /// Send the same health report from every live worker.
    pub async fn broadcast_health(&self, report: HealthReport) {
        for worker in self.live_workers().await {
            self.send_health(&worker.spec.worker_id, report).await;
        }
    }

    /// End a simulated worker with the given status.
    pub async fn exit(&self, worker_id: &str, status: ExitStatus) -> bool {
        let events = {
            let mut state = self.state.lock().await;
            match state.workers.get_mut(worker_id) {
                Some(w) if w.alive => {
                    w.alive = false;
                    w.events.clone()
                }
                _ => return false,
            }
        };
        events
            .send(WorkerEvent::Exited {
                worker_id: worker_id.to_string(),
                status,
            })
            .await
            .is_ok()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn launcher_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        events: EventSender,
    ) -> Result<Arc<dyn WorkerControl>> {
        let mut state = self.state.lock().await;
        state.launches.push(spec.clone());

        if self.fail_launch {
            return Err(LaunchError::StartFailed("mock launch failure".into()));
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        state.workers.insert(
            spec.worker_id.clone(),
            MockWorker {
                spec: spec.clone(),
                pid,
                alive: !self.crash_on_start,
                signals: Vec::new(),
                messages: Vec::new(),
                events: events.clone(),
            },
        );
        drop(state);

        let worker_id = spec.worker_id.clone();
        if self.crash_on_start {
            tokio::spawn(async move {
                let _ = events
                    .send(WorkerEvent::Exited {
                        worker_id,
                        status: ExitStatus::code(1),
                    })
                    .await;
            });
        } else if self.auto_online {
            tokio::spawn(async move {
                let _ = events
                    .send(WorkerEvent::Connected {
                        worker_id: worker_id.clone(),
                        pid,
                    })
                    .await;
                let _ = events
                    .send(WorkerEvent::Message {
                        worker_id,
                        message: WorkerMessage::online(),
                    })
                    .await;
            });
        }

        Ok(Arc::new(MockControl {
            worker_id: spec.worker_id.clone(),
            pid,
            launcher: self.clone(),
        }))
    }
}

struct MockControl {
    worker_id: String,
    pid: u32,
    launcher: MockLauncher,
}

#[async_trait]
impl WorkerControl for MockControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn send(&self, message: SupervisorMessage) -> Result<()> {
        let mut state = self.launcher.state.lock().await;
        let worker = state
            .workers
            .get_mut(&self.worker_id)
            .filter(|w| w.alive)
            .ok_or_else(|| LaunchError::NotConnected(self.worker_id.clone()))?;
        let drain = message.is_drain();
        worker.messages.push(message);

        if drain && self.launcher.auto_drain {
            let events = worker.events.clone();
            let worker_id = self.worker_id.clone();
            tokio::spawn(async move {
                let _ = events
                    .send(WorkerEvent::Message {
                        worker_id,
                        message: WorkerMessage::drain_ready(),
                    })
                    .await;
            });
        }
        Ok(())
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        let mut state = self.launcher.state.lock().await;
        let worker = state
            .workers
            .get_mut(&self.worker_id)
            .filter(|w| w.alive)
            .ok_or_else(|| LaunchError::Exited(self.worker_id.clone()))?;
        worker.signals.push(signal);

        let terminates = match signal {
            Signal::SIGKILL => true,
            Signal::SIGTERM | Signal::SIGINT => !self.launcher.ignore_term,
            _ => false,
        };
        if terminates {
            worker.alive = false;
            let events = worker.events.clone();
            let worker_id = self.worker_id.clone();
            tokio::spawn(async move {
                let _ = events
                    .send(WorkerEvent::Exited {
                        worker_id,
                        status: ExitStatus::signaled(signal),
                    })
                    .await;
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn spec(id: &str, index: u32) -> LaunchSpec {
        LaunchSpec {
            worker_id: id.into(),
            index,
            port: 3000,
        }
    }

    #[tokio::test]
    async fn test_auto_online_and_cooperative_drain() {
        let launcher = MockLauncher::new();
        let (tx, mut rx) = mpsc::channel(16);
        let control = launcher.launch(&spec("w-0", 0), tx).await.unwrap();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Connected { .. })));
        match rx.recv().await {
            Some(WorkerEvent::Message { message, .. }) => assert_eq!(message.type_name(), "online"),
            other => panic!("unexpected event: {:?}", other),
        }

        control.send(SupervisorMessage::drain()).await.unwrap();
        match rx.recv().await {
            Some(WorkerEvent::Message { message, .. }) => {
                assert_eq!(message.type_name(), "drain_ready")
            }
            other => panic!("unexpected event: {:?}", other),
        }

        control.signal(Signal::SIGTERM).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WorkerEvent::Exited {
                worker_id: "w-0".into(),
                status: ExitStatus::signaled(Signal::SIGTERM),
            })
        );
        assert!(launcher.live_workers().await.is_empty());
    }

    #[tokio::test]
    async fn test_stubborn_worker_only_dies_on_kill() {
        let launcher = MockLauncher::stubborn();
        let (tx, mut rx) = mpsc::channel(16);
        let control = launcher.launch(&spec("w-1", 1), tx).await.unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        control.signal(Signal::SIGTERM).await.unwrap();
        assert!(launcher.worker_at(1).await.is_some());

        control.signal(Signal::SIGKILL).await.unwrap();
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Exited { .. })));
        let worker = launcher.worker("w-1").await.unwrap();
        assert_eq!(worker.signals, vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_failing_launcher_records_attempt() {
        let launcher = MockLauncher::failing();
        let (tx, _rx) = mpsc::channel(4);
        assert!(launcher.launch(&spec("w-2", 2), tx).await.is_err());
        assert_eq!(launcher.launches().await.len(), 1);
    }
}
