// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher trait definitions.
//!
//! Defines the abstract interface the pool uses to start worker processes
//! and talk to them afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use opsplane_protocol::{SupervisorMessage, WorkerMessage};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from launcher operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// The worker program could not be started.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// The worker has not connected to the IPC socket yet.
    #[error("Worker {0} is not connected")]
    NotConnected(String),

    /// The worker process is gone.
    #[error("Worker {0} has exited")]
    Exited(String),

    /// Signal delivery failed.
    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    /// Frame could not be written to the worker.
    #[error("IPC error: {0}")]
    Frame(#[from] opsplane_protocol::FrameError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, LaunchError>;

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Unique per spawn.
    pub worker_id: String,
    /// Stable slot, reused by restarts.
    pub index: u32,
    pub port: u16,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Everything a worker does that the pool must react to.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker connected its IPC channel.
    Connected { worker_id: String, pid: u32 },
    /// A typed message from the worker.
    Message {
        worker_id: String,
        message: WorkerMessage,
    },
    /// The IPC channel closed. The process may still be running.
    Disconnected { worker_id: String },
    /// The process exited and was reaped.
    Exited {
        worker_id: String,
        status: ExitStatus,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Connected { worker_id, .. }
            | WorkerEvent::Message { worker_id, .. }
            | WorkerEvent::Disconnected { worker_id }
            | WorkerEvent::Exited { worker_id, .. } => worker_id,
        }
    }
}

/// Sender half every launched worker reports on.
pub type EventSender = mpsc::Sender<WorkerEvent>;

/// Control over one launched worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// OS process id, if the launcher has one.
    fn pid(&self) -> Option<u32>;

    /// Send a typed message over the worker's IPC channel.
    async fn send(&self, message: SupervisorMessage) -> Result<()>;

    /// Deliver an OS signal to the worker process.
    async fn signal(&self, signal: Signal) -> Result<()>;
}

/// Trait for worker launchers.
///
/// Launchers start worker processes and report their lifecycle on the
/// event channel passed to [`Launcher::launch`]. They do not keep pool
/// state; the pool actor owns every decision.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher type identifier (e.g., "process", "mock")
    fn launcher_type(&self) -> &'static str;

    /// Start one worker. Exit, IPC and disconnect notifications for it are
    /// delivered on `events` until the worker exits.
    async fn launch(&self, spec: &LaunchSpec, events: EventSender)
    -> Result<Arc<dyn WorkerControl>>;
}
