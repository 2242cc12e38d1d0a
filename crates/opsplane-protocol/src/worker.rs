// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side IPC client.
//!
//! A worker process launched by the supervisor finds the IPC socket and its
//! spawn id in the environment, connects, and announces itself with a
//! `Hello` frame. After that the connection carries `WorkerMessage` frames
//! upstream and `SupervisorMessage` frames downstream.

use std::path::Path;

use thiserror::Error;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::messages::{HealthReport, Hello, SupervisorMessage, WorkerMessage};

/// Environment variable carrying the supervisor IPC socket path.
pub const ENV_IPC_SOCKET: &str = "OPSPLANE_IPC_SOCKET";
/// Environment variable carrying the worker spawn id.
pub const ENV_WORKER_ID: &str = "OPSPLANE_WORKER_ID";
/// Environment variable carrying the stable worker slot.
pub const ENV_WORKER_INDEX: &str = "WORKER_INDEX";
/// Environment variable carrying the assigned listening port.
pub const ENV_PORT: &str = "PORT";
/// Set to `true` for every supervised worker.
pub const ENV_CLUSTER_MODE: &str = "CLUSTER_MODE";

/// Errors from the worker channel.
#[derive(Debug, Error)]
pub enum WorkerChannelError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {0}")]
    InvalidEnv(&'static str),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Identity a worker reads from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub socket_path: String,
    pub worker_id: String,
    pub worker_index: u32,
    pub port: u16,
}

impl WorkerEnv {
    /// Read the worker contract variables.
    pub fn from_env() -> Result<Self, WorkerChannelError> {
        let socket_path = std::env::var(ENV_IPC_SOCKET)
            .map_err(|_| WorkerChannelError::MissingEnv(ENV_IPC_SOCKET))?;
        let worker_id = std::env::var(ENV_WORKER_ID)
            .map_err(|_| WorkerChannelError::MissingEnv(ENV_WORKER_ID))?;
        let worker_index = std::env::var(ENV_WORKER_INDEX)
            .map_err(|_| WorkerChannelError::MissingEnv(ENV_WORKER_INDEX))?
            .parse()
            .map_err(|_| WorkerChannelError::InvalidEnv(ENV_WORKER_INDEX))?;
        let port = std::env::var(ENV_PORT)
            .map_err(|_| WorkerChannelError::MissingEnv(ENV_PORT))?
            .parse()
            .map_err(|_| WorkerChannelError::InvalidEnv(ENV_PORT))?;

        Ok(Self {
            socket_path,
            worker_id,
            worker_index,
            port,
        })
    }
}

/// Connection from a worker to its supervisor.
pub struct WorkerChannel {
    worker_id: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl WorkerChannel {
    /// Connect using the variables the supervisor placed in the environment.
    pub async fn from_env() -> Result<Self, WorkerChannelError> {
        let env = WorkerEnv::from_env()?;
        Ok(Self::connect(&env.socket_path, &env.worker_id, env.worker_index).await?)
    }

    /// Connect to `socket_path` and send the hello frame.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        worker_id: &str,
        worker_index: u32,
    ) -> Result<Self, FrameError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        let hello = Hello {
            worker_id: worker_id.to_string(),
            worker_index,
            pid: std::process::id(),
        };
        write_frame(&mut writer, &Frame::hello(&hello)?).await?;

        Ok(Self {
            worker_id: worker_id.to_string(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Send a raw worker message.
    pub async fn send(&self, msg: &WorkerMessage) -> Result<(), FrameError> {
        let frame = Frame::worker(msg)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame).await
    }

    pub async fn online(&self) -> Result<(), FrameError> {
        self.send(&WorkerMessage::online()).await
    }

    pub async fn health(&self, report: HealthReport) -> Result<(), FrameError> {
        self.send(&WorkerMessage::health(report)).await
    }

    pub async fn request_served(&self) -> Result<(), FrameError> {
        self.send(&WorkerMessage::request_served()).await
    }

    pub async fn error(&self, error: impl Into<String>) -> Result<(), FrameError> {
        self.send(&WorkerMessage::error(error)).await
    }

    pub async fn drain_ready(&self) -> Result<(), FrameError> {
        self.send(&WorkerMessage::drain_ready()).await
    }

    /// Wait for the next supervisor message.
    ///
    /// Returns `FrameError::ConnectionClosed` once the supervisor hangs up.
    pub async fn recv(&self) -> Result<SupervisorMessage, FrameError> {
        let mut reader = self.reader.lock().await;
        let frame = read_frame(&mut *reader).await?;
        frame.decode_as(MessageType::Supervisor)
    }
}
