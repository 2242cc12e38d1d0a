// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS process launcher.
//!
//! Workers are spawned with `tokio::process` and connect back to a single
//! Unix socket owned by the [`IpcHub`]. The first frame on every
//! connection is a `Hello` naming the spawn id the worker was given in
//! `OPSPLANE_WORKER_ID`; the hub uses it to route the connection to the
//! right worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use opsplane_protocol::frame::{Frame, MessageType, read_frame, write_frame};
use opsplane_protocol::worker::{
    ENV_CLUSTER_MODE, ENV_IPC_SOCKET, ENV_PORT, ENV_WORKER_ID, ENV_WORKER_INDEX,
};
use opsplane_protocol::{FrameError, Hello, SupervisorMessage, WorkerMessage};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{
    EventSender, ExitStatus, LaunchError, LaunchSpec, Launcher, Result, WorkerControl,
    WorkerEvent,
};

/// Write side of one worker connection, filled in once the worker says hello.
#[derive(Default)]
pub struct IpcLink {
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl IpcLink {
    async fn send(&self, worker_id: &str, frame: &Frame) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| LaunchError::NotConnected(worker_id.to_string()))?;
        write_frame(writer, frame).await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }
}

struct Registration {
    events: EventSender,
    link: Arc<IpcLink>,
}

/// Accepts worker IPC connections and routes them by spawn id.
pub struct IpcHub {
    path: PathBuf,
    registry: Arc<Mutex<HashMap<String, Registration>>>,
    accept_task: JoinHandle<()>,
}

impl IpcHub {
    /// Bind the IPC socket, replacing a stale socket file if one exists.
    pub async fn bind(path: impl Into<PathBuf>) -> std::io::Result<Arc<Self>> {
        let path = path.into();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed stale IPC socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        let registry: Arc<Mutex<HashMap<String, Registration>>> = Arc::default();

        let accept_task = tokio::spawn(accept_loop(listener, registry.clone()));
        info!(path = %path.display(), "Worker IPC socket listening");

        Ok(Arc::new(Self {
            path,
            registry,
            accept_task,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expect a connection from `worker_id`.
    pub async fn register(&self, worker_id: &str, events: EventSender) -> Arc<IpcLink> {
        let link = Arc::new(IpcLink::default());
        self.registry.lock().await.insert(
            worker_id.to_string(),
            Registration {
                events,
                link: link.clone(),
            },
        );
        link
    }

    pub async fn unregister(&self, worker_id: &str) {
        self.registry.lock().await.remove(worker_id);
    }

    /// Stop accepting connections and remove the socket file.
    pub async fn close(&self) {
        self.accept_task.abort();
        if let Err(e) = tokio::fs::remove_file(&self.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove IPC socket");
        }
    }
}

impl Drop for IpcHub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: UnixListener, registry: Arc<Mutex<HashMap<String, Registration>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream, registry.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept worker IPC connection");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, registry: Arc<Mutex<HashMap<String, Registration>>>) {
    let (mut reader, writer) = stream.into_split();

    let hello: Hello = match read_frame(&mut reader).await {
        Ok(frame) => match frame.decode_as(MessageType::Hello) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(error = %e, "Worker connection did not start with hello");
                return;
            }
        },
        Err(e) => {
            debug!(error = %e, "Worker connection closed before hello");
            return;
        }
    };

    let worker_id = hello.worker_id.clone();
    let (events, link) = {
        let registry = registry.lock().await;
        match registry.get(&worker_id) {
            Some(reg) => (reg.events.clone(), reg.link.clone()),
            None => {
                warn!(worker_id = %worker_id, pid = hello.pid, "Hello from unknown worker, dropping connection");
                return;
            }
        }
    };

    *link.writer.lock().await = Some(writer);
    let _ = events
        .send(WorkerEvent::Connected {
            worker_id: worker_id.clone(),
            pid: hello.pid,
        })
        .await;

    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => match frame.decode_as::<WorkerMessage>(MessageType::Worker) {
                Ok(message) => {
                    let event = WorkerEvent::Message {
                        worker_id: worker_id.clone(),
                        message,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Ignoring undecodable worker frame");
                }
            },
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Worker IPC read failed");
                break;
            }
        }
    }

    *link.writer.lock().await = None;
    let _ = events
        .send(WorkerEvent::Disconnected {
            worker_id: worker_id.clone(),
        })
        .await;
}

/// Launches workers as child processes.
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    hub: Arc<IpcHub>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>, hub: Arc<IpcHub>) -> Self {
        Self {
            program: program.into(),
            args,
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<IpcHub> {
        &self.hub
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        events: EventSender,
    ) -> Result<Arc<dyn WorkerControl>> {
        let link = self.hub.register(&spec.worker_id, events.clone()).await;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_WORKER_INDEX, spec.index.to_string())
            .env(ENV_PORT, spec.port.to_string())
            .env(ENV_CLUSTER_MODE, "true")
            .env(ENV_WORKER_ID, &spec.worker_id)
            .env(ENV_IPC_SOCKET, self.hub.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.hub.unregister(&spec.worker_id).await;
                return Err(LaunchError::StartFailed(format!("{}: {}", self.program, e)));
            }
        };

        let pid = child.id();
        debug!(worker_id = %spec.worker_id, index = spec.index, port = spec.port, pid = ?pid, "Worker process spawned");

        let hub = self.hub.clone();
        let worker_id = spec.worker_id.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Failed to reap worker process");
                    ExitStatus::default()
                }
            };
            hub.unregister(&worker_id).await;
            let _ = events.send(WorkerEvent::Exited { worker_id, status }).await;
        });

        Ok(Arc::new(ProcessControl {
            worker_id: spec.worker_id.clone(),
            pid,
            link,
        }))
    }
}

struct ProcessControl {
    worker_id: String,
    pid: Option<u32>,
    link: Arc<IpcLink>,
}

#[async_trait]
impl WorkerControl for ProcessControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn send(&self, message: SupervisorMessage) -> Result<()> {
        let frame = Frame::supervisor(&message)?;
        self.link.send(&self.worker_id, &frame).await
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        let pid = self
            .pid
            .and_then(|p| i32::try_from(p).ok())
            .ok_or_else(|| LaunchError::Exited(self.worker_id.clone()))?;
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(LaunchError::Exited(self.worker_id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsplane_protocol::WorkerChannel;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_hub_routes_messages_by_worker_id() {
        let dir = tempfile::tempdir().unwrap();
        let hub = IpcHub::bind(dir.path().join("ipc.sock")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let link = hub.register("w-7", tx).await;

        let channel = WorkerChannel::connect(hub.path(), "w-7", 7).await.unwrap();
        channel.online().await.unwrap();

        let connected = rx.recv().await.unwrap();
        assert!(matches!(connected, WorkerEvent::Connected { ref worker_id, .. } if worker_id == "w-7"));
        let online = rx.recv().await.unwrap();
        match online {
            WorkerEvent::Message { worker_id, message } => {
                assert_eq!(worker_id, "w-7");
                assert_eq!(message.type_name(), "online");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(link.is_connected().await);
        let frame = Frame::supervisor(&SupervisorMessage::drain()).unwrap();
        link.send("w-7", &frame).await.unwrap();
        let msg = channel.recv().await.unwrap();
        assert!(msg.is_drain());

        drop(channel);
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(closed, WorkerEvent::Disconnected { .. }));
        assert!(!link.is_connected().await);

        hub.close().await;
        assert!(!dir.path().join("ipc.sock").exists());
    }

    #[tokio::test]
    async fn test_send_before_hello_is_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = IpcHub::bind(dir.path().join("ipc.sock")).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let link = hub.register("w-1", tx).await;

        let frame = Frame::supervisor(&SupervisorMessage::drain()).unwrap();
        let err = link.send("w-1", &frame).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_process_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let hub = IpcHub::bind(dir.path().join("ipc.sock")).await.unwrap();
        let launcher = ProcessLauncher::new("sh", vec!["-c".into(), "exit 3".into()], hub);
        let (tx, mut rx) = mpsc::channel(4);

        let spec = LaunchSpec {
            worker_id: "w-exit".into(),
            index: 0,
            port: 3000,
        };
        let control = launcher.launch(&spec, tx).await.unwrap();
        assert!(control.pid().is_some());

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            WorkerEvent::Exited {
                worker_id: "w-exit".into(),
                status: ExitStatus::code(3),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let hub = IpcHub::bind(dir.path().join("ipc.sock")).await.unwrap();
        let launcher = ProcessLauncher::new("/nonexistent/opsplane-worker", Vec::new(), hub);
        let (tx, _rx) = mpsc::channel(4);
        let spec = LaunchSpec {
            worker_id: "w-missing".into(),
            index: 0,
            port: 3000,
        };
        let result = launcher.launch(&spec, tx).await;
        assert!(matches!(result, Err(LaunchError::StartFailed(_))));
    }
}
