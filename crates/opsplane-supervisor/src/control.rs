// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator control socket.
//!
//! A Unix socket speaking framed [`ControlRequest`]/[`ControlResponse`]
//! pairs. One request per round trip; a connection may carry several.
//! Response bodies are JSON documents. A reload request is answered once
//! the reload has finished.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use opsplane_core::Environment;
use opsplane_protocol::messages::control_request;
use opsplane_protocol::{ControlRequest, ControlResponse, Frame, FrameError, FramedStream, MessageType};
use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::SupervisorHandle;

/// State shared by every control connection.
#[derive(Clone)]
pub struct ControlContext {
    pub handle: SupervisorHandle,
    pub environment: Environment,
    /// Notified when an operator asks for shutdown.
    pub shutdown: Arc<Notify>,
}

/// Listening control socket.
pub struct ControlServer {
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale socket file.
    pub async fn bind(path: impl Into<PathBuf>, context: ControlContext) -> std::io::Result<Self> {
        let path = path.into();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Control socket listening");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(stream, context.clone()));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept control connection"),
                }
            }
        });

        Ok(Self { path, accept_task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file.
    pub async fn close(&self) {
        self.accept_task.abort();
        if let Err(e) = tokio::fs::remove_file(&self.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(stream: UnixStream, context: ControlContext) {
    let mut framed = FramedStream::new(stream);
    loop {
        let frame = match framed.read_frame().await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return,
            Err(e) => {
                warn!(error = %e, "Control socket read failed");
                return;
            }
        };

        let response = match frame.decode_as::<ControlRequest>(MessageType::ControlRequest) {
            Ok(request) => dispatch(request, &context).await,
            Err(e) => ControlResponse::failure(format!("invalid request: {e}")),
        };

        let written = match Frame::control_response(&response) {
            Ok(frame) => framed.write_frame(&frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(error = %e, "Control response not delivered");
            return;
        }
    }
}

async fn dispatch(request: ControlRequest, context: &ControlContext) -> ControlResponse {
    match request.kind {
        Some(control_request::Kind::Status(_)) => match context.handle.status().await {
            Ok(pool) => {
                let body = json!({
                    "pid": std::process::id(),
                    "environment": context.environment,
                    "pool": pool,
                });
                ControlResponse::success(body.to_string())
            }
            Err(e) => ControlResponse::failure(e.to_string()),
        },
        Some(control_request::Kind::Reload(_)) => {
            info!("Reload requested over control socket");
            match context.handle.reload().await {
                Ok(report) => ControlResponse::success(json!({ "reload": report }).to_string()),
                Err(e) => {
                    warn!(error = %e, "Reload request rejected");
                    ControlResponse::failure(e.to_string())
                }
            }
        }
        Some(control_request::Kind::Shutdown(_)) => {
            info!("Shutdown requested over control socket");
            context.shutdown.notify_one();
            ControlResponse::success(json!({ "accepted": "shutdown" }).to_string())
        }
        None => ControlResponse::failure("unknown control request"),
    }
}

/// Send one request to a control socket and wait for the answer.
pub async fn request(path: &Path, request: &ControlRequest) -> Result<ControlResponse, FrameError> {
    let stream = UnixStream::connect(path).await?;
    FramedStream::new(stream).control(request).await
}
