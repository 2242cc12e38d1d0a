// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery step registry and built-in steps.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opsplane_protocol::ControlRequest;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use super::probes::ProbeSet;
use crate::control;
use crate::pool::SupervisorHandle;
use crate::reload::ReloadReport;

/// Bytes of command stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),
}

/// One named operation of a recovery scenario.
#[async_trait]
pub trait RecoveryStep: Send + Sync {
    async fn run(&self) -> Result<(), StepError>;
}

/// Adapter for closures returning a future.
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F, Fut> RecoveryStep for FnStep<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepError>> + Send,
{
    async fn run(&self) -> Result<(), StepError> {
        (self.0)().await
    }
}

/// Steps by name.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn RecoveryStep>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `step` under `name`, replacing any earlier registration.
    pub fn register(&mut self, name: impl Into<String>, step: Arc<dyn RecoveryStep>) -> &mut Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnStep(f)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RecoveryStep>> {
        self.steps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register `probe`, `verify`, `enable_maintenance`,
    /// `disable_maintenance` and `reload_workers`.
    pub fn with_builtins(
        mut self,
        probes: Arc<ProbeSet>,
        maintenance_flag: PathBuf,
        reload: ReloadTarget,
    ) -> Self {
        self.register(
            "probe",
            Arc::new(ProbeStep {
                probes: probes.clone(),
                require_healthy: false,
            }),
        );
        self.register(
            "verify",
            Arc::new(ProbeStep {
                probes,
                require_healthy: true,
            }),
        );
        self.register(
            "enable_maintenance",
            Arc::new(MaintenanceStep {
                path: maintenance_flag.clone(),
                enable: true,
            }),
        );
        self.register(
            "disable_maintenance",
            Arc::new(MaintenanceStep {
                path: maintenance_flag,
                enable: false,
            }),
        );
        self.register("reload_workers", Arc::new(ReloadWorkersStep { target: reload }));
        self
    }

    /// Register one shell command step per entry.
    pub fn with_commands(mut self, commands: &BTreeMap<String, String>) -> Self {
        for (name, command) in commands {
            self.register(
                name.clone(),
                Arc::new(CommandStep {
                    command: command.clone(),
                }),
            );
        }
        self
    }
}

/// Runs every probe. With `require_healthy` any unhealthy component fails
/// the step; otherwise the snapshot is only logged.
pub struct ProbeStep {
    probes: Arc<ProbeSet>,
    require_healthy: bool,
}

#[async_trait]
impl RecoveryStep for ProbeStep {
    async fn run(&self) -> Result<(), StepError> {
        if self.probes.is_empty() {
            return Err(StepError::Failed("no probes configured".into()));
        }
        let results = self.probes.run_all().await;
        let unhealthy: Vec<&str> = results
            .iter()
            .filter(|r| !r.healthy)
            .map(|r| r.component.as_str())
            .collect();
        info!(
            probed = results.len(),
            unhealthy = ?unhealthy,
            "Probe snapshot"
        );
        if self.require_healthy && !unhealthy.is_empty() {
            return Err(StepError::Failed(format!(
                "unhealthy components: {}",
                unhealthy.join(", ")
            )));
        }
        Ok(())
    }
}

/// Creates or removes the maintenance flag file.
pub struct MaintenanceStep {
    path: PathBuf,
    enable: bool,
}

#[async_trait]
impl RecoveryStep for MaintenanceStep {
    async fn run(&self) -> Result<(), StepError> {
        if self.enable {
            tokio::fs::write(&self.path, Utc::now().to_rfc3339())
                .await
                .map_err(|e| {
                    StepError::Failed(format!("cannot write {}: {e}", self.path.display()))
                })?;
            info!(path = %self.path.display(), "Maintenance mode enabled");
        } else {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => info!(path = %self.path.display(), "Maintenance mode disabled"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StepError::Failed(format!(
                        "cannot remove {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where `reload_workers` sends its reload.
#[derive(Clone)]
pub enum ReloadTarget {
    /// The supervisor running in this process.
    Handle(SupervisorHandle),
    /// A supervisor reachable on its control socket.
    ControlSocket(PathBuf),
}

pub struct ReloadWorkersStep {
    target: ReloadTarget,
}

#[derive(Deserialize)]
struct ReloadBody {
    reload: ReloadReport,
}

#[async_trait]
impl RecoveryStep for ReloadWorkersStep {
    async fn run(&self) -> Result<(), StepError> {
        let report = match &self.target {
            ReloadTarget::Handle(handle) => handle
                .reload()
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?,
            ReloadTarget::ControlSocket(path) => {
                let response = control::request(path, &ControlRequest::reload())
                    .await
                    .map_err(|e| {
                        StepError::Failed(format!("control socket {}: {e}", path.display()))
                    })?;
                if !response.ok {
                    return Err(StepError::Failed(
                        response.error.unwrap_or_else(|| "reload refused".into()),
                    ));
                }
                serde_json::from_str::<ReloadBody>(&response.body)
                    .map_err(|e| StepError::Failed(format!("unexpected reload answer: {e}")))?
                    .reload
            }
        };
        if !report.not_online.is_empty() {
            return Err(StepError::Failed(format!(
                "{} replacement workers did not come online",
                report.not_online.len()
            )));
        }
        Ok(())
    }
}

/// `sh -c <command>`; success means exit status 0.
pub struct CommandStep {
    command: String,
}

impl CommandStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl RecoveryStep for CommandStep {
    async fn run(&self) -> Result<(), StepError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StepError::Failed(format!("cannot run command: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr.get(start..).unwrap_or_default().trim();
        warn!(status = %output.status, stderr = tail, "Recovery command failed");
        Err(StepError::Failed(format!("{}: {}", output.status, tail)))
    }
}
