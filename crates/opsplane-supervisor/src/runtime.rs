// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable supervisor runtime.
//!
//! [`SupervisorRuntime`] wires the pool actor, autoscaler, control socket
//! and signal router together. The `opsplane` binary is a thin wrapper
//! around it; tests build it with a [`crate::launcher::MockLauncher`].
//!
//! ```rust,ignore
//! let runtime = SupervisorRuntime::builder()
//!     .pool_config(config.pool_config())
//!     .autoscale_config(config.autoscale_config())
//!     .launcher(launcher)
//!     .control_socket(&config.control_socket)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let reason = runtime.wait().await;
//! let report = runtime.shutdown().await;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use opsplane_core::migrate::ApplyOptions;
use opsplane_core::{Environment, EventBus, MigrationEngine};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::autoscale::{AutoscaleConfig, Autoscaler};
use crate::control::{ControlContext, ControlServer};
use crate::launcher::{IpcHub, Launcher};
use crate::pool::{PoolConfig, ShutdownReport, Supervisor, SupervisorHandle};
use crate::signals::SignalRouter;

/// Why [`SupervisorRuntime::wait`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Signal or control socket asked for shutdown.
    Requested,
    /// The pool hit a fatal condition.
    Fatal(String),
}

/// Builder for a [`SupervisorRuntime`].
pub struct SupervisorRuntimeBuilder {
    pool_config: PoolConfig,
    autoscale_config: Option<AutoscaleConfig>,
    launcher: Option<Arc<dyn Launcher>>,
    events: EventBus,
    environment: Environment,
    control_socket: Option<PathBuf>,
    ipc_hub: Option<Arc<IpcHub>>,
    migrations: Option<MigrationEngine>,
    handle_signals: bool,
}

impl Default for SupervisorRuntimeBuilder {
    fn default() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            autoscale_config: None,
            launcher: None,
            events: EventBus::default(),
            environment: Environment::default(),
            control_socket: None,
            ipc_hub: None,
            migrations: None,
            handle_signals: true,
        }
    }
}

impl SupervisorRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Enable the autoscaler.
    ///
    /// Default: disabled
    pub fn autoscale_config(mut self, config: AutoscaleConfig) -> Self {
        self.autoscale_config = Some(config);
        self
    }

    /// Set the worker launcher (required).
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Serve the operator control socket at `path`.
    ///
    /// Default: no control socket
    pub fn control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    /// IPC hub used by the launcher; closed on shutdown.
    pub fn ipc_hub(mut self, hub: Arc<IpcHub>) -> Self {
        self.ipc_hub = Some(hub);
        self
    }

    /// Apply pending migrations before the first worker is forked.
    pub fn migrations(mut self, engine: MigrationEngine) -> Self {
        self.migrations = Some(engine);
        self
    }

    /// Install process signal handlers.
    ///
    /// Default: `true`
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<SupervisorRuntimeConfig> {
        let launcher = self
            .launcher
            .ok_or_else(|| anyhow::anyhow!("launcher is required"))?;
        if self.pool_config.ports.is_empty() {
            anyhow::bail!("at least one port is required");
        }

        Ok(SupervisorRuntimeConfig {
            pool_config: self.pool_config,
            autoscale_config: self.autoscale_config,
            launcher,
            events: self.events,
            environment: self.environment,
            control_socket: self.control_socket,
            ipc_hub: self.ipc_hub,
            migrations: self.migrations,
            handle_signals: self.handle_signals,
        })
    }
}

/// Validated configuration for a [`SupervisorRuntime`].
pub struct SupervisorRuntimeConfig {
    pool_config: PoolConfig,
    autoscale_config: Option<AutoscaleConfig>,
    launcher: Arc<dyn Launcher>,
    events: EventBus,
    environment: Environment,
    control_socket: Option<PathBuf>,
    ipc_hub: Option<Arc<IpcHub>>,
    migrations: Option<MigrationEngine>,
    handle_signals: bool,
}

impl SupervisorRuntimeConfig {
    /// Run startup migrations, fork the initial workers and start the
    /// background tasks.
    pub async fn start(self) -> Result<SupervisorRuntime> {
        let logger = self.events.spawn_logger();

        if let Some(engine) = &self.migrations {
            run_startup_migrations(engine, self.pool_config.graceful_timeout).await?;
        }

        let (handle, supervisor_task) =
            Supervisor::spawn(self.pool_config, self.launcher, self.events.clone());
        let shutdown_requested = Arc::new(Notify::new());

        let autoscaler = self.autoscale_config.map(|config| {
            let autoscaler = Autoscaler::new(handle.clone(), config);
            let stop = autoscaler.shutdown_handle();
            (stop, tokio::spawn(autoscaler.run()))
        });

        let control = match self.control_socket {
            Some(path) => {
                let context = ControlContext {
                    handle: handle.clone(),
                    environment: self.environment,
                    shutdown: shutdown_requested.clone(),
                };
                Some(ControlServer::bind(path, context).await?)
            }
            None => None,
        };

        let signals = if self.handle_signals {
            let router = SignalRouter::new(handle.clone(), shutdown_requested.clone());
            let stop = router.shutdown_handle();
            let task = tokio::spawn(async move {
                if let Err(e) = router.run().await {
                    error!(error = %e, "Signal router failed");
                }
            });
            Some((stop, task))
        } else {
            None
        };

        info!(environment = %self.environment, "Supervisor runtime started");

        Ok(SupervisorRuntime {
            handle,
            supervisor_task,
            shutdown_requested,
            autoscaler,
            signals,
            control,
            ipc_hub: self.ipc_hub,
            logger,
        })
    }
}

/// A running supervisor.
pub struct SupervisorRuntime {
    handle: SupervisorHandle,
    supervisor_task: JoinHandle<()>,
    shutdown_requested: Arc<Notify>,
    autoscaler: Option<(Arc<Notify>, JoinHandle<()>)>,
    signals: Option<(Arc<Notify>, JoinHandle<()>)>,
    control: Option<ControlServer>,
    ipc_hub: Option<Arc<IpcHub>>,
    logger: JoinHandle<()>,
}

impl SupervisorRuntime {
    pub fn builder() -> SupervisorRuntimeBuilder {
        SupervisorRuntimeBuilder::new()
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Ask [`SupervisorRuntime::wait`] to return.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.notify_one();
    }

    /// Wait until shutdown is requested or the pool fails fatally.
    pub async fn wait(&self) -> StopReason {
        tokio::select! {
            _ = self.shutdown_requested.notified() => StopReason::Requested,
            reason = self.handle.fatal() => StopReason::Fatal(reason),
        }
    }

    /// Stop the background tasks and shut the pool down.
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Shutting down supervisor runtime");

        if let Some((stop, task)) = self.autoscaler {
            stop.notify_one();
            let _ = task.await;
        }
        if let Some((stop, task)) = self.signals {
            stop.notify_one();
            let _ = task.await;
        }

        let report = self.handle.shutdown().await;

        if let Some(control) = &self.control {
            control.close().await;
        }
        if let Some(hub) = &self.ipc_hub {
            hub.close().await;
        }
        if let Err(e) = self.supervisor_task.await {
            warn!(error = %e, "Supervisor task ended abnormally");
        }
        self.logger.abort();

        info!(
            workers = report.workers,
            graceful = report.graceful,
            forced = report.forced,
            "Supervisor runtime stopped"
        );
        report
    }
}

/// Apply pending migrations. A shutdown signal during the batch lets the
/// running unit finish for up to `graceful_timeout` and then aborts startup.
async fn run_startup_migrations(engine: &MigrationEngine, graceful_timeout: Duration) -> Result<()> {
    info!(directory = %engine.config().directory.display(), "Applying migrations before start");

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let apply = engine.apply(ApplyOptions::default());
    tokio::pin!(apply);

    let report = tokio::select! {
        report = &mut apply => report?,
        _ = async { tokio::select! { _ = int.recv() => {}, _ = term.recv() => {} } } => {
            warn!(
                timeout_ms = graceful_timeout.as_millis() as u64,
                "Shutdown requested during startup migrations, waiting for the batch"
            );
            match tokio::time::timeout(graceful_timeout, &mut apply).await {
                Ok(Ok(report)) => info!(applied = report.applied.len(), "Startup migrations finished"),
                Ok(Err(e)) => warn!(error = %e, "Startup migrations failed"),
                Err(_) => warn!("Startup migrations did not finish in time"),
            }
            anyhow::bail!("shutdown requested during startup migrations");
        }
    };

    if !report.is_success() {
        let names: Vec<&str> = report.failed.iter().map(|f| f.name.as_str()).collect();
        anyhow::bail!("startup migrations failed: {}", names.join(", "));
    }
    info!(applied = report.applied.len(), "Startup migrations applied");
    Ok(())
}
