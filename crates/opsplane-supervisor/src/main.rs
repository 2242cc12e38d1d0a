// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opsplane - worker supervisor daemon
//!
//! Runs the configured worker program as a pool of processes behind
//! `OPSPLANE_PORTS`:
//! - optional migrations before the first worker starts
//! - autoscaling, crash restarts and health scanning
//! - zero-downtime reload on SIGHUP or `opsplane-ctl reload`
//! - graceful shutdown on SIGINT/SIGTERM

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};

use opsplane_core::{EventBus, LockRegistry, MigrationEngine, connect, redact_url};
use opsplane_supervisor::config::Config;
use opsplane_supervisor::launcher::{IpcHub, Launcher, ProcessLauncher};
use opsplane_supervisor::logging;
use opsplane_supervisor::runtime::{StopReason, SupervisorRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = Config::from_env()?;
    logging::init(config.log_format, "opsplane_supervisor=info,opsplane_core=info");
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let worker_command = config.require_worker_command()?.to_string();

    info!(
        environment = %config.environment,
        worker_command = %worker_command,
        ports = ?config.ports,
        workers = config.workers,
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        "Starting Opsplane supervisor"
    );

    let events = EventBus::default();

    let migrations = if config.migrate_on_start {
        let database_url = config.require_database_url()?;
        let store = connect(database_url).await?;
        info!(database = %redact_url(database_url), "Connected to control store");
        let locks = LockRegistry::new(store.clone(), events.clone())
            .with_stale_after(config.lock_stale_after);
        Some(MigrationEngine::new(
            store,
            locks,
            events.clone(),
            config.migration_config(),
        ))
    } else {
        None
    };

    let hub = IpcHub::bind(&config.ipc_socket).await?;
    let launcher = Arc::new(ProcessLauncher::new(
        worker_command,
        config.worker_args.clone(),
        hub.clone(),
    ));
    info!(launcher_type = launcher.launcher_type(), ipc_socket = %config.ipc_socket.display(), "Launcher initialized");

    let mut builder = SupervisorRuntime::builder()
        .pool_config(config.pool_config())
        .autoscale_config(config.autoscale_config())
        .launcher(launcher)
        .events(events)
        .environment(config.environment)
        .control_socket(&config.control_socket)
        .ipc_hub(hub);
    if let Some(engine) = migrations {
        builder = builder.migrations(engine);
    }

    let runtime = builder.build()?.start().await?;
    info!(control_socket = %config.control_socket.display(), "Supervisor ready");

    let reason = runtime.wait().await;
    if let StopReason::Fatal(ref message) = reason {
        error!(reason = %message, "Supervisor hit a fatal condition");
    } else {
        info!("Shutdown requested");
    }

    runtime.shutdown().await;
    info!("Opsplane supervisor shut down");

    Ok(match reason {
        StopReason::Requested => ExitCode::SUCCESS,
        StopReason::Fatal(_) => ExitCode::FAILURE,
    })
}
