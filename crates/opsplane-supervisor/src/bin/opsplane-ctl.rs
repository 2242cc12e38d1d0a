// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! opsplane-ctl - operator CLI
//!
//! Every command prints one JSON document on stdout. Exit codes:
//! `0` success, `1` the action ran and failed, `2` the action could not
//! start (missing configuration, lock held, supervisor not reachable).

use std::fmt::Display;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use opsplane_core::migrate::{ApplyOptions, RollbackSelector};
use opsplane_core::{Classify, ErrorKind, EventBus, LockRegistry, MigrationEngine, connect};
use opsplane_protocol::{ControlRequest, ControlResponse};
use opsplane_supervisor::config::Config;
use opsplane_supervisor::control;
use opsplane_supervisor::logging;
use opsplane_supervisor::recovery::probes::{CacheProbe, ChainRpcProbe, HttpProbe, StoreProbe};
use opsplane_supervisor::recovery::steps::ReloadTarget;
use opsplane_supervisor::recovery::{
    LogSink, ProbeSet, RecoveryOrchestrator, RunState, ScenarioCatalog, StepRegistry, WebhookSink,
};

#[derive(Parser)]
#[command(name = "opsplane-ctl")]
#[command(about = "Operate migrations, workers and recovery", long_about = None, version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Migration state and the running supervisor, if reachable
    Status,
    /// Apply pending migrations
    Migrate {
        /// Report what would run without touching the database
        #[arg(long)]
        dry_run: bool,
        /// Apply units up to and including this name
        #[arg(long)]
        target: Option<String>,
    },
    /// Revert completed migrations
    Rollback {
        /// Number of most recent units to revert
        #[arg(long, conflicts_with = "target", required_unless_present = "target")]
        steps: Option<usize>,
        /// Revert every unit applied after this one
        #[arg(long)]
        target: Option<String>,
    },
    /// Compare recorded checksums against the migration files
    Validate,
    /// Replace every worker without downtime
    Reload {
        /// Send SIGHUP to this supervisor pid instead of using the control socket
        #[arg(long)]
        pid: Option<i32>,
    },
    /// Ask the supervisor to shut down gracefully
    Shutdown,
    /// Disaster recovery
    Recover {
        #[command(subcommand)]
        command: RecoverCommand,
    },
}

#[derive(Subcommand)]
enum RecoverCommand {
    /// Probe every collaborator and name the matching scenario
    Detect,
    /// List the configured scenarios
    List,
    /// Run a scenario
    Start {
        /// Scenario id, e.g. database_failure
        scenario: String,
    },
    /// Show a recorded run
    Show {
        run_id: String,
    },
}

/// A command that did not succeed, with the kind deciding the exit code.
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl<E: Classify + Display> From<E> for Failure {
    fn from(e: E) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

type CommandResult = Result<ExitCode, Failure>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let dotenv = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => return report_failure(Failure::from(e)),
    };
    logging::init(config.log_format, "opsplane_supervisor=info,opsplane_core=info");
    if let Err(e) = dotenv {
        debug!("No .env file loaded: {}", e);
    }

    let events = EventBus::default();
    let logger = events.spawn_logger();

    let result = match cli.command {
        Command::Status => status(&config, &events).await,
        Command::Migrate { dry_run, target } => migrate(&config, &events, dry_run, target).await,
        Command::Rollback { steps, target } => {
            let selector = match (steps, target) {
                (_, Some(target)) => RollbackSelector::Target(target),
                (Some(steps), None) => RollbackSelector::Steps(steps),
                (None, None) => RollbackSelector::Steps(1),
            };
            rollback(&config, &events, selector).await
        }
        Command::Validate => validate(&config, &events).await,
        Command::Reload { pid } => reload(&config, pid).await,
        Command::Shutdown => shutdown(&config).await,
        Command::Recover { command } => recover(&config, &events, command).await,
    };

    // Let the logger drain events emitted by the command.
    tokio::task::yield_now().await;
    logger.abort();

    match result {
        Ok(code) => code,
        Err(failure) => report_failure(failure),
    }
}

fn report_failure(failure: Failure) -> ExitCode {
    let document = json!({
        "ok": false,
        "kind": failure.kind,
        "error": failure.message,
    });
    println!("{document}");
    ExitCode::from(failure.kind.exit_code())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Failure> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| Failure::new(ErrorKind::Internal, format!("cannot encode output: {e}")))?;
    println!("{rendered}");
    Ok(())
}

fn exit_for(success: bool, kind: ErrorKind) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(kind.exit_code())
    }
}

async fn engine(config: &Config, events: &EventBus) -> Result<MigrationEngine, Failure> {
    let store = connect(config.require_database_url()?).await?;
    let locks =
        LockRegistry::new(store.clone(), events.clone()).with_stale_after(config.lock_stale_after);
    Ok(MigrationEngine::new(
        store,
        locks,
        events.clone(),
        config.migration_config(),
    ))
}

async fn control_request(path: &Path, request: &ControlRequest) -> Result<ControlResponse, Failure> {
    control::request(path, request).await.map_err(|e| {
        Failure::new(
            ErrorKind::Precondition,
            format!("supervisor not reachable at {}: {e}", path.display()),
        )
    })
}

fn decode_body(response: &ControlResponse) -> Value {
    serde_json::from_str(&response.body).unwrap_or(Value::Null)
}

async fn status(config: &Config, events: &EventBus) -> CommandResult {
    let migrations = match config.database_url {
        Some(_) => Some(engine(config, events).await?.status().await?),
        None => None,
    };

    let supervisor = match control::request(&config.control_socket, &ControlRequest::status()).await
    {
        Ok(response) if response.ok => decode_body(&response),
        Ok(response) => {
            warn!(error = ?response.error, "Supervisor refused status request");
            Value::Null
        }
        Err(e) => {
            debug!(error = %e, "Supervisor not reachable");
            Value::Null
        }
    };

    print_json(&json!({
        "environment": config.environment,
        "migrations": migrations,
        "supervisor": supervisor,
    }))?;
    Ok(ExitCode::SUCCESS)
}

async fn migrate(
    config: &Config,
    events: &EventBus,
    dry_run: bool,
    target: Option<String>,
) -> CommandResult {
    let report = engine(config, events)
        .await?
        .apply(ApplyOptions { target, dry_run })
        .await?;
    print_json(&report)?;
    Ok(exit_for(report.is_success(), ErrorKind::StepFault))
}

async fn rollback(config: &Config, events: &EventBus, selector: RollbackSelector) -> CommandResult {
    let report = engine(config, events).await?.rollback(selector).await?;
    print_json(&report)?;
    Ok(exit_for(report.is_success(), ErrorKind::StepFault))
}

async fn validate(config: &Config, events: &EventBus) -> CommandResult {
    let report = engine(config, events).await?.verify().await?;
    print_json(&report)?;
    if !report.is_clean() && !config.environment.is_production() {
        warn!(
            findings = report.findings.len(),
            "Migration history disagrees with files on disk"
        );
    }
    Ok(exit_for(
        report.is_clean() || !config.environment.is_production(),
        ErrorKind::Integrity,
    ))
}

async fn reload(config: &Config, pid: Option<i32>) -> CommandResult {
    if let Some(pid) = pid {
        kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| {
            Failure::new(ErrorKind::Precondition, format!("cannot signal pid {pid}: {e}"))
        })?;
        print_json(&json!({ "ok": true, "signaled": pid, "signal": "SIGHUP" }))?;
        return Ok(ExitCode::SUCCESS);
    }

    let response = control_request(&config.control_socket, &ControlRequest::reload()).await?;
    if !response.ok {
        return Err(Failure::new(
            ErrorKind::Precondition,
            response.error.unwrap_or_else(|| "reload refused".into()),
        ));
    }
    let body = decode_body(&response);
    let not_online = body["reload"]["not_online"]
        .as_array()
        .map_or(0, Vec::len);
    print_json(&body)?;
    Ok(exit_for(not_online == 0, ErrorKind::WorkerFault))
}

async fn shutdown(config: &Config) -> CommandResult {
    let response = control_request(&config.control_socket, &ControlRequest::shutdown()).await?;
    if !response.ok {
        return Err(Failure::new(
            ErrorKind::Internal,
            response.error.unwrap_or_else(|| "shutdown refused".into()),
        ));
    }
    print_json(&decode_body(&response))?;
    Ok(ExitCode::SUCCESS)
}

fn scenario_catalog(config: &Config) -> ScenarioCatalog {
    ScenarioCatalog::builtin().with_overrides(&config.recovery_scenarios)
}

async fn orchestrator(config: &Config, events: &EventBus) -> Result<RecoveryOrchestrator, Failure> {
    let store = connect(config.require_database_url()?).await?;
    let locks =
        LockRegistry::new(store.clone(), events.clone()).with_stale_after(config.lock_stale_after);

    let client = reqwest::Client::builder()
        .timeout(config.probe_timeout)
        .build()
        .map_err(|e| Failure::new(ErrorKind::Internal, format!("http client: {e}")))?;

    let mut probes =
        ProbeSet::new(config.probe_timeout).with_probe(Arc::new(StoreProbe::new(store.clone())));
    if let Some(url) = &config.cache_url {
        probes = probes.with_probe(Arc::new(CacheProbe::new(url)?));
    }
    if let Some(url) = &config.app_health_url {
        probes = probes.with_probe(Arc::new(HttpProbe::new(client.clone(), url.clone())));
    }
    if let Some(url) = &config.chain_rpc_url {
        probes = probes.with_probe(Arc::new(ChainRpcProbe::new(client, url.clone())));
    }
    let probes = Arc::new(probes);

    let steps = StepRegistry::new()
        .with_builtins(
            probes.clone(),
            config.maintenance_flag.clone(),
            ReloadTarget::ControlSocket(config.control_socket.clone()),
        )
        .with_commands(&config.recovery_steps);

    let mut builder = RecoveryOrchestrator::builder()
        .store(store)
        .locks(locks)
        .events(events.clone())
        .catalog(scenario_catalog(config))
        .steps(steps)
        .probes(probes)
        .actor(&config.actor)
        .step_timeout(config.step_timeout)
        .sink(Arc::new(LogSink));
    if let Some(url) = &config.alert_webhook_url {
        let sink = WebhookSink::new(url.clone(), config.probe_timeout)
            .map_err(|e| Failure::new(ErrorKind::Internal, e.to_string()))?;
        builder = builder.sink(Arc::new(sink));
    }
    Ok(builder.build()?)
}

async fn recover(config: &Config, events: &EventBus, command: RecoverCommand) -> CommandResult {
    match command {
        RecoverCommand::List => {
            let catalog = scenario_catalog(config);
            let scenarios: Vec<_> = catalog.iter().collect();
            print_json(&scenarios)?;
            Ok(ExitCode::SUCCESS)
        }
        RecoverCommand::Detect => {
            let detection = orchestrator(config, events).await?.detect().await;
            print_json(&detection)?;
            Ok(ExitCode::SUCCESS)
        }
        RecoverCommand::Start { scenario } => {
            let run = orchestrator(config, events).await?.start(&scenario).await?;
            print_json(&run)?;
            Ok(exit_for(run.state == RunState::Completed, ErrorKind::StepFault))
        }
        RecoverCommand::Show { run_id } => {
            match orchestrator(config, events).await?.get_run(&run_id).await? {
                Some(run) => {
                    print_json(&run)?;
                    Ok(ExitCode::SUCCESS)
                }
                None => Err(Failure::new(
                    ErrorKind::Precondition,
                    format!("no recovery run {run_id}"),
                )),
            }
        }
    }
}
