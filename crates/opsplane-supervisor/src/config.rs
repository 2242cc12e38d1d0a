// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the opsplane supervisor and operator CLI.
//!
//! The configuration record is built once in `main` and passed down. No
//! other module reads the process environment.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use opsplane_core::migrate::{FailurePolicy, MigrationConfig};
use opsplane_core::redact_url;
use opsplane_core::{Classify, Environment, ErrorKind, Holder};

use crate::autoscale::AutoscaleConfig;
use crate::pool::PoolConfig;

const PREFIX: &str = "OPSPLANE_";
const STEP_PREFIX: &str = "OPSPLANE_RECOVERY_STEP_";
const SCENARIO_PREFIX: &str = "OPSPLANE_RECOVERY_SCENARIO_";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Supervisor configuration loaded from `OPSPLANE_*` environment variables.
#[derive(Clone)]
pub struct Config {
    /// Control store URL. Required for migrations, recovery and locks.
    pub database_url: Option<String>,
    pub environment: Environment,
    /// Program started for every worker. Required by the daemon.
    pub worker_command: Option<String>,
    pub worker_args: Vec<String>,
    pub ports: Vec<u16>,
    pub workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub restart_delay: Duration,
    pub health_interval: Duration,
    pub scale_interval: Duration,
    /// Average CPU percent above which the pool grows.
    pub cpu_threshold: f64,
    /// Average response time in milliseconds above which the pool grows.
    pub response_time_threshold_ms: f64,
    pub stagger_interval: Duration,
    pub warmup_interval: Duration,
    pub graceful_timeout: Duration,
    /// Attempts allowed for a worker that keeps dying before coming online.
    pub start_retry_limit: u32,
    pub ipc_socket: PathBuf,
    pub control_socket: PathBuf,
    pub migrations_dir: PathBuf,
    pub migrate_on_start: bool,
    pub failure_policy: FailurePolicy,
    pub actor: String,
    pub commit_ref: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub app_health_url: Option<String>,
    pub cache_url: Option<String>,
    pub chain_rpc_url: Option<String>,
    pub probe_timeout: Duration,
    pub maintenance_flag: PathBuf,
    pub lock_stale_after: Duration,
    /// Shell command per command-backed recovery step, keyed by step name.
    pub recovery_steps: BTreeMap<String, String>,
    /// Step list overrides per scenario id.
    pub recovery_scenarios: BTreeMap<String, Vec<String>>,
    pub step_timeout: Duration,
    pub log_format: LogFormat,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url.as_deref().map(redact_url))
            .field("environment", &self.environment)
            .field("worker_command", &self.worker_command)
            .field("worker_args", &self.worker_args)
            .field("ports", &self.ports)
            .field("workers", &self.workers)
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("restart_delay", &self.restart_delay)
            .field("health_interval", &self.health_interval)
            .field("scale_interval", &self.scale_interval)
            .field("cpu_threshold", &self.cpu_threshold)
            .field("response_time_threshold_ms", &self.response_time_threshold_ms)
            .field("stagger_interval", &self.stagger_interval)
            .field("warmup_interval", &self.warmup_interval)
            .field("graceful_timeout", &self.graceful_timeout)
            .field("start_retry_limit", &self.start_retry_limit)
            .field("ipc_socket", &self.ipc_socket)
            .field("control_socket", &self.control_socket)
            .field("migrations_dir", &self.migrations_dir)
            .field("migrate_on_start", &self.migrate_on_start)
            .field("failure_policy", &self.failure_policy)
            .field("actor", &self.actor)
            .field("commit_ref", &self.commit_ref)
            .field(
                "alert_webhook_url",
                &self.alert_webhook_url.as_deref().map(redact_url),
            )
            .field("app_health_url", &self.app_health_url.as_deref().map(redact_url))
            .field("cache_url", &self.cache_url.as_deref().map(redact_url))
            .field("chain_rpc_url", &self.chain_rpc_url.as_deref().map(redact_url))
            .field("probe_timeout", &self.probe_timeout)
            .field("maintenance_flag", &self.maintenance_flag)
            .field("lock_stale_after", &self.lock_stale_after)
            .field("recovery_steps", &self.recovery_steps.keys().collect::<Vec<_>>())
            .field("recovery_scenarios", &self.recovery_scenarios)
            .field("step_timeout", &self.step_timeout)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, v)| k.starts_with(PREFIX) && !v.trim().is_empty())
            .collect();
        let env = Vars(&vars);

        let environment = match env.get("ENVIRONMENT") {
            Some(v) => v
                .parse::<Environment>()
                .map_err(|reason| ConfigError::invalid("OPSPLANE_ENVIRONMENT", reason))?,
            None => Environment::default(),
        };

        let ports = match env.get("PORTS") {
            Some(raw) => parse_ports(raw)?,
            None => vec![3000],
        };
        if ports.is_empty() {
            return Err(ConfigError::invalid("OPSPLANE_PORTS", "at least one port is required"));
        }

        let workers = env.parse_or("WORKERS", ports.len())?;
        let min_workers = env.parse_or("MIN_WORKERS", 1usize)?;
        let max_workers = env.parse_or("MAX_WORKERS", (ports.len() * 4).max(workers))?;

        let cpu_threshold = env.parse_or("CPU_THRESHOLD", 80.0f64)?;
        let response_time_threshold_ms = env.parse_or("RESPONSE_TIME_THRESHOLD_MS", 1000.0f64)?;

        let failure_policy = match env.get("MIGRATION_FAILURE_POLICY") {
            Some(v) => v
                .parse::<FailurePolicy>()
                .map_err(|reason| ConfigError::invalid("OPSPLANE_MIGRATION_FAILURE_POLICY", reason))?,
            None => FailurePolicy::default(),
        };

        let log_format = match env.get("LOG_FORMAT") {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(_) => {
                return Err(ConfigError::invalid(
                    "OPSPLANE_LOG_FORMAT",
                    "expected text or json",
                ));
            }
        };

        let actor = env
            .get("ACTOR")
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| Holder::current().to_string());

        let mut recovery_steps = BTreeMap::new();
        let mut recovery_scenarios = BTreeMap::new();
        for (key, value) in &vars {
            if let Some(name) = key.strip_prefix(STEP_PREFIX) {
                recovery_steps.insert(name.to_ascii_lowercase(), value.clone());
            } else if let Some(id) = key.strip_prefix(SCENARIO_PREFIX) {
                let steps: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                recovery_scenarios.insert(id.to_ascii_lowercase(), steps);
            }
        }

        let tmp = std::env::temp_dir();
        let config = Self {
            database_url: env.get("DATABASE_URL").map(str::to_string),
            environment,
            worker_command: env.get("WORKER_COMMAND").map(str::to_string),
            worker_args: env
                .get("WORKER_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            ports,
            workers,
            min_workers,
            max_workers,
            restart_delay: env.millis_or("RESTART_DELAY_MS", 1000)?,
            health_interval: env.millis_or("HEALTH_INTERVAL_MS", 5000)?,
            scale_interval: env.millis_or("SCALE_INTERVAL_MS", 30_000)?,
            cpu_threshold,
            response_time_threshold_ms,
            stagger_interval: env.millis_or("STAGGER_INTERVAL_MS", 1000)?,
            warmup_interval: env.millis_or("WARMUP_INTERVAL_MS", 5000)?,
            graceful_timeout: env.millis_or("GRACEFUL_TIMEOUT_MS", 30_000)?,
            start_retry_limit: env.parse_or("START_RETRY_LIMIT", 5u32)?,
            ipc_socket: env
                .get("IPC_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| tmp.join(format!("opsplane-ipc-{}.sock", std::process::id()))),
            control_socket: env
                .get("CONTROL_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| tmp.join("opsplane-control.sock")),
            migrations_dir: PathBuf::from(env.get("MIGRATIONS_DIR").unwrap_or("./migrations")),
            migrate_on_start: env.flag("MIGRATE_ON_START"),
            failure_policy,
            actor,
            commit_ref: env.get("COMMIT_REF").map(str::to_string),
            alert_webhook_url: env.get("ALERT_WEBHOOK_URL").map(str::to_string),
            app_health_url: env.get("APP_HEALTH_URL").map(str::to_string),
            cache_url: env.get("CACHE_URL").map(str::to_string),
            chain_rpc_url: env.get("CHAIN_RPC_URL").map(str::to_string),
            probe_timeout: env.millis_or("PROBE_TIMEOUT_MS", 5000)?,
            maintenance_flag: env
                .get("MAINTENANCE_FLAG")
                .map(PathBuf::from)
                .unwrap_or_else(|| tmp.join("opsplane.maintenance")),
            lock_stale_after: Duration::from_secs(env.parse_or("LOCK_STALE_AFTER_SECS", 300u64)?),
            recovery_steps,
            recovery_scenarios,
            step_timeout: env.millis_or("STEP_TIMEOUT_MS", 300_000)?,
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers > self.workers {
            return Err(ConfigError::invalid(
                "OPSPLANE_MIN_WORKERS",
                "must not exceed OPSPLANE_WORKERS",
            ));
        }
        if self.workers > self.max_workers {
            return Err(ConfigError::invalid(
                "OPSPLANE_WORKERS",
                "must not exceed OPSPLANE_MAX_WORKERS",
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::invalid(
                "OPSPLANE_MAX_WORKERS",
                "must be at least 1",
            ));
        }
        if !self.cpu_threshold.is_finite() || self.cpu_threshold <= 0.0 {
            return Err(ConfigError::invalid("OPSPLANE_CPU_THRESHOLD", "must be positive"));
        }
        if !self.response_time_threshold_ms.is_finite() || self.response_time_threshold_ms <= 0.0 {
            return Err(ConfigError::invalid(
                "OPSPLANE_RESPONSE_TIME_THRESHOLD_MS",
                "must be positive",
            ));
        }
        if self.health_interval.is_zero() {
            return Err(ConfigError::invalid(
                "OPSPLANE_HEALTH_INTERVAL_MS",
                "must be positive",
            ));
        }
        if self.scale_interval.is_zero() {
            return Err(ConfigError::invalid(
                "OPSPLANE_SCALE_INTERVAL_MS",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("OPSPLANE_DATABASE_URL"))
    }

    pub fn require_worker_command(&self) -> Result<&str, ConfigError> {
        self.worker_command
            .as_deref()
            .ok_or(ConfigError::Missing("OPSPLANE_WORKER_COMMAND"))
    }

    /// Pool settings for the worker supervisor.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            ports: self.ports.clone(),
            workers: self.workers,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            restart_delay: self.restart_delay,
            health_interval: self.health_interval,
            graceful_timeout: self.graceful_timeout,
            start_retry_limit: self.start_retry_limit,
            stagger_interval: self.stagger_interval,
            warmup_interval: self.warmup_interval,
        }
    }

    pub fn autoscale_config(&self) -> AutoscaleConfig {
        AutoscaleConfig {
            interval: self.scale_interval,
            cpu_threshold: self.cpu_threshold,
            response_time_threshold_ms: self.response_time_threshold_ms,
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            warmup: self.warmup_interval,
        }
    }

    /// Migration engine settings, carrying actor, environment and commit.
    pub fn migration_config(&self) -> MigrationConfig {
        let mut config = MigrationConfig::new(&self.migrations_dir);
        config.environment = self.environment;
        config.actor = self.actor.clone();
        config.commit_ref = self.commit_ref.clone();
        config.failure_policy = self.failure_policy;
        config
    }
}

/// Typed access to the `OPSPLANE_` variables.
struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&format!("{PREFIX}{name}"))
            .map(|v| v.trim())
    }

    fn parse_or<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::invalid(&format!("{PREFIX}{name}"), "not a valid number")),
            None => Ok(default),
        }
    }

    fn millis_or(&self, name: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(name, default).map(Duration::from_millis)
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some("1" | "true" | "yes" | "on"))
    }
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| ConfigError::invalid("OPSPLANE_PORTS", "expected a comma list of ports"))
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// A variable is present but unusable.
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Precondition
    }
}
