// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery run state machine.
//!
//! ```text
//!   idle ──start──► running ──step ok──► running ──last step──► completed
//!                      │
//!                      └──step failed──► aborted
//! ```
//!
//! At most one run is `running`: an in-process slot rejects a second
//! `start` with [`RecoveryError::RunActive`], and the `recovery_execution`
//! lock excludes other processes. Steps run strictly in scenario order and
//! a failed step ends the run; later steps are not attempted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opsplane_core::locks::RECOVERY_LOCK;
use opsplane_core::persistence::{RecoveryRunRecord, RecoveryStepRecord, decode_steps, encode_steps};
use opsplane_core::{ControlStore, EventBus, LockRegistry, OpsEvent, retry_transient};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::alerts::{Alert, AlertKind, AlertSink};
use super::probes::{ProbeResult, ProbeSet, detect_scenario};
use super::scenarios::{Scenario, ScenarioCatalog};
use super::steps::{StepError, StepRegistry};
use super::{RecoveryError, Result};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Aborted,
    /// Left `running` by a process that went away.
    Abandoned,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
            RunState::Abandoned => "abandoned",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunState::Running),
            "completed" => Some(RunState::Completed),
            "aborted" => Some(RunState::Aborted),
            "abandoned" => Some(RunState::Abandoned),
            _ => None,
        }
    }
}

/// Timing and outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A recovery run as returned to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryRun {
    pub run_id: String,
    pub scenario: String,
    pub severity: String,
    pub actor: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub error: Option<String>,
    pub steps: Vec<StepOutcome>,
}

impl RecoveryRun {
    fn record(&self, current_step: Option<&str>) -> RecoveryRunRecord {
        RecoveryRunRecord {
            run_id: self.run_id.clone(),
            scenario_id: self.scenario.clone(),
            severity: self.severity.clone(),
            actor: self.actor.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            current_step: current_step.map(str::to_string),
            completed_steps: encode_steps(&self.completed_steps),
            failed_steps: encode_steps(&self.failed_steps),
            outcome: self.state.as_str().to_string(),
            error: self.error.clone(),
        }
    }

    fn alert(&self, kind: AlertKind) -> Alert {
        Alert {
            kind,
            scenario: self.scenario.clone(),
            severity: self.severity.clone(),
            run_id: self.run_id.clone(),
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            error: self.error.clone(),
            at: Utc::now(),
        }
    }
}

/// Probe snapshot plus the scenario it maps to.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub results: Vec<ProbeResult>,
    pub scenario: Option<String>,
}

/// Builder for a [`RecoveryOrchestrator`].
pub struct RecoveryOrchestratorBuilder {
    store: Option<Arc<dyn ControlStore>>,
    locks: Option<LockRegistry>,
    events: EventBus,
    catalog: ScenarioCatalog,
    steps: StepRegistry,
    probes: Arc<ProbeSet>,
    sinks: Vec<Arc<dyn AlertSink>>,
    actor: String,
    step_timeout: Duration,
}

impl Default for RecoveryOrchestratorBuilder {
    fn default() -> Self {
        Self {
            store: None,
            locks: None,
            events: EventBus::default(),
            catalog: ScenarioCatalog::builtin(),
            steps: StepRegistry::new(),
            probes: Arc::new(ProbeSet::new(Duration::from_secs(5))),
            sinks: Vec::new(),
            actor: "opsplane".to_string(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl RecoveryOrchestratorBuilder {
    /// Set the store holding the run audit (required).
    pub fn store(mut self, store: Arc<dyn ControlStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the lock registry used for `recovery_execution` (required).
    pub fn locks(mut self, locks: LockRegistry) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Default: [`ScenarioCatalog::builtin`].
    pub fn catalog(mut self, catalog: ScenarioCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn probes(mut self, probes: Arc<ProbeSet>) -> Self {
        self.probes = probes;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Default: 5 minutes.
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Fails if a required field is missing or a scenario names a step that
    /// is not registered.
    pub fn build(self) -> Result<RecoveryOrchestrator> {
        let store = self
            .store
            .ok_or_else(|| RecoveryError::Config("store is required".into()))?;
        let locks = self
            .locks
            .ok_or_else(|| RecoveryError::Config("lock registry is required".into()))?;

        for scenario in self.catalog.iter() {
            if scenario.steps.is_empty() {
                return Err(RecoveryError::Config(format!(
                    "scenario {} has no steps",
                    scenario.id
                )));
            }
            if let Some(step) = scenario.steps.iter().find(|s| !self.steps.contains(s)) {
                return Err(RecoveryError::UnknownStep {
                    scenario: scenario.id.clone(),
                    step: step.clone(),
                });
            }
        }

        Ok(RecoveryOrchestrator {
            store,
            locks,
            events: self.events,
            catalog: self.catalog,
            steps: self.steps,
            probes: self.probes,
            sinks: self.sinks,
            actor: self.actor,
            step_timeout: self.step_timeout,
            active: Arc::new(Mutex::new(None)),
        })
    }
}

/// Executes recovery scenarios.
pub struct RecoveryOrchestrator {
    store: Arc<dyn ControlStore>,
    locks: LockRegistry,
    events: EventBus,
    catalog: ScenarioCatalog,
    steps: StepRegistry,
    probes: Arc<ProbeSet>,
    sinks: Vec<Arc<dyn AlertSink>>,
    actor: String,
    step_timeout: Duration,
    active: Arc<Mutex<Option<String>>>,
}

/// Clears the active-run slot when the run ends, however it ends.
struct ActiveSlot(Arc<Mutex<Option<String>>>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl RecoveryOrchestrator {
    pub fn builder() -> RecoveryOrchestratorBuilder {
        RecoveryOrchestratorBuilder::default()
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &Scenario> {
        self.catalog.iter()
    }

    /// Id of the run executing in this process, if any.
    pub fn active_run(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Probe every configured collaborator and name the matching scenario.
    /// Never starts a run.
    pub async fn detect(&self) -> Detection {
        let results = self.probes.run_all().await;
        let scenario = detect_scenario(&results).map(str::to_string);
        match &scenario {
            Some(id) => warn!(scenario = %id, "Recovery scenario detected"),
            None => info!(probed = results.len(), "No recovery scenario detected"),
        }
        Detection { results, scenario }
    }

    /// Execute `scenario_id` to completion or to its first failing step.
    ///
    /// A failed step is not an error: the returned run is `aborted`.
    /// Errors mean the run could not start or its audit could not be
    /// written.
    pub async fn start(&self, scenario_id: &str) -> Result<RecoveryRun> {
        let scenario = self
            .catalog
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| RecoveryError::UnknownScenario(scenario_id.to_string()))?;

        let run_id = Uuid::new_v4().to_string();
        let _slot = self.claim_slot(&run_id)?;
        let lock = self.locks.acquire_guard(RECOVERY_LOCK).await?;

        let abandoned = match self.store.abandon_running_recovery_runs(Utc::now()).await {
            Ok(abandoned) => abandoned,
            Err(e) => {
                if let Err(release) = lock.release().await {
                    warn!(error = %release, "Failed to release recovery lock");
                }
                return Err(e.into());
            }
        };
        if abandoned > 0 {
            warn!(abandoned, "Marked stale running recovery runs as abandoned");
        }

        let mut run = RecoveryRun {
            run_id: run_id.clone(),
            scenario: scenario.id.clone(),
            severity: scenario.severity.as_str().to_string(),
            actor: self.actor.clone(),
            state: RunState::Running,
            started_at: Utc::now(),
            ended_at: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            error: None,
            steps: Vec::new(),
        };
        let outcome = self.execute(&scenario, &mut run).await;

        if let Err(e) = outcome {
            // The audit trail is incomplete; close the run out as aborted.
            run.state = RunState::Aborted;
            run.error = Some(format!("audit write failed: {e}"));
            run.ended_at = Some(Utc::now());
            let record = run.record(None);
            if let Err(update) = self.store.update_recovery_run(&record).await {
                warn!(run_id = %run.run_id, error = %update, "Could not mark recovery run aborted");
            }
            self.report_aborted(&run).await;
            if let Err(release) = lock.release().await {
                warn!(error = %release, "Failed to release recovery lock");
            }
            return Err(e);
        }

        if let Err(e) = lock.release().await {
            warn!(error = %e, "Failed to release recovery lock");
        }
        Ok(run)
    }

    /// Persist the run, execute its steps and persist the final state.
    /// Errors are audit writes that failed.
    async fn execute(&self, scenario: &Scenario, run: &mut RecoveryRun) -> Result<()> {
        let record = run.record(None);
        retry_transient("insert_recovery_run", || self.store.insert_recovery_run(&record)).await?;

        info!(
            run_id = %run.run_id,
            scenario = %run.scenario,
            severity = %run.severity,
            steps = scenario.steps.len(),
            actor = %run.actor,
            "Recovery run started"
        );
        self.events.emit(OpsEvent::RecoveryStarted {
            run_id: run.run_id.clone(),
            scenario: run.scenario.clone(),
        });
        self.notify(run.alert(AlertKind::RecoveryStarted)).await;

        for name in &scenario.steps {
            let record = run.record(Some(name));
            retry_transient("update_recovery_run", || self.store.update_recovery_run(&record)).await?;

            let outcome = self.run_step(&run.run_id, name).await;
            let ok = outcome.ok;
            let error = outcome.error.clone();
            let step_record = RecoveryStepRecord {
                run_id: run.run_id.clone(),
                step_name: outcome.name.clone(),
                started_at: outcome.started_at,
                duration_ms: outcome.duration_ms,
                outcome: if ok { "ok" } else { "failed" }.to_string(),
                error: error.clone(),
            };
            run.steps.push(outcome);
            if ok {
                run.completed_steps.push(name.clone());
            } else {
                run.failed_steps.push(name.clone());
                run.error = error.map(|e| format!("step {name} failed: {e}"));
                run.state = RunState::Aborted;
            }
            retry_transient("insert_recovery_step", || self.store.insert_recovery_step(&step_record))
                .await?;
            if !ok {
                break;
            }
        }

        if run.state == RunState::Running {
            run.state = RunState::Completed;
        }
        run.ended_at = Some(Utc::now());
        let record = run.record(None);
        retry_transient("update_recovery_run", || self.store.update_recovery_run(&record)).await?;

        match run.state {
            RunState::Completed => {
                info!(run_id = %run.run_id, scenario = %run.scenario, "Recovery run completed");
                self.events.emit(OpsEvent::RecoveryCompleted {
                    run_id: run.run_id.clone(),
                    scenario: run.scenario.clone(),
                });
                self.notify(run.alert(AlertKind::RecoveryCompleted)).await;
            }
            _ => self.report_aborted(run).await,
        }
        Ok(())
    }

    async fn report_aborted(&self, run: &RecoveryRun) {
        error!(
            run_id = %run.run_id,
            scenario = %run.scenario,
            completed_steps = ?run.completed_steps,
            failed_steps = ?run.failed_steps,
            error = ?run.error,
            "Recovery run aborted"
        );
        self.events.emit(OpsEvent::RecoveryFailed {
            run_id: run.run_id.clone(),
            scenario: run.scenario.clone(),
            error: run.error.clone().unwrap_or_default(),
        });
        self.notify(run.alert(AlertKind::RecoveryFailed)).await;
    }

    /// Load a run and its step rows from the audit tables.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RecoveryRun>> {
        let Some(record) = self.store.get_recovery_run(run_id).await? else {
            return Ok(None);
        };
        let steps = self.store.list_recovery_steps(run_id).await?;
        Ok(Some(RecoveryRun {
            run_id: record.run_id,
            scenario: record.scenario_id,
            severity: record.severity,
            actor: record.actor,
            state: RunState::parse(&record.outcome).unwrap_or(RunState::Abandoned),
            started_at: record.started_at,
            ended_at: record.ended_at,
            completed_steps: decode_steps(&record.completed_steps)?,
            failed_steps: decode_steps(&record.failed_steps)?,
            error: record.error,
            steps: steps
                .into_iter()
                .map(|s| StepOutcome {
                    ok: s.outcome == "ok",
                    name: s.step_name,
                    started_at: s.started_at,
                    duration_ms: s.duration_ms,
                    error: s.error,
                })
                .collect(),
        }))
    }

    fn claim_slot(&self, run_id: &str) -> Result<ActiveSlot> {
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = slot.as_ref() {
            return Err(RecoveryError::RunActive(active.clone()));
        }
        *slot = Some(run_id.to_string());
        Ok(ActiveSlot(self.active.clone()))
    }

    async fn run_step(&self, run_id: &str, name: &str) -> StepOutcome {
        let started_at = Utc::now();
        let started = Instant::now();

        let result = match self.steps.get(name) {
            Some(step) => match tokio::time::timeout(self.step_timeout, step.run()).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout(self.step_timeout)),
            },
            None => Err(StepError::Failed(format!("step {name} is not registered"))),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                info!(run_id, step = name, duration_ms, "Recovery step completed");
                self.events.emit(OpsEvent::RecoveryStepCompleted {
                    run_id: run_id.to_string(),
                    step: name.to_string(),
                    duration_ms,
                });
                StepOutcome {
                    name: name.to_string(),
                    started_at,
                    duration_ms,
                    ok: true,
                    error: None,
                }
            }
            Err(e) => {
                error!(run_id, step = name, duration_ms, error = %e, "Recovery step failed");
                self.events.emit(OpsEvent::RecoveryStepFailed {
                    run_id: run_id.to_string(),
                    step: name.to_string(),
                    error: e.to_string(),
                });
                StepOutcome {
                    name: name.to_string(),
                    started_at,
                    duration_ms,
                    ok: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn notify(&self, alert: Alert) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(&alert).await {
                warn!(
                    sink = sink.name(),
                    alert = alert.kind.as_str(),
                    run_id = %alert.run_id,
                    error = %e,
                    "Alert sink failed"
                );
            }
        }
    }
}
