// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Disaster recovery orchestration.
//!
//! ```text
//!   ProbeSet ──detect()──► scenario id (operator decides)
//!                                │
//!                          start(scenario)
//!                                ▼
//!   ScenarioCatalog ──► RecoveryOrchestrator ──► StepRegistry ──► RecoveryStep
//!                                │
//!                ┌───────────────┼───────────────┐
//!                ▼               ▼               ▼
//!          ControlStore      EventBus        AlertSink
//!        (recovery_runs)
//! ```

pub mod alerts;
pub mod orchestrator;
pub mod probes;
pub mod scenarios;
pub mod steps;

pub use alerts::{Alert, AlertKind, AlertSink, LogSink, WebhookSink};
pub use orchestrator::{Detection, RecoveryOrchestrator, RecoveryRun, RunState};
pub use probes::{Component, Probe, ProbeResult, ProbeSet};
pub use scenarios::{Scenario, ScenarioCatalog, Severity};
pub use steps::{RecoveryStep, StepError, StepRegistry};

use opsplane_core::{Classify, ErrorKind, LockError, StoreError};
use thiserror::Error;

/// Errors from the recovery orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecoveryError {
    #[error("unknown recovery scenario: {0}")]
    UnknownScenario(String),

    #[error("scenario {scenario} references unknown step {step}")]
    UnknownStep { scenario: String, step: String },

    /// A run is already active in this process.
    #[error("recovery run {0} is already active")]
    RunActive(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid recovery configuration: {0}")]
    Config(String),
}

impl Classify for RecoveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::UnknownScenario(_)
            | RecoveryError::UnknownStep { .. }
            | RecoveryError::RunActive(_)
            | RecoveryError::Config(_) => ErrorKind::Precondition,
            RecoveryError::Lock(e) => e.kind(),
            RecoveryError::Store(e) => e.kind(),
        }
    }
}

/// Result type for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;
