// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the worker supervisor.

use opsplane_core::{Classify, ErrorKind};
use thiserror::Error;

use crate::launcher::LaunchError;

/// Errors returned by [`crate::pool::SupervisorHandle`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    #[error("pool is already at max_workers ({0})")]
    AtMaxWorkers(usize),

    #[error("pool is already at min_workers ({0})")]
    AtMinWorkers(usize),

    #[error("no worker with id {0}")]
    UnknownWorker(String),

    #[error("no online worker can be drained")]
    NoScaleDownCandidate,

    #[error("a reload is already in progress")]
    ReloadInProgress,

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("worker launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// The pool actor is no longer running.
    #[error("supervisor stopped")]
    Stopped,
}

impl Classify for SupervisorError {
    fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::AtMaxWorkers(_)
            | SupervisorError::AtMinWorkers(_)
            | SupervisorError::UnknownWorker(_)
            | SupervisorError::NoScaleDownCandidate
            | SupervisorError::ReloadInProgress
            | SupervisorError::ShuttingDown => ErrorKind::Precondition,
            SupervisorError::Launch(_) => ErrorKind::WorkerFault,
            SupervisorError::Stopped => ErrorKind::Internal,
        }
    }
}

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;
