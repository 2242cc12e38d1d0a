// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema migration engine.
//!
//! Applies the units of a [`MigrationCatalog`] forward or backward against
//! the control store's database, recording every attempt in
//! `migration_history`. All history mutations happen while holding the
//! [`crate::locks::MIGRATION_LOCK`].
//!
//! | Operation | Lock | Effect |
//! |-----------|------|--------|
//! | [`MigrationEngine::pending`] | no | names on disk without a completed row |
//! | [`MigrationEngine::apply`] | yes | run pending up scripts in name order |
//! | [`MigrationEngine::rollback`] | yes | run down scripts newest first |
//! | [`MigrationEngine::status`] | no | counts, pending names, recent attempts |
//! | [`MigrationEngine::verify`] | no | checksum drift and missing files |

mod catalog;
mod engine;

use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

pub use catalog::{MigrationCatalog, MigrationUnit, checksum};
pub use engine::{
    ApplyOptions, ApplyReport, AppliedUnit, FailedUnit, Finding, FindingKind, MigrationConfig,
    MigrationEngine, MigrationStatusReport, RollbackReport, RollbackSelector, SkipReason,
    SkippedUnit, VerifyReport,
};

use crate::error::{Classify, ErrorKind, StoreError};
use crate::locks::LockError;

/// Errors from the migration engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MigrationError {
    #[error("cannot read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("invalid migration file name: {0} (expected NNN_slug.sql)")]
    InvalidName(String),

    #[error("migration script is not valid UTF-8: {0}")]
    InvalidScript(PathBuf),

    #[error("inconsistent migration catalog: {0}")]
    InconsistentCatalog(String),

    #[error("unknown migration target: {0}")]
    UnknownTarget(String),

    #[error("migration lock lost during batch before {0}")]
    LockLost(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for MigrationError {
    fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Io(..) => ErrorKind::Precondition,
            MigrationError::InvalidName(_)
            | MigrationError::InvalidScript(_)
            | MigrationError::InconsistentCatalog(_) => ErrorKind::Integrity,
            MigrationError::UnknownTarget(_) => ErrorKind::Precondition,
            MigrationError::LockLost(_) => ErrorKind::Internal,
            MigrationError::Lock(e) => e.kind(),
            MigrationError::Store(e) => e.kind(),
        }
    }
}

/// What an apply batch does after a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failed unit. Always used in production.
    #[default]
    Abort,
    /// Record the failure and carry on with the next unit.
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}
