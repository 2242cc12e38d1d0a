// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forward and backward execution of migration units.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::{FailurePolicy, MigrationCatalog, MigrationError, MigrationUnit};
use crate::environment::Environment;
use crate::events::{EventBus, OpsEvent};
use crate::locks::{Holder, LockGuard, LockRegistry, MIGRATION_LOCK};
use crate::persistence::{ControlStore, HistoryRecord, LockRecord, RevertOutcome, UnitAttempt};

/// Default number of recent attempts shown by `status`.
pub const DEFAULT_STATUS_LIMIT: i64 = 10;

/// Settings for a [`MigrationEngine`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding the migration catalog.
    pub directory: PathBuf,
    pub environment: Environment,
    /// Recorded as `actor` on every history row.
    pub actor: String,
    /// Recorded as `commit_ref` on every history row.
    pub commit_ref: Option<String>,
    /// Ignored in production, where batches always abort.
    pub failure_policy: FailurePolicy,
    /// Number of recent attempts returned by `status`.
    pub status_limit: i64,
}

impl MigrationConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            environment: Environment::default(),
            actor: Holder::current().to_string(),
            commit_ref: None,
            failure_policy: FailurePolicy::Abort,
            status_limit: DEFAULT_STATUS_LIMIT,
        }
    }

    /// The policy actually applied to a batch.
    pub fn effective_policy(&self) -> FailurePolicy {
        if self.environment.is_production() {
            FailurePolicy::Abort
        } else {
            self.failure_policy
        }
    }
}

/// Input to [`MigrationEngine::apply`].
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Inclusive upper bound on the unit names applied.
    pub target: Option<String>,
    /// Report what would run without touching the database.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedUnit {
    pub name: String,
    pub checksum: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub name: String,
    pub error: String,
}

/// Outcome of an apply batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub dry_run: bool,
    /// Pending units selected for this batch, in execution order.
    pub planned: Vec<String>,
    pub applied: Vec<AppliedUnit>,
    pub failed: Vec<FailedUnit>,
    /// Planned units skipped because an earlier unit failed.
    pub not_attempted: Vec<String>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Which completed units a rollback reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackSelector {
    /// The `n` most recent completed units that still exist on disk.
    Steps(usize),
    /// Every completed unit whose name sorts after this one.
    Target(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoDownScript,
    MissingFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUnit {
    pub name: String,
    pub reason: SkipReason,
}

/// Outcome of a rollback.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub rolled_back: Vec<String>,
    pub skipped: Vec<SkippedUnit>,
    pub failed: Option<FailedUnit>,
    pub not_attempted: Vec<String>,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingKind {
    ChecksumMismatch { recorded: String, current: String },
    MissingFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub name: String,
    #[serde(flatten)]
    pub kind: FindingKind,
}

/// Outcome of [`MigrationEngine::verify`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    /// Number of completed rows checked.
    pub checked: usize,
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Outcome of [`MigrationEngine::status`].
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    pub counts: BTreeMap<String, i64>,
    pub pending: Vec<String>,
    pub recent: Vec<HistoryRecord>,
    /// Current holder of the migration lock, if any.
    pub lock: Option<LockRecord>,
}

/// Runs migration units against the control store's database.
pub struct MigrationEngine {
    store: Arc<dyn ControlStore>,
    locks: LockRegistry,
    events: EventBus,
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<dyn ControlStore>,
        locks: LockRegistry,
        events: EventBus,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Load the on-disk catalog.
    pub async fn catalog(&self) -> Result<MigrationCatalog, MigrationError> {
        MigrationCatalog::load(&self.config.directory).await
    }

    /// Units on disk without a `completed` history row, in name order.
    pub async fn pending(&self) -> Result<Vec<MigrationUnit>, MigrationError> {
        let catalog = self.catalog().await?;
        self.pending_in(&catalog).await
    }

    async fn pending_in(
        &self,
        catalog: &MigrationCatalog,
    ) -> Result<Vec<MigrationUnit>, MigrationError> {
        let completed: HashSet<String> = self
            .store
            .completed_units()
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();

        Ok(catalog
            .units()
            .iter()
            .filter(|unit| !completed.contains(&unit.name))
            .cloned()
            .collect())
    }

    /// Apply pending units up to `options.target` (inclusive) in name order.
    ///
    /// Fails fast with a precondition error when another process holds the
    /// migration lock. A failing unit is recorded as `failed` and reported in
    /// the returned [`ApplyReport`] rather than as an error.
    pub async fn apply(&self, options: ApplyOptions) -> Result<ApplyReport, MigrationError> {
        let catalog = self.catalog().await?;
        if let Some(target) = &options.target
            && !catalog.contains(target)
        {
            return Err(MigrationError::UnknownTarget(target.clone()));
        }

        let guard = self.locks.acquire_guard(MIGRATION_LOCK).await?;
        let result = self.apply_locked(&catalog, &options, &guard).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release migration lock");
        }
        result
    }

    async fn apply_locked(
        &self,
        catalog: &MigrationCatalog,
        options: &ApplyOptions,
        guard: &LockGuard,
    ) -> Result<ApplyReport, MigrationError> {
        let planned: Vec<MigrationUnit> = self
            .pending_in(catalog)
            .await?
            .into_iter()
            .filter(|unit| match &options.target {
                Some(target) => unit.name.as_str() <= target.as_str(),
                None => true,
            })
            .collect();

        let mut report = ApplyReport {
            dry_run: options.dry_run,
            planned: planned.iter().map(|u| u.name.clone()).collect(),
            ..Default::default()
        };

        if options.dry_run {
            for unit in &planned {
                info!(migration = %unit.name, checksum = %unit.checksum, "Would apply migration");
            }
            return Ok(report);
        }

        if planned.is_empty() {
            info!("No pending migrations");
            return Ok(report);
        }

        let policy = self.config.effective_policy();
        info!(
            count = planned.len(),
            policy = ?policy,
            environment = %self.config.environment,
            "Applying migrations"
        );

        for (position, unit) in planned.iter().enumerate() {
            if !guard.confirm().await? {
                return Err(MigrationError::LockLost(unit.name.clone()));
            }

            self.events.emit(OpsEvent::MigrationStarted {
                name: unit.name.clone(),
            });

            let record = self
                .store
                .apply_unit(&UnitAttempt {
                    name: &unit.name,
                    checksum: &unit.checksum,
                    script: &unit.up_script,
                    actor: &self.config.actor,
                    environment: self.config.environment.as_str(),
                    commit_ref: self.config.commit_ref.as_deref(),
                })
                .await?;

            let duration_ms = record.duration_ms.unwrap_or_default();
            if record.is_completed() {
                info!(migration = %unit.name, duration_ms, "Migration applied");
                self.events.emit(OpsEvent::MigrationCompleted {
                    name: unit.name.clone(),
                    duration_ms,
                });
                report.applied.push(AppliedUnit {
                    name: unit.name.clone(),
                    checksum: unit.checksum.clone(),
                    duration_ms,
                });
                continue;
            }

            let message = record.error.unwrap_or_else(|| "unknown error".to_string());
            error!(migration = %unit.name, error = %message, "Migration failed");
            self.events.emit(OpsEvent::MigrationFailed {
                name: unit.name.clone(),
                error: message.clone(),
            });
            report.failed.push(FailedUnit {
                name: unit.name.clone(),
                error: message,
            });

            if policy == FailurePolicy::Abort {
                report.not_attempted = planned[position + 1..]
                    .iter()
                    .map(|u| u.name.clone())
                    .collect();
                break;
            }
        }

        Ok(report)
    }

    /// Revert completed units newest first using their on-disk down scripts.
    ///
    /// Units without a down script are skipped and their history is left
    /// alone. The first failing down script stops the rollback.
    pub async fn rollback(
        &self,
        selector: RollbackSelector,
    ) -> Result<RollbackReport, MigrationError> {
        let catalog = self.catalog().await?;
        let guard = self.locks.acquire_guard(MIGRATION_LOCK).await?;
        let result = self.rollback_locked(&catalog, &selector, &guard).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release migration lock");
        }
        result
    }

    async fn rollback_locked(
        &self,
        catalog: &MigrationCatalog,
        selector: &RollbackSelector,
        guard: &LockGuard,
    ) -> Result<RollbackReport, MigrationError> {
        let completed = self.store.completed_units().await?;

        let candidates: Vec<&HistoryRecord> = match selector {
            RollbackSelector::Target(target) => {
                if !catalog.contains(target) && !completed.iter().any(|r| &r.name == target) {
                    return Err(MigrationError::UnknownTarget(target.clone()));
                }
                completed
                    .iter()
                    .rev()
                    .filter(|r| r.name.as_str() > target.as_str())
                    .collect()
            }
            RollbackSelector::Steps(steps) => {
                // Units whose file is gone are reported but do not count
                // towards the requested number of steps.
                let mut selected = Vec::new();
                let mut counted = 0;
                for record in completed.iter().rev() {
                    if counted == *steps {
                        break;
                    }
                    if catalog.contains(&record.name) {
                        counted += 1;
                    }
                    selected.push(record);
                }
                selected
            }
        };

        let mut report = RollbackReport::default();

        for (position, record) in candidates.iter().enumerate() {
            let Some(unit) = catalog.get(&record.name) else {
                warn!(migration = %record.name, "Completed migration has no file on disk, skipping");
                report.skipped.push(SkippedUnit {
                    name: record.name.clone(),
                    reason: SkipReason::MissingFile,
                });
                continue;
            };
            let Some(down_script) = unit.down_script.as_deref() else {
                warn!(migration = %record.name, "Migration has no down script, skipping");
                report.skipped.push(SkippedUnit {
                    name: record.name.clone(),
                    reason: SkipReason::NoDownScript,
                });
                continue;
            };

            if !guard.confirm().await? {
                return Err(MigrationError::LockLost(record.name.clone()));
            }

            match self.store.revert_unit(record.id, down_script).await? {
                RevertOutcome::Reverted(_) => {
                    info!(migration = %record.name, "Migration rolled back");
                    self.events.emit(OpsEvent::MigrationRolledBack {
                        name: record.name.clone(),
                    });
                    report.rolled_back.push(record.name.clone());
                }
                RevertOutcome::NotCompleted => {
                    warn!(migration = %record.name, "History row changed before rollback, skipping");
                }
                RevertOutcome::Failed(message) => {
                    error!(migration = %record.name, error = %message, "Rollback failed");
                    self.events.emit(OpsEvent::MigrationRollbackFailed {
                        name: record.name.clone(),
                        error: message.clone(),
                    });
                    report.failed = Some(FailedUnit {
                        name: record.name.clone(),
                        error: message,
                    });
                    report.not_attempted = candidates[position + 1..]
                        .iter()
                        .map(|r| r.name.clone())
                        .collect();
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Counts by status, pending names and the most recent attempts.
    pub async fn status(&self) -> Result<MigrationStatusReport, MigrationError> {
        let catalog = self.catalog().await?;
        let pending = self
            .pending_in(&catalog)
            .await?
            .into_iter()
            .map(|u| u.name)
            .collect();
        let counts = self.store.status_counts().await?.into_iter().collect();
        let recent = self
            .store
            .recent_attempts(self.config.status_limit)
            .await?;
        let lock = self.locks.inspect(MIGRATION_LOCK).await?;

        Ok(MigrationStatusReport {
            counts,
            pending,
            recent,
            lock,
        })
    }

    /// Compare every completed row with the file currently on disk.
    pub async fn verify(&self) -> Result<VerifyReport, MigrationError> {
        let catalog = self.catalog().await?;
        let completed = self.store.completed_units().await?;

        let mut report = VerifyReport {
            checked: completed.len(),
            findings: Vec::new(),
        };

        for record in completed {
            let kind = match catalog.get(&record.name) {
                None => FindingKind::MissingFile,
                Some(unit) if unit.checksum != record.checksum => FindingKind::ChecksumMismatch {
                    recorded: record.checksum.clone(),
                    current: unit.checksum.clone(),
                },
                Some(_) => continue,
            };
            warn!(migration = %record.name, finding = ?kind, "Migration integrity finding");
            report.findings.push(Finding {
                name: record.name,
                kind,
            });
        }

        Ok(report)
    }
}
