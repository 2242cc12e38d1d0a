// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named exclusive locks stored in the control store.
//!
//! A lock row records the holder's host and pid. A holder is stale when it
//! runs on this host and its pid no longer exists, or when it runs on another
//! host and has not refreshed its heartbeat within `stale_after`. Stale locks
//! are evicted (and the eviction recorded) before a fresh acquisition is
//! attempted; live locks are never evicted.
//!
//! Acquisition is a single conditional insert, so of two concurrent callers
//! exactly one wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Classify, ErrorKind, StoreError, retry_transient};
use crate::events::{EventBus, OpsEvent};
use crate::persistence::{ControlStore, LockRecord};

/// Lock held for the duration of a migration batch or rollback.
pub const MIGRATION_LOCK: &str = "migration_execution";
/// Lock held for the duration of a recovery run.
pub const RECOVERY_LOCK: &str = "recovery_execution";

/// Default heartbeat age after which a holder on another host is stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holder {
    pub host: String,
    pub pid: i64,
}

impl Holder {
    /// The current process on the current host.
    pub fn current() -> Self {
        Self {
            host: local_hostname(),
            pid: i64::from(std::process::id()),
        }
    }

    pub fn new(host: impl Into<String>, pid: i64) -> Self {
        Self {
            host: host.into(),
            pid,
        }
    }
}

impl std::fmt::Display for Holder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)
    }
}

/// Host name of this machine, or `unknown-host` if it cannot be read.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Errors from the lock registry.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live holder owns the lock.
    #[error("lock {name} is held by {holder}:{pid} since {acquired_at}")]
    HeldByOther {
        name: String,
        holder: String,
        pid: i64,
        acquired_at: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for LockError {
    fn kind(&self) -> ErrorKind {
        match self {
            LockError::HeldByOther { .. } => ErrorKind::Precondition,
            LockError::Store(e) => e.kind(),
        }
    }
}

impl LockError {
    fn held_by(record: &LockRecord) -> Self {
        LockError::HeldByOther {
            name: record.name.clone(),
            holder: record.holder.clone(),
            pid: record.pid,
            acquired_at: record.acquired_at.to_rfc3339(),
        }
    }
}

/// Proof of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub token: String,
}

/// Why a holder was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Live,
    DeadPid,
    HeartbeatExpired,
}

impl Staleness {
    fn reason(self) -> &'static str {
        match self {
            Staleness::Live => "live",
            Staleness::DeadPid => "holder_process_dead",
            Staleness::HeartbeatExpired => "heartbeat_expired",
        }
    }
}

/// Whether `pid` names a live process on this host.
///
/// A permission error means the process exists under another user.
pub fn pid_alive(pid: i64) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Registry of named locks backed by a [`ControlStore`].
#[derive(Clone)]
pub struct LockRegistry {
    store: Arc<dyn ControlStore>,
    holder: Holder,
    stale_after: Duration,
    events: EventBus,
}

impl LockRegistry {
    pub fn new(store: Arc<dyn ControlStore>, events: EventBus) -> Self {
        Self {
            store,
            holder: Holder::current(),
            stale_after: DEFAULT_STALE_AFTER,
            events,
        }
    }

    /// Override the holder identity written into lock rows.
    pub fn with_holder(mut self, holder: Holder) -> Self {
        self.holder = holder;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn holder(&self) -> &Holder {
        &self.holder
    }

    /// Acquire `name`, evicting a stale holder first if there is one.
    ///
    /// Fails with [`LockError::HeldByOther`] when a live holder owns it.
    pub async fn acquire(&self, name: &str) -> Result<LockToken, LockError> {
        // Two rounds: the second follows an eviction or a release that
        // raced with our first insert.
        for _ in 0..2 {
            let now = Utc::now();
            let record = LockRecord {
                name: name.to_string(),
                holder: self.holder.host.clone(),
                pid: self.holder.pid,
                token: Uuid::new_v4().to_string(),
                acquired_at: now,
                heartbeat_at: now,
            };

            if retry_transient("insert_lock", || self.store.insert_lock(&record)).await? {
                info!(lock = name, holder = %self.holder, "Lock acquired");
                self.events.emit(OpsEvent::LockAcquired {
                    name: name.to_string(),
                    holder: record.holder.clone(),
                    pid: record.pid,
                });
                return Ok(LockToken {
                    name: record.name,
                    token: record.token,
                });
            }

            let Some(current) = retry_transient("get_lock", || self.store.get_lock(name)).await?
            else {
                debug!(lock = name, "Lock released between insert and read, retrying");
                continue;
            };

            let staleness = self.staleness(&current);
            if staleness == Staleness::Live {
                return Err(LockError::held_by(&current));
            }

            self.evict(&current, staleness).await?;
        }

        match self.store.get_lock(name).await? {
            Some(current) => Err(LockError::held_by(&current)),
            None => Err(LockError::HeldByOther {
                name: name.to_string(),
                holder: "unknown".to_string(),
                pid: 0,
                acquired_at: String::new(),
            }),
        }
    }

    async fn evict(&self, current: &LockRecord, staleness: Staleness) -> Result<(), LockError> {
        let removed = self.store.delete_lock(&current.name, &current.token).await?;
        if !removed {
            // Someone else already removed or replaced it.
            return Ok(());
        }

        let reason = staleness.reason();
        self.store
            .record_eviction(current, &self.holder.host, self.holder.pid, reason)
            .await?;

        warn!(
            lock = %current.name,
            evicted_holder = %current.holder,
            evicted_pid = current.pid,
            reason,
            "Evicted stale lock holder"
        );
        self.events.emit(OpsEvent::LockEvicted {
            name: current.name.clone(),
            evicted_holder: current.holder.clone(),
            evicted_pid: current.pid,
            evicted_by: self.holder.host.clone(),
            evicted_by_pid: self.holder.pid,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn staleness(&self, record: &LockRecord) -> Staleness {
        if record.holder == self.holder.host {
            if pid_alive(record.pid) {
                Staleness::Live
            } else {
                Staleness::DeadPid
            }
        } else {
            let age = Utc::now().signed_duration_since(record.heartbeat_at);
            let limit = chrono::Duration::from_std(self.stale_after)
                .unwrap_or_else(|_| chrono::Duration::MAX);
            if age > limit {
                Staleness::HeartbeatExpired
            } else {
                Staleness::Live
            }
        }
    }

    /// Release a lock. Returns `false` if the lock was no longer held under
    /// this token.
    pub async fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let removed = retry_transient("delete_lock", || {
            self.store.delete_lock(&token.name, &token.token)
        })
        .await?;

        if removed {
            info!(lock = %token.name, "Lock released");
            self.events.emit(OpsEvent::LockReleased {
                name: token.name.clone(),
            });
        } else {
            warn!(lock = %token.name, "Lock was no longer held at release");
        }
        Ok(removed)
    }

    /// Current holder of `name`, if any.
    pub async fn inspect(&self, name: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(retry_transient("get_lock", || self.store.get_lock(name)).await?)
    }

    /// Whether `token` still owns its lock.
    pub async fn confirm(&self, token: &LockToken) -> Result<bool, LockError> {
        Ok(self
            .inspect(&token.name)
            .await?
            .is_some_and(|record| record.token == token.token))
    }

    /// Refresh the heartbeat of a held lock. Returns `false` if the lock was
    /// lost.
    pub async fn refresh(&self, token: &LockToken) -> Result<bool, LockError> {
        Ok(self
            .store
            .touch_lock(&token.name, &token.token, Utc::now())
            .await?)
    }

    /// Acquire `name` and wrap the token in a guard that releases it when
    /// dropped.
    pub async fn acquire_guard(&self, name: &str) -> Result<LockGuard, LockError> {
        let token = self.acquire(name).await?;
        Ok(LockGuard {
            registry: self.clone(),
            token: Some(token),
        })
    }
}

/// Releases its lock on [`LockGuard::release`], or in a background task when
/// dropped without an explicit release (early return or panic).
pub struct LockGuard {
    registry: LockRegistry,
    token: Option<LockToken>,
}

impl LockGuard {
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Whether this guard still owns its lock.
    pub async fn confirm(&self) -> Result<bool, LockError> {
        match &self.token {
            Some(token) => self.registry.confirm(token).await,
            None => Ok(false),
        }
    }

    pub async fn refresh(&self) -> Result<bool, LockError> {
        match &self.token {
            Some(token) => self.registry.refresh(token).await,
            None => Ok(false),
        }
    }

    pub async fn release(mut self) -> Result<bool, LockError> {
        match self.token.take() {
            Some(token) => self.registry.release(&token).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                handle.spawn(async move {
                    if let Err(e) = registry.release(&token).await {
                        warn!(lock = %token.name, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %token.name, "Lock guard dropped outside a runtime; lock left for stale eviction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_alive_for_self() {
        assert!(pid_alive(i64::from(std::process::id())));
    }

    #[test]
    fn test_pid_alive_rejects_invalid() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(-5));
        assert!(!pid_alive(i64::MAX));
        assert!(!pid_alive(i64::from(i32::MAX - 1)));
    }

    #[test]
    fn test_holder_display() {
        assert_eq!(Holder::new("web-1", 42).to_string(), "web-1:42");
    }

    #[test]
    fn test_held_by_other_is_precondition() {
        let err = LockError::HeldByOther {
            name: MIGRATION_LOCK.into(),
            holder: "h".into(),
            pid: 1,
            acquired_at: String::new(),
        };
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.kind().exit_code(), 2);
    }
}
