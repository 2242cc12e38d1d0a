// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error classification shared by every opsplane component.
//!
//! Internal components return structured errors; the process boundary maps
//! them to an [`ErrorKind`] and from there to a process exit code. Only
//! [`ErrorKind::Transient`] failures are retried, and only once.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Backoff applied before the single retry of a transient failure.
pub const TRANSIENT_BACKOFF: Duration = Duration::from_millis(250);

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blip or brief unavailability; retried once with backoff.
    Transient,
    /// A precondition for the operation does not hold (lock held, unknown
    /// target, missing configuration). Never retried.
    Precondition,
    /// Recorded state disagrees with the world (checksum mismatch, missing
    /// migration file). Surfaced for operator action.
    Integrity,
    /// A worker crashed or went silent.
    WorkerFault,
    /// A step inside a recovery run or migration failed.
    StepFault,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Process exit code for a CLI action that failed with this kind.
    ///
    /// `2` means "could not start because a precondition did not hold",
    /// `1` means "started and failed".
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Precondition => 2,
            _ => 1,
        }
    }

    /// Stable snake_case label used in logs and JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Integrity => "integrity",
            ErrorKind::WorkerFault => "worker_fault",
            ErrorKind::StepFault => "step_fault",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their [`ErrorKind`].
pub trait Classify {
    /// Classification of this error.
    fn kind(&self) -> ErrorKind;
}

/// Errors from the control store (locks, migration history, recovery audit).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedded schema could not be applied.
    #[error("schema setup failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),

    /// The database URL uses a scheme no backend understands.
    #[error("unsupported database URL: {0}")]
    UnsupportedUrl(String),

    /// A stored value could not be interpreted.
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => ErrorKind::Transient,
                _ => ErrorKind::Internal,
            },
            StoreError::Schema(_) => ErrorKind::Internal,
            StoreError::UnsupportedUrl(_) => ErrorKind::Precondition,
            StoreError::InvalidRecord(_) => ErrorKind::Integrity,
        }
    }
}

/// Run `op`, retrying once after [`TRANSIENT_BACKOFF`] if it fails with a
/// transient error. Non-transient errors are returned immediately.
pub async fn retry_transient<T, E, F, Fut>(what: &str, mut op: F) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match op().await {
        Err(e) if e.kind() == ErrorKind::Transient => {
            warn!(operation = what, error = %e, "Transient failure, retrying once");
            tokio::time::sleep(TRANSIENT_BACKOFF).await;
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorKind);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::Precondition.exit_code(), 2);
        assert_eq!(ErrorKind::Transient.exit_code(), 1);
        assert_eq!(ErrorKind::Integrity.exit_code(), 1);
        assert_eq!(ErrorKind::StepFault.exit_code(), 1);
        assert_eq!(ErrorKind::Internal.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = retry_transient("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError(ErrorKind::Transient)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_recovers_on_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry_transient("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TestError(ErrorKind::Transient))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_precondition_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = retry_transient("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError(ErrorKind::Precondition)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsupported_url_is_precondition() {
        let err = StoreError::UnsupportedUrl("mysql://db".into());
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = StoreError::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
