// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery alert sinks.
//!
//! Sink failures are logged by the orchestrator and never change a run's
//! outcome.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsplane_core::redact_url;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::RecoveryStarted => "recovery_started",
            AlertKind::RecoveryCompleted => "recovery_completed",
            AlertKind::RecoveryFailed => "recovery_failed",
        }
    }
}

/// Structured alert payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub scenario: String,
    pub severity: String,
    pub run_id: String,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook answered HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// POSTs the alert as JSON.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %redact_url(&self.url), status = status.as_u16(), "Alert webhook rejected payload");
            return Err(AlertError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Writes alerts to the tracing log.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.kind {
            AlertKind::RecoveryFailed => error!(
                alert = alert.kind.as_str(),
                scenario = %alert.scenario,
                severity = %alert.severity,
                run_id = %alert.run_id,
                completed_steps = ?alert.completed_steps,
                failed_steps = ?alert.failed_steps,
                error = alert.error.as_deref().unwrap_or_default(),
                "Recovery alert"
            ),
            _ => info!(
                alert = alert.kind.as_str(),
                scenario = %alert.scenario,
                severity = %alert.severity,
                run_id = %alert.run_id,
                completed_steps = ?alert.completed_steps,
                "Recovery alert"
            ),
        }
        Ok(())
    }
}
