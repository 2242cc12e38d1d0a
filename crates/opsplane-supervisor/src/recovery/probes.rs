// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health probes for external collaborators and scenario detection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use opsplane_core::{Classify, ControlStore, ErrorKind, redact_url, retry_transient};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::scenarios::{
    APPLICATION_FAILURE, CACHE_FAILURE, CHAIN_RPC_FAILURE, DATABASE_FAILURE, INFRASTRUCTURE_FAILURE,
};

/// An external collaborator the control plane can probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    PrimaryStore,
    Cache,
    Application,
    ChainRpc,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::PrimaryStore => "primary_store",
            Component::Cache => "cache",
            Component::Application => "application",
            Component::ChainRpc => "chain_rpc",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// Could not reach the collaborator at all.
    #[error("unreachable: {0}")]
    Transport(String),

    /// Reached, but it answered with a failure.
    #[error("unhealthy: {0}")]
    Unhealthy(String),
}

impl Classify for ProbeError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Timeout(_) | ProbeError::Transport(_) => ErrorKind::Transient,
            ProbeError::Unhealthy(_) => ErrorKind::Internal,
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn component(&self) -> Component;

    async fn check(&self) -> Result<(), ProbeError>;
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub component: Component,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `SELECT 1` against the control store.
pub struct StoreProbe {
    store: Arc<dyn ControlStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn ControlStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Probe for StoreProbe {
    fn component(&self) -> Component {
        Component::PrimaryStore
    }

    async fn check(&self) -> Result<(), ProbeError> {
        self.store.ping().await.map_err(|e| match e.kind() {
            ErrorKind::Transient => ProbeError::Transport(e.to_string()),
            _ => ProbeError::Unhealthy(e.to_string()),
        })
    }
}

/// Redis `PING`.
pub struct CacheProbe {
    client: redis::Client,
}

impl CacheProbe {
    pub fn new(url: &str) -> Result<Self, ProbeError> {
        let client = redis::Client::open(url)
            .map_err(|e| ProbeError::Unhealthy(format!("invalid cache URL {}: {e}", redact_url(url))))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for CacheProbe {
    fn component(&self) -> Component {
        Component::Cache
    }

    async fn check(&self) -> Result<(), ProbeError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ProbeError::Unhealthy(e.to_string()))?;
        if pong.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy(format!("unexpected PING reply: {pong}")))
        }
    }
}

/// HTTP GET expecting a 2xx answer.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn component(&self) -> Component {
        Component::Application
    }

    async fn check(&self) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy(format!("HTTP {status}")))
        }
    }
}

/// Chain JSON-RPC `eth_blockNumber`.
pub struct ChainRpcProbe {
    client: reqwest::Client,
    url: String,
}

impl ChainRpcProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Probe for ChainRpcProbe {
    fn component(&self) -> Component {
        Component::ChainRpc
    }

    async fn check(&self) -> Result<(), ProbeError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Unhealthy(format!("HTTP {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProbeError::Unhealthy(format!("invalid JSON-RPC response: {e}")))?;
        if let Some(error) = body.get("error") {
            return Err(ProbeError::Unhealthy(format!("JSON-RPC error: {error}")));
        }
        match body.get("result").and_then(Value::as_str) {
            Some(block) => {
                debug!(block, "Chain RPC answered");
                Ok(())
            }
            None => Err(ProbeError::Unhealthy("JSON-RPC response without result".into())),
        }
    }
}

/// The configured probes, each bounded by a timeout and retried once on a
/// transient failure.
#[derive(Clone)]
pub struct ProbeSet {
    probes: Vec<Arc<dyn Probe>>,
    timeout: Duration,
}

impl ProbeSet {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            timeout,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn components(&self) -> Vec<Component> {
        self.probes.iter().map(|p| p.component()).collect()
    }

    /// Run every probe concurrently.
    pub async fn run_all(&self) -> Vec<ProbeResult> {
        join_all(self.probes.iter().map(|probe| self.run_one(probe.as_ref()))).await
    }

    async fn run_one(&self, probe: &dyn Probe) -> ProbeResult {
        let component = probe.component();
        let started = Instant::now();
        let timeout = self.timeout;
        let outcome = retry_transient(component.as_str(), || async move {
            match tokio::time::timeout(timeout, probe.check()).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(timeout)),
            }
        })
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => ProbeResult {
                component,
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(e) => {
                warn!(component = component.as_str(), error = %e, "Probe failed");
                ProbeResult {
                    component,
                    healthy: false,
                    latency_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Map probe results to a scenario id. Highest priority first:
///
/// | Condition | Scenario |
/// |-----------|----------|
/// | every probed component down (at least two) | `infrastructure_failure` |
/// | primary store down | `database_failure` |
/// | application down | `application_failure` |
/// | cache down | `cache_failure` |
/// | chain RPC down | `chain_rpc_failure` |
pub fn detect_scenario(results: &[ProbeResult]) -> Option<&'static str> {
    let down = |component: Component| {
        results
            .iter()
            .any(|r| r.component == component && !r.healthy)
    };

    if results.len() >= 2 && results.iter().all(|r| !r.healthy) {
        return Some(INFRASTRUCTURE_FAILURE);
    }
    [
        (Component::PrimaryStore, DATABASE_FAILURE),
        (Component::Application, APPLICATION_FAILURE),
        (Component::Cache, CACHE_FAILURE),
        (Component::ChainRpc, CHAIN_RPC_FAILURE),
    ]
    .into_iter()
    .find(|(component, _)| down(*component))
    .map(|(_, scenario)| scenario)
}
