// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP probes and the alert webhook against a mock server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opsplane_supervisor::recovery::probes::{ChainRpcProbe, HttpProbe};
use opsplane_supervisor::recovery::{Alert, AlertKind, AlertSink, Component, Probe, ProbeSet, WebhookSink};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_http_probe_healthy_on_2xx() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let probe = HttpProbe::new(client(), format!("{}/health", server.uri()));
    assert_eq!(probe.component(), Component::Application);
    assert!(probe.check().await.is_ok());
}

#[tokio::test]
async fn test_http_probe_unhealthy_on_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let probes = ProbeSet::new(Duration::from_secs(2)).with_probe(Arc::new(HttpProbe::new(
        client(),
        format!("{}/health", server.uri()),
    )));
    let results = probes.run_all().await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].healthy);
    assert!(results[0].error.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn test_chain_rpc_probe_reads_block_number() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": "0x10d4f"
        })))
        .mount(&server)
        .await;

    let probe = ChainRpcProbe::new(client(), server.uri());
    assert!(probe.check().await.is_ok());
}

#[tokio::test]
async fn test_chain_rpc_error_is_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "header not found" }
        })))
        .mount(&server)
        .await;

    let probe = ChainRpcProbe::new(client(), server.uri());
    let err = probe.check().await.unwrap_err();
    assert!(err.to_string().contains("header not found"));
}

fn alert() -> Alert {
    Alert {
        kind: AlertKind::RecoveryFailed,
        scenario: "database_failure".into(),
        severity: "critical".into(),
        run_id: "run-1".into(),
        completed_steps: vec!["probe".into()],
        failed_steps: vec!["restore".into()],
        error: Some("step restore failed: exit status 1".into()),
        at: Utc::now(),
    }
}

#[tokio::test]
async fn test_webhook_posts_alert_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/ops"))
        .and(body_partial_json(json!({
            "type": "recovery_failed",
            "scenario": "database_failure",
            "failed_steps": ["restore"]
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let sink = WebhookSink::new(format!("{}/hooks/ops", server.uri()), Duration::from_secs(2)).unwrap();
    sink.send(&alert()).await.unwrap();
}

#[tokio::test]
async fn test_webhook_rejection_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let sink = WebhookSink::new(server.uri(), Duration::from_secs(2)).unwrap();
    let err = sink.send(&alert()).await.unwrap_err();
    assert!(err.to_string().contains("500"));
}
