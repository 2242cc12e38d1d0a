// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime and control socket tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_pool, wait_for_status};
use opsplane_core::Environment;
use opsplane_protocol::ControlRequest;
use opsplane_supervisor::control;
use opsplane_supervisor::launcher::MockLauncher;
use opsplane_supervisor::runtime::{StopReason, SupervisorRuntime};
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(5);

async fn start_runtime(
    launcher: MockLauncher,
    socket: &std::path::Path,
) -> SupervisorRuntime {
    SupervisorRuntime::builder()
        .pool_config(fast_pool(2))
        .launcher(Arc::new(launcher))
        .environment(Environment::Staging)
        .control_socket(socket)
        .handle_signals(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_builder_requires_launcher() {
    let err = SupervisorRuntime::builder().build().err().unwrap();
    assert!(err.to_string().contains("launcher is required"));
}

#[tokio::test]
async fn test_status_over_control_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let runtime = start_runtime(MockLauncher::new(), &socket).await;
    wait_for_status(&runtime.handle(), WAIT, |s| s.online == 2).await;

    let response = control::request(&socket, &ControlRequest::status()).await.unwrap();
    assert!(response.ok, "error: {:?}", response.error);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["environment"], "staging");
    assert_eq!(body["pid"], std::process::id());
    assert_eq!(body["pool"]["online"], 2);
    assert_eq!(body["pool"]["ports"], serde_json::json!([3000, 3001]));

    runtime.shutdown().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_reload_over_control_socket_waits_for_completion() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let runtime = start_runtime(MockLauncher::new(), &socket).await;
    wait_for_status(&runtime.handle(), WAIT, |s| s.online == 2).await;

    let response = control::request(&socket, &ControlRequest::reload()).await.unwrap();
    assert!(response.ok, "error: {:?}", response.error);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["reload"]["replaced"].as_array().unwrap().len(), 2);
    assert_eq!(body["reload"]["not_online"], serde_json::json!([]));

    let status = runtime.handle().status().await.unwrap();
    assert!(!status.reloading);
    assert_eq!(status.online, 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_request_stops_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let runtime = start_runtime(MockLauncher::new(), &socket).await;
    wait_for_status(&runtime.handle(), WAIT, |s| s.online == 2).await;

    let response = control::request(&socket, &ControlRequest::shutdown()).await.unwrap();
    assert!(response.ok);

    let reason = tokio::time::timeout(WAIT, runtime.wait()).await.unwrap();
    assert_eq!(reason, StopReason::Requested);

    let handle = runtime.handle();
    let report = runtime.shutdown().await;
    assert_eq!(report.workers, 2);
    assert_eq!(report.forced, 0);
    assert_eq!(handle.shutdown().await, report);
}

#[tokio::test]
async fn test_fatal_pool_ends_wait() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let runtime = start_runtime(MockLauncher::crash_looping(), &socket).await;

    match tokio::time::timeout(WAIT, runtime.wait()).await.unwrap() {
        StopReason::Fatal(reason) => assert!(reason.contains("failed to start")),
        other => panic!("expected fatal stop, got {other:?}"),
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    std::fs::write(&socket, b"left over").unwrap();

    let runtime = start_runtime(MockLauncher::new(), &socket).await;
    let response = control::request(&socket, &ControlRequest::status()).await.unwrap();
    assert!(response.ok);
    runtime.shutdown().await;
}
