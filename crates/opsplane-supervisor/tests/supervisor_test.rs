// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool actor tests driven through the mock launcher.

mod common;

use std::time::Duration;

use common::{eventually, fast_pool, start_pool, wait_for_status};
use nix::sys::signal::Signal;
use opsplane_core::OpsEvent;
use opsplane_protocol::HealthReport;
use opsplane_supervisor::SupervisorError;
use opsplane_supervisor::autoscale::{AutoscaleConfig, Autoscaler, TickOutcome};
use opsplane_supervisor::launcher::{ExitStatus, MockLauncher};
use opsplane_supervisor::pool::PoolConfig;
use opsplane_supervisor::worker::WorkerStatus;

const WAIT: Duration = Duration::from_secs(5);

fn hot() -> HealthReport {
    HealthReport {
        cpu: 90.0,
        memory_pct: 40.0,
        requests: 10,
        errors: 0,
        response_time_ms: 50.0,
    }
}

#[tokio::test]
async fn test_boot_and_autoscale_up_with_hysteresis() {
    let config = PoolConfig {
        min_workers: 2,
        max_workers: 6,
        ..fast_pool(2)
    };
    let pool = start_pool(config, MockLauncher::new());
    wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;

    let mut autoscaler = Autoscaler::new(
        pool.handle.clone(),
        AutoscaleConfig {
            cpu_threshold: 80.0,
            min_workers: 2,
            max_workers: 6,
            ..Default::default()
        },
    );

    pool.launcher.broadcast_health(hot()).await;
    wait_for_status(&pool.handle, WAIT, |s| s.metrics.avg_cpu > 80.0).await;
    match autoscaler.tick().await {
        TickOutcome::ScaledUp(worker) => {
            assert_eq!(worker.index, 2);
            assert_eq!(worker.port, 3000);
        }
        other => panic!("expected scale up, got {other:?}"),
    }
    wait_for_status(&pool.handle, WAIT, |s| s.online == 3).await;

    // Still hot, but the window after an action is skipped.
    pool.launcher.broadcast_health(hot()).await;
    assert_eq!(autoscaler.tick().await, TickOutcome::Settling);
    assert_eq!(pool.handle.status().await.unwrap().live, 3);

    let ports: Vec<u16> = pool.launcher.launches().await.iter().map(|l| l.port).collect();
    assert_eq!(ports, vec![3000, 3001, 3000]);

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_autoscale_never_exceeds_max_workers() {
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 2,
        ..fast_pool(2)
    };
    let pool = start_pool(config, MockLauncher::new());
    wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;

    let mut autoscaler = Autoscaler::new(
        pool.handle.clone(),
        AutoscaleConfig {
            min_workers: 1,
            max_workers: 2,
            ..Default::default()
        },
    );
    pool.launcher.broadcast_health(hot()).await;
    wait_for_status(&pool.handle, WAIT, |s| s.metrics.avg_cpu > 80.0).await;

    assert_eq!(autoscaler.tick().await, TickOutcome::Held);
    assert!(matches!(
        pool.handle.scale_up().await,
        Err(SupervisorError::AtMaxWorkers(2))
    ));

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_worker_is_replaced_on_same_index() {
    let config = PoolConfig {
        ports: vec![3000, 3001, 3002],
        health_interval: Duration::from_millis(100),
        ..fast_pool(3)
    };
    let pool = start_pool(config, MockLauncher::new());
    let mut events = pool.events.subscribe();
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 3).await;
    let silent = status
        .workers
        .iter()
        .find(|w| w.index == 1)
        .expect("worker at index 1")
        .clone();

    // Everyone except the original index-1 worker keeps reporting.
    let reporter = {
        let launcher = pool.launcher.clone();
        let silent_id = silent.id.clone();
        tokio::spawn(async move {
            loop {
                for worker in launcher.live_workers().await {
                    if worker.spec.worker_id != silent_id {
                        launcher.send_health(&worker.spec.worker_id, HealthReport::default()).await;
                    }
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        })
    };

    let replaced = wait_for_status(&pool.handle, WAIT, |s| {
        s.workers
            .iter()
            .any(|w| w.index == 1 && w.id != silent.id && w.status == WorkerStatus::Online)
    })
    .await;
    let replacement = replaced.workers.iter().find(|w| w.index == 1).unwrap();
    assert_eq!(replacement.port, silent.port);
    assert!(replaced.get(&silent.id).is_none());

    let old = pool.launcher.worker(&silent.id).await.unwrap();
    assert_eq!(old.signals.first(), Some(&Signal::SIGTERM));

    let mut saw_unresponsive = false;
    while let Ok(envelope) = events.try_recv() {
        if let OpsEvent::WorkerUnresponsive { worker_id, index } = envelope.event {
            assert_eq!(worker_id, silent.id);
            assert_eq!(index, 1);
            saw_unresponsive = true;
        }
    }
    assert!(saw_unresponsive);

    reporter.abort();
    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_crashed_worker_restarts_in_its_slot() {
    let pool = start_pool(fast_pool(2), MockLauncher::new());
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;
    let victim = status.workers[0].clone();

    assert!(pool.launcher.exit(&victim.id, ExitStatus::code(137)).await);

    let status = wait_for_status(&pool.handle, WAIT, |s| {
        s.online == 2 && s.get(&victim.id).is_none()
    })
    .await;
    let indices: Vec<u32> = status.workers.iter().map(|w| w.index).collect();
    assert_eq!(indices, vec![0, 1]);

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_pending_restart_counts_toward_max_workers() {
    let config = PoolConfig {
        max_workers: 3,
        restart_delay: Duration::from_millis(300),
        ..fast_pool(3)
    };
    let pool = start_pool(config, MockLauncher::new());
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 3).await;
    let victim = status.workers[1].clone();

    assert!(pool.launcher.exit(&victim.id, ExitStatus::code(1)).await);
    let status = wait_for_status(&pool.handle, WAIT, |s| s.restarting == 1).await;
    assert_eq!(status.live, 3);

    assert!(matches!(
        pool.handle.scale_up().await,
        Err(SupervisorError::AtMaxWorkers(3))
    ));

    let status = wait_for_status(&pool.handle, WAIT, |s| {
        s.online == 3 && s.restarting == 0
    })
    .await;
    assert_eq!(status.live, 3);
    let indices: Vec<u32> = status.workers.iter().map(|w| w.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(pool.launcher.launches().await.len(), 4);

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_reload_takes_over_pending_restart() {
    let config = PoolConfig {
        restart_delay: Duration::from_millis(400),
        ..fast_pool(2)
    };
    let pool = start_pool(config, MockLauncher::new());
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;
    let crashed = status.workers[0].clone();

    assert!(pool.launcher.exit(&crashed.id, ExitStatus::code(1)).await);
    wait_for_status(&pool.handle, WAIT, |s| s.restarting == 1).await;

    let report = pool.handle.reload().await.unwrap();
    assert_eq!(report.replaced.len(), 1);
    assert_eq!(report.started.len(), 2);

    // Past the original restart delay the cancelled restart must not fire.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 2 && s.draining == 0).await;
    assert_eq!(status.live, 2);
    assert_eq!(status.restarting, 0);
    let indices: Vec<u32> = status.workers.iter().map(|w| w.index).collect();
    assert_eq!(indices, vec![2, 3]);
    assert_eq!(pool.launcher.launches().await.len(), 4);

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_crash_loop_becomes_fatal() {
    let pool = start_pool(fast_pool(1), MockLauncher::crash_looping());

    let reason = tokio::time::timeout(WAIT, pool.handle.fatal())
        .await
        .expect("fatal within timeout");
    assert!(reason.contains("slot 0"), "reason: {reason}");

    let launches = pool.launcher.launches().await;
    assert_eq!(launches.len(), 3);
    assert!(launches.iter().all(|l| l.index == 0));
    assert!(pool.handle.fatal_reason().is_some());

    // No further restarts once fatal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.launcher.launches().await.len(), 3);

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_reload_replaces_every_worker() {
    let pool = start_pool(fast_pool(2), MockLauncher::new());
    let before = wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;
    let old_ids: Vec<String> = before.workers.iter().map(|w| w.id.clone()).collect();

    let mut events = pool.events.subscribe();
    let watcher = {
        let handle = pool.handle.clone();
        tokio::spawn(async move {
            let mut min_online = usize::MAX;
            while let Ok(status) = handle.status().await {
                if !status.reloading && min_online != usize::MAX {
                    break;
                }
                if status.reloading {
                    min_online = min_online.min(status.online);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            min_online
        })
    };

    let report = pool.handle.reload().await.unwrap();
    assert_eq!(report.replaced, old_ids);
    assert_eq!(report.started.len(), 2);
    assert!(report.not_online.is_empty());
    assert!(report.lingering.is_empty());

    let after = wait_for_status(&pool.handle, WAIT, |s| s.online == 2 && s.draining == 0).await;
    let indices: Vec<u32> = after.workers.iter().map(|w| w.index).collect();
    assert_eq!(indices, vec![2, 3]);
    assert!(after.workers.iter().all(|w| !old_ids.contains(&w.id)));
    assert!(!after.reloading);

    let min_online = watcher.await.unwrap();
    assert!(min_online >= 2, "online dropped to {min_online} during reload");

    let mut started = false;
    let mut completed = false;
    while let Ok(envelope) = events.try_recv() {
        match envelope.event {
            OpsEvent::ReloadStarted { replacing } => {
                assert_eq!(replacing, 2);
                started = true;
            }
            OpsEvent::ReloadCompleted { replaced } => {
                assert_eq!(replaced, 2);
                completed = true;
            }
            _ => {}
        }
    }
    assert!(started && completed);

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_operator_scaling_rejected_during_reload() {
    let config = PoolConfig {
        warmup_interval: Duration::from_millis(300),
        ..fast_pool(1)
    };
    let pool = start_pool(config, MockLauncher::new());
    wait_for_status(&pool.handle, WAIT, |s| s.online == 1).await;

    let reload = {
        let handle = pool.handle.clone();
        tokio::spawn(async move { handle.reload().await })
    };
    wait_for_status(&pool.handle, WAIT, |s| s.reloading).await;

    assert!(matches!(
        pool.handle.scale_up().await,
        Err(SupervisorError::ReloadInProgress)
    ));
    assert!(matches!(
        pool.handle.reload().await,
        Err(SupervisorError::ReloadInProgress)
    ));

    reload.await.unwrap().unwrap();
    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_scale_down_drains_least_busy_worker() {
    let config = PoolConfig {
        warmup_interval: Duration::ZERO,
        ..fast_pool(3)
    };
    let pool = start_pool(config, MockLauncher::new());
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 3).await;

    for (worker, requests) in status.workers.iter().zip([5u64, 1, 9]) {
        pool.launcher
            .send_health(
                &worker.id,
                HealthReport {
                    requests,
                    ..Default::default()
                },
            )
            .await;
    }
    wait_for_status(&pool.handle, WAIT, |s| s.metrics.total_requests == 15).await;

    let drained = pool.handle.scale_down().await.unwrap();
    assert_eq!(drained.index, 1);
    wait_for_status(&pool.handle, WAIT, |s| s.live == 2 && s.get(&drained.id).is_none()).await;

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_scale_down_stops_at_min_workers() {
    let config = PoolConfig {
        min_workers: 2,
        ..fast_pool(2)
    };
    let pool = start_pool(config, MockLauncher::new());
    wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;

    assert!(matches!(
        pool.handle.scale_down().await,
        Err(SupervisorError::AtMinWorkers(2))
    ));

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_forward_signal_reaches_every_worker() {
    let pool = start_pool(fast_pool(2), MockLauncher::new());
    wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;

    let delivered = pool.handle.forward_signal(Signal::SIGUSR1).await.unwrap();
    assert_eq!(delivered, 2);
    for worker in pool.launcher.live_workers().await {
        assert_eq!(worker.signals, vec![Signal::SIGUSR1]);
    }

    pool.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let pool = start_pool(fast_pool(2), MockLauncher::new());
    wait_for_status(&pool.handle, WAIT, |s| s.online == 2).await;

    let first = pool.handle.shutdown().await;
    assert_eq!(first.workers, 2);
    assert_eq!(first.graceful, 2);
    assert_eq!(first.forced, 0);
    assert!(pool.handle.is_shut_down());

    let second = pool.handle.shutdown().await;
    assert_eq!(first, second);

    pool.task.await.unwrap();
    assert!(matches!(
        pool.handle.scale_up().await,
        Err(SupervisorError::Stopped)
    ));
    assert!(pool.launcher.live_workers().await.is_empty());
}

#[tokio::test]
async fn test_stubborn_worker_is_killed_after_graceful_timeout() {
    let config = PoolConfig {
        graceful_timeout: Duration::from_millis(100),
        ..fast_pool(1)
    };
    let pool = start_pool(config, MockLauncher::stubborn());
    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 1).await;
    let worker_id = status.workers[0].id.clone();

    let report = tokio::time::timeout(WAIT, pool.handle.shutdown())
        .await
        .expect("shutdown within timeout");
    assert_eq!(report.workers, 1);
    assert_eq!(report.forced, 1);
    assert_eq!(report.graceful, 0);

    let worker = pool.launcher.worker(&worker_id).await.unwrap();
    assert!(!worker.alive);
    assert!(worker.messages.iter().any(|m| m.is_drain()));
    assert_eq!(worker.signals.last(), Some(&Signal::SIGKILL));
}

#[tokio::test]
async fn test_silent_worker_stays_starting_until_online() {
    let pool = start_pool(fast_pool(1), MockLauncher::silent());
    let status = wait_for_status(&pool.handle, WAIT, |s| s.starting == 1).await;
    let worker_id = status.workers[0].id.clone();
    assert_eq!(status.online, 0);

    let launcher = pool.launcher.clone();
    let id = worker_id.clone();
    eventually(WAIT, "online message delivered", move || {
        let launcher = launcher.clone();
        let id = id.clone();
        async move { launcher.send_online(&id).await }
    })
    .await;

    let status = wait_for_status(&pool.handle, WAIT, |s| s.online == 1).await;
    assert_eq!(status.workers[0].id, worker_id);

    pool.handle.shutdown().await;
}
