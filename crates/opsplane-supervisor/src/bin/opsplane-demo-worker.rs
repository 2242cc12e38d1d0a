// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! opsplane-demo-worker - reference worker for the supervisor
//!
//! Binds `PORT` with `SO_REUSEPORT` so several workers share a port,
//! answers every HTTP request with `200 OK`, reports health once a second
//! and honours `drain` by finishing in-flight requests before reporting
//! `drain_ready`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use opsplane_protocol::worker::WorkerEnv;
use opsplane_protocol::{FrameError, HealthReport, WorkerChannel};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 3\r\nconnection: close\r\n\r\nok\n";

#[derive(Default)]
struct Stats {
    requests: AtomicU64,
    errors: AtomicU64,
    /// Sum of response times in microseconds since the last health report.
    window_micros: AtomicU64,
    window_requests: AtomicU64,
    in_flight: AtomicUsize,
}

impl Stats {
    fn report(&self) -> HealthReport {
        let window = self.window_requests.swap(0, Ordering::Relaxed);
        let micros = self.window_micros.swap(0, Ordering::Relaxed);
        let response_time_ms = if window == 0 {
            0.0
        } else {
            micros as f64 / window as f64 / 1000.0
        };
        HealthReport {
            cpu: 0.0,
            memory_pct: 0.0,
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            response_time_ms,
        }
    }
}

fn bind_shared(port: u16) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Answer one request. `Ok(false)` when the peer closed before sending.
async fn answer<S>(stream: &mut S) -> std::io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    if stream.read(&mut buf).await? == 0 {
        return Ok(false);
    }
    stream.write_all(RESPONSE).await?;
    stream.shutdown().await?;
    Ok(true)
}

async fn serve(mut stream: TcpStream, stats: Arc<Stats>) {
    stats.in_flight.fetch_add(1, Ordering::SeqCst);
    let started = Instant::now();

    match answer(&mut stream).await {
        Ok(true) => {
            stats.requests.fetch_add(1, Ordering::Relaxed);
            stats
                .window_micros
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            stats.window_requests.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => debug!("Connection closed without a request"),
        Err(e) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Request failed");
        }
    }
    stats.in_flight.fetch_sub(1, Ordering::SeqCst);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsplane_demo_worker=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let env = WorkerEnv::from_env()?;
    let listener = bind_shared(env.port)?;
    let channel =
        Arc::new(WorkerChannel::connect(&env.socket_path, &env.worker_id, env.worker_index).await?);
    let stats = Arc::new(Stats::default());

    channel.online().await?;
    info!(worker_id = %env.worker_id, index = env.worker_index, port = env.port, "Demo worker online");

    let health_task = {
        let channel = channel.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = channel.health(stats.report()).await {
                    debug!(error = %e, "Health report not delivered");
                    return;
                }
            }
        })
    };

    let drain_requested = Arc::new(Notify::new());
    let recv_task = {
        let channel = channel.clone();
        let drain_requested = drain_requested.clone();
        tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Ok(message) if message.is_drain() => drain_requested.notify_one(),
                    Ok(_) => {}
                    Err(FrameError::ConnectionClosed) => return,
                    Err(e) => {
                        warn!(error = %e, "Supervisor channel failed");
                        return;
                    }
                }
            }
        })
    };

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let draining = loop {
        tokio::select! {
            biased;
            _ = term.recv() => break false,
            _ = int.recv() => break false,
            _ = drain_requested.notified() => break true,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve(stream, stats.clone()));
                }
                Err(e) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Accept failed");
                }
            },
        }
    };
    drop(listener);

    if draining {
        info!("Draining");
        while stats.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if let Err(e) = channel.drain_ready().await {
            debug!(error = %e, "drain_ready not delivered");
        }
        // The supervisor answers drain_ready with SIGTERM.
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    }

    health_task.abort();
    recv_task.abort();
    info!(requests = stats.requests.load(Ordering::Relaxed), "Demo worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_gets_response() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        assert!(answer(&mut server).await.unwrap());
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, RESPONSE);
    }

    #[tokio::test]
    async fn test_closed_connection_gets_no_response() {
        let (client, mut server) = tokio::io::duplex(8192);
        drop(client);

        assert!(!answer(&mut server).await.unwrap());
    }

    #[test]
    fn test_report_resets_window() {
        let stats = Stats::default();
        stats.requests.store(4, Ordering::Relaxed);
        stats.window_requests.store(2, Ordering::Relaxed);
        stats.window_micros.store(3_000, Ordering::Relaxed);

        let report = stats.report();
        assert_eq!(report.requests, 4);
        assert!((report.response_time_ms - 1.5).abs() < f64::EPSILON);
        assert_eq!(stats.report().response_time_ms, 0.0);
    }
}
