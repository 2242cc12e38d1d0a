// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process signal routing for the supervisor.
//!
//! `INT` and `TERM` begin graceful shutdown, `HUP` begins a reload, and
//! every other catchable signal in [`FORWARDED`] is delivered to every
//! worker unchanged. `CHLD` stays with the runtime for child reaping and
//! `PIPE` is ignored; `KILL` and `STOP` cannot be caught.

use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::pool::SupervisorHandle;

/// Signals relayed to workers.
pub const FORWARDED: [Signal; 7] = [
    Signal::SIGQUIT,
    Signal::SIGALRM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
    Signal::SIGTSTP,
    Signal::SIGCONT,
];

/// What the supervisor does with a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    Reload,
    Forward(Signal),
}

pub fn action_for(signal: Signal) -> SignalAction {
    match signal {
        Signal::SIGINT | Signal::SIGTERM => SignalAction::Shutdown,
        Signal::SIGHUP => SignalAction::Reload,
        other => SignalAction::Forward(other),
    }
}

/// Background task translating process signals into pool operations.
pub struct SignalRouter {
    handle: SupervisorHandle,
    shutdown_requested: Arc<Notify>,
    stop: Arc<Notify>,
}

impl SignalRouter {
    /// `shutdown_requested` is notified on `INT`/`TERM`.
    pub fn new(handle: SupervisorHandle, shutdown_requested: Arc<Notify>) -> Self {
        Self {
            handle,
            shutdown_requested,
            stop: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to stop the router.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Install handlers and route signals until stopped.
    pub async fn run(self) -> std::io::Result<()> {
        let (tx, mut rx) = mpsc::channel(32);
        let mut listeners = Vec::new();
        let routed = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP]
            .into_iter()
            .chain(FORWARDED);
        for sig in routed {
            let mut stream = signal(SignalKind::from_raw(sig as i32))?;
            let tx = tx.clone();
            listeners.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    if tx.send(sig).await.is_err() {
                        return;
                    }
                }
            }));
        }
        drop(tx);

        info!(forwarded = FORWARDED.len(), "Signal handlers installed");

        loop {
            let received = tokio::select! {
                biased;

                _ = self.stop.notified() => break,
                received = rx.recv() => match received {
                    Some(sig) => sig,
                    None => break,
                },
            };
            debug!(signal = %received, "Signal received");
            self.dispatch(received).await;
        }

        for listener in listeners {
            listener.abort();
        }
        Ok(())
    }

    async fn dispatch(&self, received: Signal) {
        match action_for(received) {
            SignalAction::Shutdown => {
                info!(signal = %received, "Shutdown signal received");
                self.shutdown_requested.notify_one();
            }
            SignalAction::Reload => {
                info!("SIGHUP received, reloading workers");
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    match handle.reload().await {
                        Ok(report) => info!(
                            replaced = report.replaced.len(),
                            started = report.started.len(),
                            "SIGHUP reload finished"
                        ),
                        Err(e) => warn!(error = %e, "SIGHUP reload rejected"),
                    }
                });
            }
            SignalAction::Forward(signal) => {
                if let Err(e) = self.handle.forward_signal(signal).await {
                    warn!(signal = %signal, error = %e, "Failed to forward signal");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_contract() {
        assert_eq!(action_for(Signal::SIGINT), SignalAction::Shutdown);
        assert_eq!(action_for(Signal::SIGTERM), SignalAction::Shutdown);
        assert_eq!(action_for(Signal::SIGHUP), SignalAction::Reload);
        assert_eq!(
            action_for(Signal::SIGUSR2),
            SignalAction::Forward(Signal::SIGUSR2)
        );
    }

    #[test]
    fn test_forwarded_set_excludes_routed_and_runtime_signals() {
        for sig in FORWARDED {
            assert_eq!(action_for(sig), SignalAction::Forward(sig));
        }
        assert!(FORWARDED.contains(&Signal::SIGQUIT));
        assert!(FORWARDED.contains(&Signal::SIGALRM));
        for reserved in [
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGCHLD,
            Signal::SIGPIPE,
        ] {
            assert!(!FORWARDED.contains(&reserved), "{reserved} must not be forwarded");
        }
    }
}
