// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opsplane Supervisor - worker pool and recovery orchestration
//!
//! This crate runs the application as a pool of identical worker processes
//! behind a fixed set of ports, keeps the pool sized to load, replaces it
//! without downtime on reload, and drives disaster-recovery scenarios.
//!
//! # Architecture
//!
//! ```text
//!  signals ─┐   opsplane-ctl ──► control socket
//!           ▼                        │
//! ┌──────────────────────────────────┼───────────────────────┐
//! │                 SupervisorRuntime│                       │
//! │  SignalRouter ──► SupervisorHandle ◄── Autoscaler        │
//! │                        │                                 │
//! │                        ▼                                 │
//! │                 pool actor (Supervisor) ──► EventBus     │
//! │                        │                                 │
//! │                        ▼                                 │
//! │                    Launcher ──► IpcHub (Unix socket)     │
//! └────────────────────────┼─────────────────────────────────┘
//!                          ▼
//!           worker 0 :3000   worker 1 :3001   ...
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`pool`] | Pool actor owning every worker record |
//! | [`autoscale`] | Periodic scale decisions from aggregated health |
//! | [`reload`] | Staggered zero-downtime replacement |
//! | [`signals`] | Process signal routing |
//! | [`control`] | Operator control socket |
//! | [`launcher`] | Worker process launchers |
//! | [`recovery`] | Disaster-recovery scenarios, probes and runs |
//! | [`runtime`] | Embeddable runtime wiring all of the above |

pub mod autoscale;
pub mod config;
pub mod control;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod pool;
pub mod recovery;
pub mod reload;
pub mod runtime;
pub mod signals;
pub mod worker;

pub use error::SupervisorError;
pub use pool::{PoolConfig, PoolStatus, ShutdownReport, Supervisor, SupervisorHandle};
pub use runtime::{StopReason, SupervisorRuntime};
