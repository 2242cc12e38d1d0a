// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opsplane Core - locks, migrations and audit persistence
//!
//! This crate holds the parts of the control plane that coordinate through
//! the relational store. Processes that share a store never share memory;
//! every cross-process guarantee is expressed as a row in one of the control
//! tables.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐   ┌───────────────────────┐
//! │   opsplane-ctl (CLI)  │   │  opsplane supervisor  │
//! └───────────┬───────────┘   └───────────┬───────────┘
//!             │                           │
//!             ▼                           ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                   opsplane-core                     │
//! │  MigrationEngine ──► LockRegistry ──► ControlStore  │
//! │        │                                  ▲         │
//! │        └──────────── EventBus             │         │
//! └───────────────────────────────────────────┼─────────┘
//!                                             ▼
//!                               ┌──────────────────────────┐
//!                               │  PostgreSQL / SQLite     │
//!                               │  resource_locks          │
//!                               │  lock_evictions          │
//!                               │  migration_history       │
//!                               │  recovery_runs / _steps  │
//!                               └──────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`persistence`] | `ControlStore` trait with PostgreSQL and SQLite backends |
//! | [`locks`] | Named exclusive locks with stale-holder eviction |
//! | [`migrate`] | Catalog loading, apply, rollback, status and verify |
//! | [`events`] | Typed operational events and the fan-out bus |
//! | [`error`] | Error kinds, exit codes and the single transient retry |
//! | [`schema`] | Embedded schema for the control tables |

pub mod environment;
pub mod error;
pub mod events;
pub mod locks;
pub mod migrate;
pub mod persistence;
pub mod redact;
pub mod schema;

pub use environment::Environment;
pub use error::{Classify, ErrorKind, StoreError, retry_transient};
pub use events::{EventBus, EventEnvelope, OpsEvent};
pub use locks::{Holder, LockError, LockGuard, LockRegistry, LockToken};
pub use migrate::{MigrationConfig, MigrationEngine, MigrationError};
pub use persistence::{ControlStore, connect};
pub use redact::redact_url;
