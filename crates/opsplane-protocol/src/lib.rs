// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opsplane Protocol - framed Protobuf messages over Unix sockets
//!
//! This crate provides the wire protocol for communication between:
//! - Worker processes and the supervisor (worker IPC)
//! - The operator CLI and the supervisor (control socket)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    opsplane-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: Hello / WorkerMessage / SupervisorMessage /      │
//! │            ControlRequest / ControlResponse                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost derives)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: u32 length + u16 type, read_exact reassembly      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: Unix domain sockets (tokio)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Worker usage
//!
//! ```ignore
//! use opsplane_protocol::worker::WorkerChannel;
//! use opsplane_protocol::messages::HealthReport;
//!
//! let channel = WorkerChannel::from_env().await?;
//! channel.online().await?;
//! channel.health(HealthReport { cpu: 12.0, ..Default::default() }).await?;
//!
//! let msg = channel.recv().await?;
//! if msg.is_drain() {
//!     // stop accepting, finish in-flight work
//!     channel.drain_ready().await?;
//! }
//! ```

pub mod frame;
pub mod messages;
pub mod worker;

pub use frame::{Frame, FrameError, FramedStream, MAX_FRAME_SIZE, MessageType};
pub use messages::{
    ControlRequest, ControlResponse, HealthReport, Hello, SupervisorMessage, WorkerMessage,
};
pub use worker::WorkerChannel;
