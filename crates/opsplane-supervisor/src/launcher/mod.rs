// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker launchers.
//!
//! The pool actor starts workers through the [`Launcher`] trait:
//! - [`ProcessLauncher`]: OS child processes with Unix-socket IPC
//! - [`MockLauncher`]: simulated workers for tests

pub mod mock;
pub mod process;
pub mod traits;

pub use mock::MockLauncher;
pub use process::{IpcHub, ProcessLauncher};
pub use traits::*;
