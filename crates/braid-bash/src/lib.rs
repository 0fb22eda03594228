// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shell process lifecycle manager.
//!
//! Two pools: a single-slot "active" pool for the interactive shell the
//! user is watching, and an unbounded background pool.  Active requests
//! that find the slot occupied join a strict FIFO queue together with
//! promotion requests; every release of the slot (exit, kill, demote)
//! grants the next waiter.  Output is buffered per process and mirrored as
//! `bash-output` / `bash-status` / `bash-exit` events on `bash:all`.

mod manager;
mod process;

pub use manager::{BashError, BashManager, ExecuteOptions};
pub use process::{BashMode, BashProcess, BashStatus};
