// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BashMode {
    /// Holds (or is waiting for) the single interactive slot.
    #[default]
    Active,
    /// Runs immediately, unconstrained.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BashStatus {
    /// Active-mode process waiting in the FIFO queue for the slot.  Not yet
    /// spawned, so it never counts against the single-running invariant.
    Queued,
    Running,
    /// Exit code 0.
    Completed,
    /// Non-zero exit code or spawn failure.
    Failed,
    /// SIGKILL issued by the manager on request.
    Killed,
    /// The per-process timeout elapsed; the manager killed it.
    Timeout,
}

impl BashStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BashStatus::Queued | BashStatus::Running)
    }
}

/// Snapshot of one managed shell process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashProcess {
    pub id: String,
    pub command: String,
    pub mode: BashMode,
    pub status: BashStatus,
    pub cwd: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}
