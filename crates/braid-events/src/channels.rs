// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Channel naming conventions.
//!
//! Channels are plain strings matched exactly by the broker — no wildcards.
//! The `:`-separated names below are the complete set the runtime publishes
//! on.  Constructors exist so call sites never format channel names by hand.

/// Global session-list updates (`session-created`, `session-deleted`,
/// `session-compacted`).
pub const SESSIONS: &str = "sessions";

/// Bash process lifecycle (`bash-output`, `bash-status`, `bash-exit`).
pub const BASH_ALL: &str = "bash:all";

/// Configuration change events.
pub const CONFIG: &str = "config:all";

/// Application-level events (startup, shutdown).
pub const APP: &str = "app:all";

/// Model-level updates for one session (`session-updated`, `session-deleted`).
pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Fine-grained streaming events feeding a live session view.
pub fn session_stream(session_id: &str) -> String {
    format!("session-stream:{session_id}")
}

/// Per-message part updates, mirrored from the session stream for targeted
/// subscriptions.
pub fn message(message_id: &str) -> String {
    format!("message:{message_id}")
}
