// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Removed,
}

/// One item in a session's todo list.
///
/// The UI status line expects at most one `InProgress` todo per session —
/// the store does not enforce this, the todo tool does.  `completed_at` is
/// set iff `status == Completed`.
///
/// Field keys are camelCase on the wire; status *values* stay snake_case
/// (`in_progress`), matching the procedure schemas that accept them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    /// Session-local integer id, allocated from `Session::next_todo_id`.
    pub id: u64,
    pub session_id: String,
    pub content: String,
    /// Present-continuous description shown while the todo is in progress.
    pub active_form: String,
    pub status: TodoStatus,
    pub ordering: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Todo {
    pub fn new(
        id: u64,
        session_id: impl Into<String>,
        content: impl Into<String>,
        active_form: impl Into<String>,
        ordering: u64,
    ) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            content: content.into(),
            active_form: active_form.into(),
            status: TodoStatus::Pending,
            ordering,
            created_at: Utc::now(),
            completed_at: None,
            metadata: None,
        }
    }

    /// Transition status, maintaining the `completed_at` invariant.
    pub fn set_status(&mut self, status: TodoStatus) {
        self.status = status;
        self.completed_at = match status {
            TodoStatus::Completed => Some(Utc::now()),
            _ => None,
        };
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_todo_is_pending_without_completion_time() {
        let t = Todo::new(1, "s1", "write tests", "Writing tests", 0);
        assert_eq!(t.status, TodoStatus::Pending);
        assert!(t.completed_at.is_none());
    }

    #[test]
    fn completing_sets_completed_at() {
        let mut t = Todo::new(1, "s1", "x", "Doing x", 0);
        t.set_status(TodoStatus::Completed);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn reopening_clears_completed_at() {
        let mut t = Todo::new(1, "s1", "x", "Doing x", 0);
        t.set_status(TodoStatus::Completed);
        t.set_status(TodoStatus::InProgress);
        assert!(t.completed_at.is_none());
    }

    #[test]
    fn status_serialises_as_snake_case() {
        let s = serde_json::to_string(&TodoStatus::InProgress).unwrap();
        assert_eq!(s, "\"in_progress\"");
    }
}
