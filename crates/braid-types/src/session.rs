// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::new_id;

/// A user message waiting to be injected into an in-flight stream.
///
/// Messages submitted while a session is already streaming are appended here
/// and drained as a single combined user turn when the current stream
/// reaches a natural stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

/// One conversation with one model configuration.
///
/// `next_todo_id` is a per-session monotonic counter; `updated_at` is bumped
/// on every mutation and is never earlier than `created_at`.
///
/// Wire format is camelCase, like every hand-written procedure schema in
/// the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub provider_id: String,
    pub model_id: String,
    /// Agent persona driving the system prompt.  Defaults to `"coder"`.
    pub agent_id: String,
    /// Ordered set of enabled rule ids appended to the system prompt.
    pub enabled_rule_ids: Vec<String>,
    /// When `None`, every registered tool is offered to the model.
    pub enabled_tool_ids: Option<Vec<String>>,
    pub next_todo_id: u64,
    #[serde(default)]
    pub flags: HashMap<String, bool>,
    /// Cached estimate of system prompt + tool descriptions, invalidated
    /// when the (model, agent, rules) triple changes.
    pub base_context_tokens: Option<u64>,
    pub total_tokens: u64,
    #[serde(default)]
    pub message_queue: Vec<QueuedMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: None,
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            agent_id: agent_id.into(),
            enabled_rule_ids: Vec::new(),
            enabled_tool_ids: None,
            next_todo_id: 1,
            flags: HashMap::new(),
            base_context_tokens: None,
            total_tokens: 0,
            message_queue: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`, keeping the `updated_at >= created_at` invariant
    /// even when the wall clock steps backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now.max(self.created_at);
    }

    /// Allocate the next session-local todo id.  Strictly increasing.
    pub fn take_todo_id(&mut self) -> u64 {
        let id = self.next_todo_id;
        self.next_todo_id += 1;
        id
    }

    /// Append a queued user message.
    pub fn enqueue_message(&mut self, text: impl Into<String>) {
        self.message_queue.push(QueuedMessage {
            text: text.into(),
            queued_at: Utc::now(),
        });
        self.touch();
    }

    /// Drain the message queue, combining all pending texts into one user
    /// turn separated by blank lines.  Returns `None` when the queue is empty.
    pub fn drain_queue(&mut self) -> Option<String> {
        if self.message_queue.is_empty() {
            return None;
        }
        let combined = self
            .message_queue
            .drain(..)
            .map(|m| m.text)
            .collect::<Vec<_>>()
            .join("\n\n");
        self.touch();
        Some(combined)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
