// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session ask queue.
//!
//! The ask tool lets the model put a question to the user and block until
//! the `message.answerAsk` mutation delivers the answer.  The queue is
//! ephemeral, in-memory, and destroyed with the session: deleting or
//! compacting a session fails every outstanding ask so blocked tool calls
//! return promptly.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::oneshot;

use braid_types::new_id;

/// One outstanding question, as shown to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAsk {
    pub id: String,
    pub session_id: String,
    pub question: String,
    pub options: Vec<String>,
}

struct Waiting {
    ask: PendingAsk,
    answer_tx: oneshot::Sender<String>,
}

#[derive(Default)]
pub struct AskRegistry {
    by_session: Mutex<HashMap<String, Vec<Waiting>>>,
}

impl AskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a question.  Returns the ask descriptor and the receiver
    /// the tool blocks on.  The receiver errors when the ask is cleared.
    pub fn ask(
        &self,
        session_id: &str,
        question: &str,
        options: Vec<String>,
    ) -> (PendingAsk, oneshot::Receiver<String>) {
        let (answer_tx, answer_rx) = oneshot::channel();
        let ask = PendingAsk {
            id: new_id(),
            session_id: session_id.to_string(),
            question: question.to_string(),
            options,
        };
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .push(Waiting {
                ask: ask.clone(),
                answer_tx,
            });
        (ask, answer_rx)
    }

    /// Deliver an answer.  Returns `false` when the ask is unknown
    /// (already answered or cleared).
    pub fn answer(&self, session_id: &str, ask_id: &str, answer: String) -> bool {
        let mut map = self.lock();
        let Some(queue) = map.get_mut(session_id) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|w| w.ask.id == ask_id) else {
            return false;
        };
        let waiting = queue.remove(pos);
        if queue.is_empty() {
            map.remove(session_id);
        }
        waiting.answer_tx.send(answer).is_ok()
    }

    /// Outstanding questions for one session, oldest first.
    pub fn pending(&self, session_id: &str) -> Vec<PendingAsk> {
        self.lock()
            .get(session_id)
            .map(|q| q.iter().map(|w| w.ask.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop every outstanding ask for a session, failing the blocked
    /// askers.  Called on session delete and compact.
    pub fn clear_session(&self, session_id: &str) -> usize {
        self.lock()
            .remove(session_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Waiting>>> {
        self.by_session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
