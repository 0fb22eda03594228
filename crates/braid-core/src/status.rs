// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session status consolidation.
//!
//! Subscribers want one answer to "what is the session doing right now".
//! Priority: an in-progress todo's active form beats the current tool's
//! label beats the default "Thinking…".  While a stream is active, a 1 s
//! ticker republishes the summary so the `duration` field stays live.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use braid_events::{channels, Broker};

const DEFAULT_STATUS: &str = "Thinking…";

#[derive(Default)]
struct StatusState {
    tool_label: Option<String>,
    todo_active_form: Option<String>,
}

pub struct SessionStatusManager {
    broker: Arc<Broker>,
    session_id: String,
    started_at: DateTime<Utc>,
    state: Mutex<StatusState>,
    ticker: CancellationToken,
}

impl SessionStatusManager {
    /// Create the manager and start the republish ticker.
    pub fn start(broker: Arc<Broker>, session_id: &str) -> Arc<Self> {
        let mgr = Arc::new(Self {
            broker,
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            state: Mutex::new(StatusState::default()),
            ticker: CancellationToken::new(),
        });
        let tick = mgr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick.ticker.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        tick.publish().await;
                    }
                }
            }
        });
        mgr
    }

    /// The consolidated label under the priority rule.
    pub fn current(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .todo_active_form
            .clone()
            .or_else(|| state.tool_label.clone())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string())
    }

    pub async fn set_tool(&self, label: Option<String>) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).tool_label = label;
        self.publish().await;
    }

    pub async fn set_todo(&self, active_form: Option<String>) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .todo_active_form = active_form;
        self.publish().await;
    }

    pub async fn publish(&self) {
        let duration_secs = (Utc::now() - self.started_at).num_seconds().max(0);
        let _ = self
            .broker
            .publish(
                &channels::session(&self.session_id),
                "session-status",
                json!({ "status": self.current(), "durationSecs": duration_secs }),
            )
            .await;
    }

    /// Stop the ticker and emit a final idle summary.
    pub async fn stop(&self) {
        self.ticker.cancel();
        let _ = self
            .broker
            .publish(
                &channels::session(&self.session_id),
                "session-status",
                json!({ "status": "idle", "durationSecs":
                    (Utc::now() - self.started_at).num_seconds().max(0) }),
            )
            .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use braid_store::MemoryStore;
    use futures::StreamExt;

    use super::*;

    fn broker() -> Arc<Broker> {
        Broker::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn default_status_is_thinking() {
        let m = SessionStatusManager::start(broker(), "s1");
        assert_eq!(m.current(), DEFAULT_STATUS);
        m.stop().await;
    }

    #[tokio::test]
    async fn todo_beats_tool_beats_default() {
        let m = SessionStatusManager::start(broker(), "s1");
        m.set_tool(Some("Running a command…".into())).await;
        assert_eq!(m.current(), "Running a command…");
        m.set_todo(Some("Writing tests".into())).await;
        assert_eq!(m.current(), "Writing tests");
        m.set_todo(None).await;
        assert_eq!(m.current(), "Running a command…");
        m.set_tool(None).await;
        assert_eq!(m.current(), DEFAULT_STATUS);
        m.stop().await;
    }

    #[tokio::test]
    async fn updates_are_published_on_the_session_channel() {
        let b = broker();
        let mut sub = b.subscribe(&channels::session("s1"), None).await.unwrap();
        let m = SessionStatusManager::start(b.clone(), "s1");
        m.set_tool(Some("Reading files…".into())).await;
        let e = sub.next().await.unwrap();
        assert_eq!(e.event_type, "session-status");
        assert_eq!(e.payload["status"], "Reading files…");
        m.stop().await;
    }

    #[tokio::test]
    async fn ticker_republishes_with_duration() {
        let b = broker();
        let mut sub = b.subscribe(&channels::session("s1"), None).await.unwrap();
        let m = SessionStatusManager::start(b.clone(), "s1");
        // Wait for at least one tick.
        let e = tokio::time::timeout(Duration::from_secs(3), sub.next())
            .await
            .expect("ticker should publish within 3s")
            .unwrap();
        assert!(e.payload["durationSecs"].is_i64() || e.payload["durationSecs"].is_u64());
        m.stop().await;
    }
}
