// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use braid_bash::BashManager;
use braid_config::ConfigManager;
use braid_events::Broker;
use braid_store::Store;

use crate::agents::AgentLibrary;
use crate::ask::AskRegistry;
use crate::tools::ToolRegistry;

/// Everything a resolver or the orchestrator needs, bound once at startup.
///
/// Cloning is cheap (Arc per field).  Nothing in the runtime reaches for
/// process-global state; this context is the only channel.
#[derive(Clone)]
pub struct AppContext {
    pub store: Store,
    pub broker: Arc<Broker>,
    pub bash: Arc<BashManager>,
    pub config: Arc<ConfigManager>,
    pub tools: Arc<ToolRegistry>,
    pub agents: Arc<AgentLibrary>,
    pub asks: Arc<AskRegistry>,
    pub streams: Arc<StreamCoordinator>,
}

/// Tracks which sessions currently have an orchestrator run in flight and
/// owns their cancellation tokens.
///
/// This is what enforces "no two orchestrator runs target the same session
/// simultaneously": `begin` refuses while a run is registered, and the
/// caller enqueues the message instead.
#[derive(Default)]
pub struct StreamCoordinator {
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl StreamCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the streaming slot for a session.  `None` when a run is
    /// already in flight.
    pub fn begin(&self, session_id: &str) -> Option<CancellationToken> {
        let mut active = self.lock();
        if active.contains_key(session_id) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(session_id.to_string(), token.clone());
        Some(token)
    }

    pub fn end(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Signal the in-flight run's cancellation token.  Returns `false`
    /// when nothing is streaming for the session.
    pub fn abort(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}
