// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Whole-stack integration: the client, the catalog, the orchestrator, and
//! the broker wired together in one process, the way the terminal UI
//! embeds them.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use braid_api::{build_router, optimistic};
use braid_bash::BashManager;
use braid_config::ConfigManager;
use braid_core::tools::ToolRegistry;
use braid_core::{AgentLibrary, AppContext, AskRegistry, StreamCoordinator};
use braid_events::Broker;
use braid_model::{Provider, ProviderRegistry, ScriptedProvider, StreamChunk, Usage};
use braid_rpc::RpcClient;
use braid_store::MemoryStore;
use braid_types::FinishReason;

fn scripted_app(scripts: Vec<Vec<StreamChunk>>) -> (AppContext, tempfile::TempDir) {
    let provider = ScriptedProvider::new(scripts);
    let registry = ProviderRegistry::with(vec![provider as Arc<dyn Provider>]);
    let mem = MemoryStore::new();
    let store = mem.clone().into_store();
    let broker = Broker::new(mem);
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(ConfigManager::open(dir.path(), registry).unwrap());
    let app = AppContext {
        store,
        broker: broker.clone(),
        bash: BashManager::new(broker),
        config,
        tools: ToolRegistry::standard(),
        agents: Arc::new(AgentLibrary::new()),
        asks: Arc::new(AskRegistry::new()),
        streams: Arc::new(StreamCoordinator::new()),
    };
    (app, dir)
}

#[tokio::test]
async fn terminal_ui_style_embedding_round_trip() {
    let (app, _dir) = scripted_app(vec![vec![
        StreamChunk::TextStart,
        StreamChunk::TextDelta("embedded ".into()),
        StreamChunk::TextDelta("hello".into()),
        StreamChunk::TextEnd,
        StreamChunk::Finish {
            usage: Some(Usage {
                prompt_tokens: 4,
                completion_tokens: 4,
            }),
            reason: FinishReason::Stop,
        },
    ]]);
    let router = build_router(app.clone());
    let client = RpcClient::new(router.clone());

    // Create a session and seed the entity cache the way a UI would after
    // its first query.
    let session = client
        .mutate(
            "session.create",
            json!({ "providerId": "mock", "modelId": "mock-model" }),
        )
        .await
        .unwrap();
    let session_id = session["id"].as_str().unwrap().to_string();
    client.cache.seed("session", &session_id, session.clone());

    // Optimistic title update: the draft is authoritative after confirm.
    let updated = client
        .mutate_optimistic(
            "session.updateTitle",
            json!({ "sessionId": session_id, "title": "Embedded run" }),
            &optimistic::update_title(),
        )
        .await
        .unwrap();
    assert_eq!(updated["title"], "Embedded run");
    assert_eq!(
        client.cache.get("session", &session_id).unwrap()["title"],
        "Embedded run"
    );

    // Watch the live session view while the stream runs.
    let mut sub = client
        .subscribe(
            "events.subscribeToSession",
            json!({ "sessionId": session_id }),
        )
        .await
        .unwrap();

    let out = client
        .mutate(
            "message.triggerStream",
            json!({
                "sessionId": session_id,
                "content": [{ "type": "text", "text": "greet me" }]
            }),
        )
        .await
        .unwrap();
    assert_eq!(out["success"], true);

    // The background stream produces the canonical event sequence.
    let mut saw_user = false;
    let mut saw_assistant = false;
    let mut saw_terminal = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && !saw_terminal {
        let Ok(Some(Ok(event))) = tokio::time::timeout(Duration::from_secs(1), sub.next()).await
        else {
            break;
        };
        match event["type"].as_str().unwrap_or("") {
            "user-message-created" => saw_user = true,
            "assistant-message-created" => {
                assert!(saw_user, "user message precedes the assistant message");
                saw_assistant = true;
            }
            "message-updated" => {
                if event["payload"]["message"]["status"] == "completed" {
                    saw_terminal = true;
                }
            }
            _ => {}
        }
    }
    assert!(saw_user && saw_assistant && saw_terminal);

    // The persisted transcript is queryable through the same catalog.
    let transcript = client
        .query("message.getBySession", json!({ "sessionId": session_id }))
        .await
        .unwrap();
    let messages = transcript["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    let steps = messages[1]["steps"].as_array().unwrap();
    let parts = steps[0]["parts"].as_array().unwrap();
    assert_eq!(parts[0]["content"], "embedded hello");
    assert_eq!(steps[0]["usage"]["totalTokens"], 8);
}

#[tokio::test]
async fn failed_optimistic_mutation_reverts_through_the_real_router() {
    let (app, _dir) = scripted_app(vec![]);
    let router = build_router(app);
    let client = RpcClient::new(router);

    let session = client
        .mutate(
            "session.create",
            json!({ "providerId": "mock", "modelId": "mock-model" }),
        )
        .await
        .unwrap();
    let session_id = session["id"].as_str().unwrap().to_string();
    client.cache.seed("session", &session_id, session.clone());

    // updateAgent with an unknown agent fails validation server-side; the
    // optimistic draft must unwind.
    let before = client.cache.get("session", &session_id).unwrap();
    let err = client
        .mutate_optimistic(
            "session.updateAgent",
            json!({ "sessionId": session_id, "agentId": "does-not-exist" }),
            &optimistic::update_agent(),
        )
        .await;
    assert!(err.is_err());
    assert_eq!(client.cache.get("session", &session_id).unwrap(), before);
}

#[tokio::test]
async fn select_projection_travels_through_the_client() {
    let (app, _dir) = scripted_app(vec![]);
    let router = build_router(app);
    let client = RpcClient::new(router);

    client
        .mutate(
            "session.create",
            json!({ "providerId": "mock", "modelId": "mock-model" }),
        )
        .await
        .unwrap();
    let out: Value = client
        .query_selected(
            "session.getLast",
            json!({}),
            json!({ "session": { "id": true, "providerId": true } }),
        )
        .await
        .unwrap();
    let session = out["session"].as_object().unwrap();
    assert_eq!(session.len(), 2);
    assert!(session.contains_key("id"));
    assert!(session.contains_key("providerId"));
}
