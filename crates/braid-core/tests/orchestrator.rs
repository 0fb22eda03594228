// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end orchestrator scenarios driven by scripted providers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use braid_bash::BashManager;
use braid_config::ConfigManager;
use braid_core::tools::ToolRegistry;
use braid_core::{
    stream, AgentLibrary, AppContext, AskRegistry, StreamCoordinator, StreamInput,
    UserContentPart,
};
use braid_events::{channels, Broker, EventStream};
use braid_model::{Provider, ProviderRegistry, ScriptedProvider, StreamChunk, Usage};
use braid_store::MemoryStore;
use braid_types::{
    EventRecord, FinishReason, MessageRole, PartPayload, RunStatus, Session,
};

struct TestEnv {
    app: AppContext,
    _provider: Arc<ScriptedProvider>,
    _dir: tempfile::TempDir,
}

fn env_with(scripts: Vec<Vec<StreamChunk>>) -> TestEnv {
    let provider = ScriptedProvider::new(scripts);
    let registry = ProviderRegistry::with(vec![provider.clone() as Arc<dyn Provider>]);
    build_env(registry, provider)
}

fn env_standard() -> TestEnv {
    let provider = ScriptedProvider::new(vec![]);
    build_env(ProviderRegistry::standard(), provider)
}

fn build_env(
    registry: Arc<ProviderRegistry>,
    provider: Arc<ScriptedProvider>,
) -> TestEnv {
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
    TestEnv {
        app,
        _provider: provider,
        _dir: dir,
    }
}

async fn seeded_session(app: &AppContext) -> Session {
    let session = Session::new("mock", "mock-model", "coder");
    app.store.sessions.create(&session).await.unwrap();
    session
}

fn text_input(session_id: &str, text: &str) -> StreamInput {
    StreamInput {
        session_id: Some(session_id.to_string()),
        content: vec![UserContentPart::Text {
            text: text.to_string(),
        }],
        ..Default::default()
    }
}

fn finish_stop(prompt: u64, completion: u64) -> StreamChunk {
    StreamChunk::Finish {
        usage: Some(Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }),
        reason: FinishReason::Stop,
    }
}

/// Drain every event already buffered on the subscription.
async fn drain(sub: &mut EventStream) -> Vec<EventRecord> {
    let mut out = Vec::new();
    while let Ok(Some(e)) = tokio::time::timeout(Duration::from_millis(200), sub.next()).await {
        out.push(e);
    }
    out
}

// ─── Scenario: happy path text reply ─────────────────────────────────────────

#[tokio::test]
async fn happy_path_text_reply() {
    let env = env_with(vec![vec![
        StreamChunk::TextStart,
        StreamChunk::TextDelta("hello".into()),
        StreamChunk::TextDelta(" world".into()),
        StreamChunk::TextEnd,
        finish_stop(10, 5),
    ]]);
    let session = seeded_session(&env.app).await;
    let mut sub = env
        .app
        .broker
        .subscribe(&channels::session_stream(&session.id), None)
        .await
        .unwrap();

    let out = stream(&env.app, text_input(&session.id, "Say 'hello world' and stop."))
        .await
        .unwrap();
    assert!(out.success);
    assert_eq!(out.session_id, session.id);
    assert!(out.queued.is_none());

    let events = drain(&mut sub).await;
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types[0], "user-message-created");
    assert_eq!(types[1], "assistant-message-created");
    assert!(types.contains(&"part-updated"));
    assert!(types.contains(&"message-updated"));
    assert!(types.contains(&"session-tokens-updated"));

    // Part-updated contents grow monotonically and end with the full text.
    let mut last_len = 0usize;
    let mut final_text = String::new();
    for e in events.iter().filter(|e| e.event_type == "part-updated") {
        let content = e.payload["part"]["content"].as_str().unwrap_or("");
        assert!(content.len() >= last_len, "content must not shrink");
        last_len = content.len();
        final_text = content.to_string();
    }
    assert!(final_text.contains("hello world"));

    // The terminal message-updated reports a completed assistant message.
    let terminal = events
        .iter()
        .rev()
        .find(|e| e.event_type == "message-updated")
        .unwrap();
    assert_eq!(terminal.payload["message"]["status"], "completed");

    // Persisted shape: user message + assistant message, one step, one
    // completed text part, usage row attached.
    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].status, RunStatus::Completed);

    let steps = env.app.store.messages.list_steps(&messages[1].id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, RunStatus::Completed);
    assert_eq!(steps[0].finish_reason, Some(FinishReason::Stop));
    assert!(!steps[0].system_snapshot.is_empty(), "system prompt snapshotted");

    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].status, RunStatus::Completed);

    let usage = env
        .app
        .store
        .messages
        .get_step_usage(&steps[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.total_tokens, 15);

    // Session totals were persisted.
    let fresh = env.app.store.sessions.get(&session.id).await.unwrap().unwrap();
    assert_eq!(fresh.total_tokens, 15);
    assert!(fresh.base_context_tokens.is_some());
}

// ─── Scenario: tool → tool → stop produces three steps ───────────────────────

#[tokio::test]
async fn two_tool_rounds_then_stop() {
    let env = env_with(vec![
        vec![
            StreamChunk::ToolCall {
                tool_id: "t1".into(),
                name: "bash".into(),
                input: json!({ "command": "echo one" }),
            },
            StreamChunk::Finish {
                usage: Some(Usage {
                    prompt_tokens: 5,
                    completion_tokens: 2,
                }),
                reason: FinishReason::ToolCalls,
            },
        ],
        vec![
            StreamChunk::ToolCall {
                tool_id: "t2".into(),
                name: "bash".into(),
                input: json!({ "command": "echo two" }),
            },
            StreamChunk::Finish {
                usage: Some(Usage {
                    prompt_tokens: 6,
                    completion_tokens: 2,
                }),
                reason: FinishReason::ToolCalls,
            },
        ],
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("both ran".into()),
            StreamChunk::TextEnd,
            finish_stop(7, 3),
        ],
    ]);
    let session = seeded_session(&env.app).await;
    let out = stream(&env.app, text_input(&session.id, "run both"))
        .await
        .unwrap();
    assert!(out.success);

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    let assistant = &messages[1];
    assert_eq!(assistant.status, RunStatus::Completed);

    let steps = env.app.store.messages.list_steps(&assistant.id).await.unwrap();
    assert_eq!(steps.len(), 3, "one step per provider request");
    assert_eq!(steps[0].finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(steps[1].finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(steps[2].finish_reason, Some(FinishReason::Stop));
    for (i, step) in steps.iter().enumerate() {
        assert_eq!(step.step_index as usize, i, "step indices strictly increase");
    }

    // Each tool part completed with the echoed output.
    let parts0 = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    match &parts0[0].payload {
        PartPayload::Tool {
            tool_name, result, ..
        } => {
            assert_eq!(tool_name, "bash");
            assert!(result.as_deref().unwrap().contains("one"));
        }
        other => panic!("expected tool part, got {other:?}"),
    }
    assert_eq!(parts0[0].status, RunStatus::Completed);

    let parts1 = env.app.store.messages.list_parts(&steps[1].id).await.unwrap();
    match &parts1[0].payload {
        PartPayload::Tool { result, .. } => {
            assert!(result.as_deref().unwrap().contains("two"));
        }
        other => panic!("expected tool part, got {other:?}"),
    }
}

// ─── Scenario: abort mid-stream ──────────────────────────────────────────────

#[tokio::test]
async fn abort_mid_stream_marks_everything_abort() {
    let env = env_with(vec![vec![
        StreamChunk::TextStart,
        StreamChunk::TextDelta("partial".into()),
        StreamChunk::Abort,
    ]]);
    let session = seeded_session(&env.app).await;
    let out = stream(&env.app, text_input(&session.id, "go")).await.unwrap();
    // Abort is not an error at the RPC level.
    assert!(out.success);

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    // user + aborted assistant + "aborted" note.
    assert_eq!(messages.len(), 3);
    let assistant = &messages[1];
    assert_eq!(assistant.status, RunStatus::Abort);
    assert_eq!(assistant.finish_reason, Some(FinishReason::Aborted));

    let steps = env.app.store.messages.list_steps(&assistant.id).await.unwrap();
    assert_eq!(steps[0].status, RunStatus::Abort);
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    assert_eq!(parts[0].status, RunStatus::Abort);
    match &parts[0].payload {
        PartPayload::Text { content } => assert_eq!(content, "partial"),
        other => panic!("expected text part, got {other:?}"),
    }

    // The visibility note mentions the abort.
    let note_steps = env.app.store.messages.list_steps(&messages[2].id).await.unwrap();
    let note_parts = env
        .app
        .store
        .messages
        .list_parts(&note_steps[0].id)
        .await
        .unwrap();
    match &note_parts[0].payload {
        PartPayload::Error { message } => assert!(message.contains("aborted")),
        other => panic!("expected error part, got {other:?}"),
    }
}

// ─── Scenario: queue injection ───────────────────────────────────────────────

#[tokio::test]
async fn busy_session_enqueues_and_returns_queued() {
    let env = env_with(vec![]);
    let session = seeded_session(&env.app).await;
    // Claim the streaming slot as if another run were in flight.
    let _token = env.app.streams.begin(&session.id).unwrap();

    let out = stream(&env.app, text_input(&session.id, "follow-up"))
        .await
        .unwrap();
    assert!(out.success);
    assert_eq!(out.queued, Some(true));

    let fresh = env.app.store.sessions.get(&session.id).await.unwrap().unwrap();
    assert_eq!(fresh.message_queue.len(), 1);
    assert_eq!(fresh.message_queue[0].text, "follow-up");
}

#[tokio::test]
async fn queued_messages_drain_after_natural_stop() {
    let env = env_with(vec![
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("first answer".into()),
            StreamChunk::TextEnd,
            finish_stop(5, 5),
        ],
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("second answer".into()),
            StreamChunk::TextEnd,
            finish_stop(6, 4),
        ],
    ]);
    let session = seeded_session(&env.app).await;
    // A message was queued while a previous stream ran.
    {
        let mut s = env.app.store.sessions.get(&session.id).await.unwrap().unwrap();
        s.enqueue_message("follow-up");
        env.app.store.sessions.update(&s).await.unwrap();
    }
    let mut sub = env
        .app
        .broker
        .subscribe(&channels::session_stream(&session.id), None)
        .await
        .unwrap();

    let out = stream(&env.app, text_input(&session.id, "start")).await.unwrap();
    assert!(out.success);

    let events = drain(&mut sub).await;
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    let queue_cleared_at = types.iter().position(|t| *t == "queue-cleared").unwrap();
    // After the drain: a new user message and a new assistant message.
    assert!(types[queue_cleared_at..].contains(&"user-message-created"));
    assert!(types[queue_cleared_at..].contains(&"assistant-message-created"));

    // Four messages total: user, assistant, injected user, assistant.
    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, MessageRole::User);
    assert_eq!(messages[3].role, MessageRole::Assistant);
    assert_eq!(messages[3].status, RunStatus::Completed);

    // The queue is empty afterwards.
    let fresh = env.app.store.sessions.get(&session.id).await.unwrap().unwrap();
    assert!(fresh.message_queue.is_empty());

    // The injected assistant reply came from the second script.
    let steps = env.app.store.messages.list_steps(&messages[3].id).await.unwrap();
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    match &parts[0].payload {
        PartPayload::Text { content } => assert_eq!(content, "second answer"),
        other => panic!("expected text part, got {other:?}"),
    }
}

// ─── Provider failures ───────────────────────────────────────────────────────

#[tokio::test]
async fn unconfigured_provider_records_a_note_and_succeeds() {
    let env = env_standard();
    let session = Session::new("openai", "gpt-4o", "coder");
    env.app.store.sessions.create(&session).await.unwrap();

    let out = stream(&env.app, text_input(&session.id, "hi")).await.unwrap();
    assert!(out.success, "provider-not-configured is not an RPC failure");

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    assert_eq!(messages.len(), 1, "only the failure note is recorded");
    let steps = env.app.store.messages.list_steps(&messages[0].id).await.unwrap();
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    match &parts[0].payload {
        PartPayload::Error { message } => assert!(message.contains("not configured")),
        other => panic!("expected error part, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_file_becomes_an_error_part() {
    let env = env_with(vec![vec![
        StreamChunk::TextStart,
        StreamChunk::TextDelta("ok".into()),
        StreamChunk::TextEnd,
        finish_stop(1, 1),
    ]]);
    let session = seeded_session(&env.app).await;
    let input = StreamInput {
        session_id: Some(session.id.clone()),
        content: vec![
            UserContentPart::Text { text: "see file".into() },
            UserContentPart::File { file_id: "nope".into() },
        ],
        ..Default::default()
    };
    let out = stream(&env.app, input).await.unwrap();
    assert!(out.success);

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    let steps = env.app.store.messages.list_steps(&messages[0].id).await.unwrap();
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    assert_eq!(parts.len(), 2);
    assert!(matches!(&parts[1].payload, PartPayload::Error { message } if message.contains("nope")));
}

#[tokio::test]
async fn resolved_file_is_referenced_from_the_step() {
    let env = env_with(vec![vec![
        StreamChunk::TextStart,
        StreamChunk::TextDelta("saw it".into()),
        StreamChunk::TextEnd,
        finish_stop(1, 1),
    ]]);
    let session = seeded_session(&env.app).await;
    let record = braid_types::FileContent::new("a.png", "image/png", 4, "blobs/a", "sha-a");
    env.app.store.files.insert(&record).await.unwrap();
    env.app.store.files.put_blob("blobs/a", b"\x89PNG").await.unwrap();

    let input = StreamInput {
        session_id: Some(session.id.clone()),
        content: vec![UserContentPart::File {
            file_id: record.id.clone(),
        }],
        ..Default::default()
    };
    stream(&env.app, input).await.unwrap();

    // The upload is no longer an orphan.
    let fresh = env.app.store.files.get(&record.id).await.unwrap().unwrap();
    assert!(fresh.step_id.is_some());
}

// ─── Inline actions and titles ───────────────────────────────────────────────

#[tokio::test]
async fn inline_title_directive_is_extracted_from_visible_text() {
    let env = env_with(vec![vec![
        StreamChunk::TextStart,
        StreamChunk::TextDelta("<ti".into()),
        StreamChunk::TextDelta("tle>Fix the parser</title>".into()),
        StreamChunk::TextDelta("Working on it.".into()),
        StreamChunk::TextEnd,
        finish_stop(2, 2),
    ]]);
    let session = seeded_session(&env.app).await;
    stream(&env.app, text_input(&session.id, "please fix")).await.unwrap();

    let fresh = env.app.store.sessions.get(&session.id).await.unwrap().unwrap();
    assert_eq!(fresh.title.as_deref(), Some("Fix the parser"));

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    let steps = env.app.store.messages.list_steps(&messages[1].id).await.unwrap();
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    match &parts[0].payload {
        PartPayload::Text { content } => assert_eq!(content, "Working on it."),
        other => panic!("expected text part, got {other:?}"),
    }
}

#[tokio::test]
async fn new_session_gets_a_generated_title() {
    let env = env_with(vec![
        // Main turn pops first, the title request second.
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("done".into()),
            StreamChunk::TextEnd,
            finish_stop(3, 3),
        ],
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("Parser cleanup".into()),
            StreamChunk::TextEnd,
            StreamChunk::Finish {
                usage: None,
                reason: FinishReason::Stop,
            },
        ],
    ]);
    let input = StreamInput {
        session_id: None,
        provider_id: Some("mock".into()),
        model_id: Some("mock-model".into()),
        agent_id: Some("coder".into()),
        content: vec![UserContentPart::Text {
            text: "clean up the parser".into(),
        }],
    };
    let out = stream(&env.app, input).await.unwrap();
    assert!(out.success);

    // The title task runs in parallel; poll briefly.
    let mut title = None;
    for _ in 0..100 {
        let s = env.app.store.sessions.get(&out.session_id).await.unwrap().unwrap();
        if s.title.is_some() {
            title = s.title;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(title.as_deref(), Some("Parser cleanup"));
}

// ─── Progressive tool input ──────────────────────────────────────────────────

#[tokio::test]
async fn progressive_tool_input_accumulates_and_parses() {
    let env = env_with(vec![
        vec![
            StreamChunk::ToolInputStart {
                tool_id: "t1".into(),
                name: "bash".into(),
            },
            StreamChunk::ToolInputDelta {
                tool_id: "t1".into(),
                delta: "{\"command\": \"ec".into(),
            },
            StreamChunk::ToolInputDelta {
                tool_id: "t1".into(),
                delta: "ho split\"}".into(),
            },
            StreamChunk::ToolInputEnd {
                tool_id: "t1".into(),
            },
            StreamChunk::Finish {
                usage: Some(Usage {
                    prompt_tokens: 4,
                    completion_tokens: 2,
                }),
                reason: FinishReason::ToolCalls,
            },
        ],
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("ran".into()),
            StreamChunk::TextEnd,
            finish_stop(2, 1),
        ],
    ]);
    let session = seeded_session(&env.app).await;
    stream(&env.app, text_input(&session.id, "go")).await.unwrap();

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    let steps = env.app.store.messages.list_steps(&messages[1].id).await.unwrap();
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    match &parts[0].payload {
        PartPayload::Tool { input, result, .. } => {
            assert_eq!(input["command"], "echo split");
            assert!(result.as_deref().unwrap().contains("split"));
        }
        other => panic!("expected tool part, got {other:?}"),
    }
}

#[tokio::test]
async fn unparseable_tool_input_degrades_to_empty_object() {
    let env = env_with(vec![
        vec![
            StreamChunk::ToolInputStart {
                tool_id: "t1".into(),
                name: "bash".into(),
            },
            StreamChunk::ToolInputDelta {
                tool_id: "t1".into(),
                delta: "{not valid json".into(),
            },
            StreamChunk::ToolInputEnd {
                tool_id: "t1".into(),
            },
            StreamChunk::Finish {
                usage: None,
                reason: FinishReason::ToolCalls,
            },
        ],
        vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta("recovered".into()),
            StreamChunk::TextEnd,
            finish_stop(1, 1),
        ],
    ]);
    let session = seeded_session(&env.app).await;
    let out = stream(&env.app, text_input(&session.id, "go")).await.unwrap();
    assert!(out.success);

    let messages = env.app.store.messages.list_messages(&session.id).await.unwrap();
    let steps = env.app.store.messages.list_steps(&messages[1].id).await.unwrap();
    let parts = env.app.store.messages.list_parts(&steps[0].id).await.unwrap();
    match &parts[0].payload {
        PartPayload::Tool { input, .. } => assert_eq!(input, &json!({})),
        other => panic!("expected tool part, got {other:?}"),
    }
}
