// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The manual agent loop.
//!
//! One provider step at a time: open a step, drive the chunk stream into
//! persisted parts, execute tool calls when the model asks for them, drain
//! queued user messages on natural stops, and emit an event at every state
//! transition.  The invariant throughout: the assistant message and step
//! currently being written are never read by another task — everyone else
//! sees them through repository reads and events.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use braid_events::channels;
use braid_model::{
    ModelContent, ModelMessage, ModelRole, Provider, StreamChunk, StreamRequest, ToolSchema,
    Usage,
};
use braid_types::{
    FinishReason, MessageRecord, MessageRole, Part, PartPayload, RunStatus, Session, Step,
    StepUsage,
};

use crate::history::{build_model_messages, build_system_blocks};
use crate::inline::{InlineAction, InlineActionParser};
use crate::status::SessionStatusManager;
use crate::tokens::{estimate_base_context, estimate_tokens, TokenTracker};
use crate::tools::{ToolCall, ToolContext};
use crate::AppContext;

/// Hard cap on provider round-trips per call, against runaway loops.
const MAX_ITERATIONS: u32 = 100;

/// If the provider has produced no chunk at all within this window, the
/// step fails with a synthesized error part.
const FIRST_EVENT_TIMEOUT: Duration = Duration::from_secs(45);

/// Publish `part-updated` every N deltas; the upsert itself happens on
/// every delta.
const PUBLISH_EVERY: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum UserContentPart {
    Text { text: String },
    File { file_id: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInput {
    pub session_id: Option<String>,
    /// Required (with model) when `session_id` is null; otherwise ignored.
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub agent_id: Option<String>,
    pub content: Vec<UserContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOutcome {
    pub success: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run one streaming turn to completion.  See the module docs for the
/// full lifecycle.
pub async fn stream(app: &AppContext, input: StreamInput) -> anyhow::Result<StreamOutcome> {
    // ── 1. Ensure session ────────────────────────────────────────────────────
    let (session, created) = ensure_session(app, &input).await?;
    let session_id = session.id.clone();

    // Already streaming ⇒ enqueue and return.
    let Some(cancel) = app.streams.begin(&session_id) else {
        let mut fresh = app
            .store
            .sessions
            .get(&session_id)
            .await?
            .context("session vanished while enqueueing")?;
        fresh.enqueue_message(combined_text(&input.content));
        app.store.sessions.update(&fresh).await?;
        debug!(session = %session_id, "session busy; message queued");
        return Ok(StreamOutcome {
            success: true,
            session_id,
            queued: Some(true),
            error: None,
        });
    };

    let outcome = run(app, session, created, &input, cancel.clone()).await;

    // ── 12. Cleanup ──────────────────────────────────────────────────────────
    app.asks.clear_session(&session_id);
    app.streams.end(&session_id);

    match outcome {
        Ok(o) => Ok(o),
        Err(e) => Ok(StreamOutcome {
            success: false,
            session_id,
            queued: None,
            error: Some(format!("{e:#}")),
        }),
    }
}

/// Resolve (or create) the target session for a stream input.  Newly
/// created sessions publish `session-created` on the global channel.
pub async fn ensure_session(
    app: &AppContext,
    input: &StreamInput,
) -> anyhow::Result<(Session, bool)> {
    match &input.session_id {
        Some(id) => {
            let session = app
                .store
                .sessions
                .get(id)
                .await?
                .with_context(|| format!("unknown session {id}"))?;
            Ok((session, false))
        }
        None => {
            let defaults = app.config.defaults();
            let session = Session::new(
                input.provider_id.clone().unwrap_or(defaults.provider),
                input.model_id.clone().unwrap_or(defaults.model),
                input.agent_id.clone().unwrap_or(defaults.agent),
            );
            app.store.sessions.create(&session).await?;
            app.broker
                .publish(
                    channels::SESSIONS,
                    "session-created",
                    json!({ "session": session }),
                )
                .await?;
            Ok((session, true))
        }
    }
}

fn combined_text(content: &[UserContentPart]) -> String {
    content
        .iter()
        .filter_map(|p| match p {
            UserContentPart::Text { text } => Some(text.as_str()),
            UserContentPart::File { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn run(
    app: &AppContext,
    session: Session,
    created: bool,
    input: &StreamInput,
    cancel: CancellationToken,
) -> anyhow::Result<StreamOutcome> {
    let session_id = session.id.clone();
    let stream_channel = channels::session_stream(&session_id);

    // ── 2. Validate provider ─────────────────────────────────────────────────
    let registry = app.config.registry().clone();
    let provider = registry.get(&session.provider_id);
    let provider_config = app.config.resolved_provider_config(&session.provider_id);
    let provider: std::sync::Arc<dyn Provider> = match provider {
        Some(p) if p.is_configured(&provider_config) => p,
        Some(p) => {
            record_failure_note(
                app,
                &session,
                &format!(
                    "Provider {:?} is not configured. Add credentials with \
                     config.setProviderSecret before streaming.",
                    p.id()
                ),
            )
            .await?;
            return Ok(StreamOutcome {
                success: true,
                session_id,
                queued: None,
                error: None,
            });
        }
        None => {
            record_failure_note(
                app,
                &session,
                &format!("Unknown provider {:?}.", session.provider_id),
            )
            .await?;
            return Ok(StreamOutcome {
                success: true,
                session_id,
                queued: None,
                error: None,
            });
        }
    };

    // ── 3/4. Resolve file content, persist the user message ──────────────────
    let user_message = persist_user_message(app, &session, &input.content).await?;

    // ── 5. Capabilities ──────────────────────────────────────────────────────
    let mut caps = provider.get_model_capabilities(&session.model_id);
    if caps.is_empty() {
        if let Err(e) = provider.fetch_models(&provider_config).await {
            warn!(provider = provider.id(), "model fetch failed: {e}");
        }
        caps = provider.get_model_capabilities(&session.model_id);
    }

    // ── 6. Model messages + system prompt ────────────────────────────────────
    let system_blocks = build_system_blocks(app, &session);
    let mut model_messages =
        build_model_messages(app, &app.store, &session_id, &caps).await?;

    let tool_schemas: Vec<ToolSchema> = if caps.supports_tools() {
        app.tools.schemas(session.enabled_tool_ids.as_deref())
    } else {
        vec![]
    };

    // ── 7. Assistant message ─────────────────────────────────────────────────
    let mut assistant = new_assistant_message(app, &session_id).await?;

    // ── 8. Token tracking ────────────────────────────────────────────────────
    let base_context = estimate_base_context(&system_blocks, &tool_schemas);
    let history_tokens: u64 = model_messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(|c| match c {
            ModelContent::Text { text } => estimate_tokens(text),
            ModelContent::File { base64, .. } => (base64.len() / 16) as u64,
            ModelContent::ToolCall { input, .. } => estimate_tokens(&input.to_string()),
            ModelContent::ToolResult { output, .. } => estimate_tokens(output),
        })
        .sum();
    let mut tracker = TokenTracker::new(base_context, history_tokens);

    let status = SessionStatusManager::start(app.broker.clone(), &session_id);

    // ── 9. Title generation (first turn only, never blocks) ──────────────────
    if created && session.title.is_none() && user_message.ordering == 0 {
        spawn_title_generation(
            app.clone(),
            provider.clone(),
            provider_config.clone(),
            session.clone(),
            combined_text(&input.content),
        );
    }

    // ── 10. The loop ─────────────────────────────────────────────────────────
    let mut step_index: u32 = 0;
    let mut iterations: u32 = 0;
    let mut aborted = false;
    let mut has_error = false;
    let mut got_usage = false;
    let mut run_usage_total: u64 = 0;
    let mut last_finish: Option<FinishReason> = None;

    'outer: loop {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            warn!(session = %session_id, "iteration cap reached");
            break;
        }

        // a. Open a step.
        let mut step = Step::new(&assistant.id, step_index, &session.provider_id, &session.model_id);
        step.system_snapshot = system_blocks.clone();
        app.store.messages.create_step(&step).await?;

        let client = match provider.create_client(&provider_config, &session.model_id) {
            Ok(c) => c,
            Err(e) => {
                let mut w = StepWriter::new(app, &session_id, &assistant.id, &step.id);
                w.error_part(&format!("could not create provider client: {e}"))
                    .await?;
                has_error = true;
                step.finish(RunStatus::Error, Some(FinishReason::Error));
                app.store.messages.update_step(&step).await?;
                break;
            }
        };

        let req = StreamRequest {
            system: system_blocks.clone(),
            messages: model_messages.clone(),
            tools: tool_schemas.clone(),
        };
        let mut chunks = match client.stream(req).await {
            Ok(s) => s,
            Err(e) => {
                let mut w = StepWriter::new(app, &session_id, &assistant.id, &step.id);
                w.error_part(&format!("provider request failed: {e}")).await?;
                has_error = true;
                step.finish(RunStatus::Error, Some(FinishReason::Error));
                app.store.messages.update_step(&step).await?;
                break;
            }
        };

        // b. Drive the stream.
        let mut writer = StepWriter::new(app, &session_id, &assistant.id, &step.id);
        writer.tracker = Some(&mut tracker);
        let mut finish: Option<(Option<Usage>, FinishReason)> = None;
        let mut saw_chunk = false;

        loop {
            enum Next {
                Chunk(Option<anyhow::Result<StreamChunk>>),
                FirstEventTimeout,
                Cancelled,
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                n = async {
                    if saw_chunk {
                        Next::Chunk(chunks.next().await)
                    } else {
                        match tokio::time::timeout(FIRST_EVENT_TIMEOUT, chunks.next()).await {
                            Ok(c) => Next::Chunk(c),
                            Err(_) => Next::FirstEventTimeout,
                        }
                    }
                } => n,
            };

            match next {
                Next::Cancelled => {
                    aborted = true;
                    break;
                }
                Next::FirstEventTimeout => {
                    writer
                        .error_part("provider produced no output within 45s")
                        .await?;
                    has_error = true;
                    break;
                }
                Next::Chunk(None) => {
                    // Stream ended without an explicit finish chunk.
                    break;
                }
                Next::Chunk(Some(Err(e))) => {
                    saw_chunk = true;
                    if aborted {
                        continue;
                    }
                    writer.error_part(&format!("stream error: {e}")).await?;
                    has_error = true;
                }
                Next::Chunk(Some(Ok(chunk))) => {
                    saw_chunk = true;
                    match chunk {
                        StreamChunk::Finish { usage, reason } => {
                            finish = Some((usage, reason));
                            break;
                        }
                        StreamChunk::Abort => {
                            aborted = true;
                            break;
                        }
                        StreamChunk::Error(e) => {
                            // Late provider errors after an abort are noise.
                            if !aborted {
                                writer.error_part(&e).await?;
                                has_error = true;
                            }
                        }
                        other => writer.apply(other).await?,
                    }
                }
            }
        }

        writer.flush().await?;

        if aborted {
            writer.abort_active().await?;
            step.finish(RunStatus::Abort, Some(FinishReason::Aborted));
            app.store.messages.update_step(&step).await?;
            last_finish = Some(FinishReason::Aborted);
            break 'outer;
        }

        writer.complete_active().await?;
        let calls = writer.pending_tool_calls();
        let step_text = writer.text_so_far();
        drop(writer);

        let Some((usage, reason)) = finish else {
            // Errored or exhausted without a finish chunk.
            let step_status = if has_error { RunStatus::Error } else { RunStatus::Completed };
            let reason = if has_error { FinishReason::Error } else { FinishReason::Stop };
            step.finish(step_status, Some(reason.clone()));
            app.store.messages.update_step(&step).await?;
            last_finish = Some(reason);
            break 'outer;
        };
        last_finish = Some(reason.clone());

        // c. Finalize usage + duration for the step.
        if let Some(u) = usage {
            got_usage = true;
            run_usage_total += u.total();
            app.store
                .messages
                .set_step_usage(
                    &step.id,
                    StepUsage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                        total_tokens: u.total(),
                    },
                )
                .await?;
            tracker.confirm_step(u.completion_tokens);
            publish_tokens(app, &session_id, &tracker).await;
        }
        let step_status = if has_error { RunStatus::Error } else { RunStatus::Completed };
        step.finish(step_status, Some(reason.clone()));
        app.store.messages.update_step(&step).await?;

        match reason {
            FinishReason::ToolCalls => {
                // The model wants another turn after tool execution.

                // Assistant history entry: text + tool calls on one message.
                let mut content: Vec<ModelContent> = Vec::new();
                if !step_text.is_empty() {
                    content.push(ModelContent::Text { text: step_text });
                }
                for (_, call) in &calls {
                    content.push(ModelContent::ToolCall {
                        tool_id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                }
                if !content.is_empty() {
                    model_messages.push(ModelMessage {
                        role: ModelRole::Assistant,
                        content,
                    });
                }

                let tool_ctx = ToolContext {
                    app: app.clone(),
                    session_id: session_id.clone(),
                };
                let mut result_writer =
                    StepWriter::attach(app, &session_id, &assistant.id, &step.id).await?;
                for (_, call) in calls {
                    status.set_tool(app.tools.status_label(&call.name)).await;
                    let started = std::time::Instant::now();
                    let output = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            aborted = true;
                            break;
                        }
                        out = app.tools.execute(&tool_ctx, &call) => out,
                    };
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let chunk = if output.is_error {
                        StreamChunk::ToolError {
                            tool_id: call.id.clone(),
                            error: output.content.clone(),
                            duration_ms,
                        }
                    } else {
                        StreamChunk::ToolResult {
                            tool_id: call.id.clone(),
                            result: output.content.clone(),
                            duration_ms,
                        }
                    };
                    result_writer.apply(chunk).await?;
                    model_messages.push(ModelMessage::tool_result(
                        call.id.clone(),
                        output.content,
                        output.is_error,
                    ));
                }
                status.set_tool(None).await;
                result_writer.flush().await?;
                if aborted {
                    result_writer.abort_active().await?;
                    break 'outer;
                }
                step_index += 1;
            }
            FinishReason::Stop => {
                // Queue drain: a natural stop picks up messages submitted
                // while this stream was running.
                let mut fresh = app
                    .store
                    .sessions
                    .get(&session_id)
                    .await?
                    .context("session vanished mid-stream")?;
                let Some(combined) = fresh.drain_queue() else {
                    break 'outer;
                };
                app.store.sessions.update(&fresh).await?;
                app.broker
                    .publish(&stream_channel, "queue-cleared", json!({}))
                    .await?;

                // Close the current assistant message and open a new one.
                assistant.status = RunStatus::Completed;
                assistant.finish_reason = Some(FinishReason::Stop);
                app.store.messages.update_message(&assistant).await?;
                app.broker
                    .publish(
                        &stream_channel,
                        "message-updated",
                        json!({ "message": assistant }),
                    )
                    .await?;

                let queued_user = persist_user_message(
                    app,
                    &fresh,
                    &[UserContentPart::Text {
                        text: combined.clone(),
                    }],
                )
                .await?;
                debug!(message = %queued_user.id, "queued user message injected");
                model_messages.push(ModelMessage::user(combined));

                assistant = new_assistant_message(app, &session_id).await?;
                step_index = 0;
            }
            other => {
                debug!(session = %session_id, ?other, "stream finished");
                break 'outer;
            }
        }
    }

    // ── 11. Finalize ─────────────────────────────────────────────────────────
    assistant.status = if aborted {
        RunStatus::Abort
    } else if has_error {
        RunStatus::Error
    } else if got_usage {
        RunStatus::Completed
    } else {
        RunStatus::Error
    };
    assistant.finish_reason = last_finish.clone();
    app.store.messages.update_message(&assistant).await?;
    app.broker
        .publish(
            &stream_channel,
            "message-updated",
            json!({ "message": assistant }),
        )
        .await?;

    if aborted {
        if let Some(fresh) = app.store.sessions.get(&session_id).await? {
            record_failure_note(app, &fresh, "Stream aborted by user.").await?;
        }
    }

    // Session token totals.
    if let Some(mut fresh) = app.store.sessions.get(&session_id).await? {
        fresh.total_tokens += run_usage_total;
        fresh.base_context_tokens = Some(tracker.base_context());
        fresh.touch();
        app.store.sessions.update(&fresh).await?;
        publish_tokens(app, &session_id, &tracker).await;
        app.broker
            .publish(
                &channels::session(&session_id),
                "session-updated",
                json!({ "session": fresh }),
            )
            .await?;
    }

    status.stop().await;

    Ok(StreamOutcome {
        success: !has_error,
        session_id,
        queued: None,
        error: None,
    })
}

async fn publish_tokens(app: &AppContext, session_id: &str, tracker: &TokenTracker) {
    let _ = app
        .broker
        .publish(
            &channels::session_stream(session_id),
            "session-tokens-updated",
            json!({
                "totalTokens": tracker.total(),
                "baseContextTokens": tracker.base_context(),
            }),
        )
        .await;
}

/// Persist a user turn: one message, one trivial step, parts in input
/// order.  Missing files become error parts.
async fn persist_user_message(
    app: &AppContext,
    session: &Session,
    content: &[UserContentPart],
) -> anyhow::Result<MessageRecord> {
    let ordering = app.store.messages.next_ordering(&session.id).await?;
    let mut message = MessageRecord::new(&session.id, MessageRole::User, ordering);
    message.status = RunStatus::Completed;
    app.store.messages.create_message(&message).await?;

    let mut step = Step::new(&message.id, 0, &session.provider_id, &session.model_id);
    step.finish(RunStatus::Completed, None);
    app.store.messages.create_step(&step).await?;

    let mut parts = Vec::new();
    for (i, item) in content.iter().enumerate() {
        let mut part = match item {
            UserContentPart::Text { text } => Part::new(
                &step.id,
                i as u64,
                PartPayload::Text {
                    content: text.clone(),
                },
            ),
            UserContentPart::File { file_id } => {
                match app.store.files.get(file_id).await? {
                    Some(record) => {
                        app.store.files.set_step_ref(&record.id, &step.id).await?;
                        Part::new(
                            &step.id,
                            i as u64,
                            PartPayload::File {
                                relative_path: record.relative_path.clone(),
                                media_type: record.media_type.clone(),
                                size: record.size,
                                body: braid_types::FileBody::Stored {
                                    file_id: record.id.clone(),
                                },
                            },
                        )
                    }
                    None => Part::error(&step.id, i as u64, format!("file {file_id} not found")),
                }
            }
        };
        if !matches!(part.status, RunStatus::Error) {
            part.status = RunStatus::Completed;
        }
        app.store.messages.upsert_part(&part).await?;
        parts.push(part);
    }

    app.broker
        .publish(
            &channels::session_stream(&session.id),
            "user-message-created",
            json!({ "message": message, "parts": parts }),
        )
        .await?;
    Ok(message)
}

async fn new_assistant_message(
    app: &AppContext,
    session_id: &str,
) -> anyhow::Result<MessageRecord> {
    let ordering = app.store.messages.next_ordering(session_id).await?;
    let message = MessageRecord::new(session_id, MessageRole::Assistant, ordering);
    app.store.messages.create_message(&message).await?;
    app.broker
        .publish(
            &channels::session_stream(session_id),
            "assistant-message-created",
            json!({ "message": message }),
        )
        .await?;
    Ok(message)
}

/// Failure notes (provider-not-configured, abort) are recorded in the
/// conversation itself so the transcript explains what happened.
async fn record_failure_note(
    app: &AppContext,
    session: &Session,
    note: &str,
) -> anyhow::Result<()> {
    let ordering = app.store.messages.next_ordering(&session.id).await?;
    let mut message = MessageRecord::new(&session.id, MessageRole::Assistant, ordering);
    message.status = RunStatus::Error;
    message.finish_reason = Some(FinishReason::Error);
    app.store.messages.create_message(&message).await?;
    let mut step = Step::new(&message.id, 0, &session.provider_id, &session.model_id);
    step.finish(RunStatus::Error, Some(FinishReason::Error));
    app.store.messages.create_step(&step).await?;
    let part = Part::error(&step.id, 0, note);
    app.store.messages.upsert_part(&part).await?;
    app.broker
        .publish(
            &channels::session_stream(&session.id),
            "message-updated",
            json!({ "message": message, "note": note }),
        )
        .await?;
    Ok(())
}

const TITLE_PROMPT: &str = "\
Generate a short title (3 to 8 words) for a coding-assistant session that \
starts with the user message below. Reply with the title only — no quotes, \
no trailing punctuation.";

/// Fire-and-forget title generation.  Uses the same provider with a small
/// prompt; applies the result through the session repository and publishes
/// a normal `session-updated`.  Never blocks the main loop.
fn spawn_title_generation(
    app: AppContext,
    provider: std::sync::Arc<dyn Provider>,
    provider_config: braid_model::ProviderConfig,
    session: Session,
    first_user_text: String,
) {
    tokio::spawn(async move {
        let client = match provider.create_client(&provider_config, &session.model_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(session = %session.id, "title client failed: {e}");
                return;
            }
        };
        let req = StreamRequest {
            system: vec![TITLE_PROMPT.to_string()],
            messages: vec![ModelMessage::user(first_user_text)],
            tools: vec![],
        };
        let mut chunks = match client.stream(req).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session = %session.id, "title request failed: {e}");
                return;
            }
        };
        let mut title = String::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(StreamChunk::TextDelta(d)) => title.push_str(&d),
                Ok(StreamChunk::Finish { .. }) => break,
                Err(e) => {
                    warn!(session = %session.id, "title stream error: {e}");
                    return;
                }
                _ => {}
            }
        }
        let title = title.trim().trim_matches('"').to_string();
        if title.is_empty() {
            return;
        }
        // Apply only if nothing else (an inline action, the user) set a
        // title in the meantime.
        let Ok(Some(mut fresh)) = app.store.sessions.get(&session.id).await else {
            return;
        };
        if fresh.title.is_some() {
            return;
        }
        fresh.title = Some(title);
        fresh.touch();
        if app.store.sessions.update(&fresh).await.is_ok() {
            let _ = app
                .broker
                .publish(
                    &channels::session(&session.id),
                    "session-updated",
                    json!({ "session": fresh }),
                )
                .await;
        }
    });
}

// ─── StepWriter ──────────────────────────────────────────────────────────────

/// Writes one step's parts as chunks arrive.
///
/// Holds the "current text part", the open reasoning part, and the open
/// tool parts; upserts on every delta and publishes `part-updated` on the
/// debounce interval (forced on part end).  Events go to both
/// `session-stream:{session}` and `message:{message}`.
struct StepWriter<'a> {
    app: &'a AppContext,
    session_id: String,
    message_id: String,
    step_id: String,
    parts: Vec<Part>,
    current_text: Option<usize>,
    current_reasoning: Option<(usize, std::time::Instant)>,
    open_tools: HashMap<String, usize>,
    input_buffers: HashMap<String, String>,
    tool_names: HashMap<String, String>,
    tool_started: HashMap<String, std::time::Instant>,
    deltas_since_publish: HashMap<usize, u32>,
    inline: InlineActionParser,
    tracker: Option<&'a mut TokenTracker>,
}

impl<'a> StepWriter<'a> {
    fn new(app: &'a AppContext, session_id: &str, message_id: &str, step_id: &str) -> Self {
        Self {
            app,
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            step_id: step_id.to_string(),
            parts: Vec::new(),
            current_text: None,
            current_reasoning: None,
            open_tools: HashMap::new(),
            input_buffers: HashMap::new(),
            tool_names: HashMap::new(),
            tool_started: HashMap::new(),
            deltas_since_publish: HashMap::new(),
            inline: InlineActionParser::new(),
            tracker: None,
        }
    }

    /// Re-attach to a step whose parts already exist (tool execution after
    /// the provider stream closed).
    async fn attach(
        app: &'a AppContext,
        session_id: &str,
        message_id: &str,
        step_id: &str,
    ) -> anyhow::Result<StepWriter<'a>> {
        let mut w = Self::new(app, session_id, message_id, step_id);
        w.parts = app.store.messages.list_parts(step_id).await?;
        for (i, part) in w.parts.iter().enumerate() {
            if let PartPayload::Tool { tool_id, tool_name, .. } = &part.payload {
                if part.status == RunStatus::Active {
                    w.open_tools.insert(tool_id.clone(), i);
                    w.tool_names.insert(tool_id.clone(), tool_name.clone());
                    w.tool_started
                        .insert(tool_id.clone(), std::time::Instant::now());
                }
            }
        }
        Ok(w)
    }

    fn next_ordering(&self) -> u64 {
        self.parts.len() as u64
    }

    async fn apply(&mut self, chunk: StreamChunk) -> anyhow::Result<()> {
        match chunk {
            StreamChunk::TextStart => {
                self.start_text().await?;
            }
            StreamChunk::TextDelta(delta) => {
                if self.current_text.is_none() {
                    // Providers may skip the explicit start chunk.
                    self.start_text().await?;
                }
                if let Some(t) = self.tracker.as_deref_mut() {
                    t.feed(&delta);
                }
                let (visible, actions) = self.inline.feed(&delta);
                let idx = self.current_text.unwrap();
                if !visible.is_empty() {
                    self.parts[idx].append_content(&visible);
                }
                self.upsert(idx).await?;
                self.publish_part(idx, false).await?;
                for action in actions {
                    self.dispatch_inline(action).await?;
                }
            }
            StreamChunk::TextEnd => {
                let leftover = self.inline.finish();
                if let Some(idx) = self.current_text.take() {
                    if !leftover.is_empty() {
                        self.parts[idx].append_content(&leftover);
                    }
                    self.parts[idx].status = RunStatus::Completed;
                    self.upsert(idx).await?;
                    self.publish_part(idx, true).await?;
                }
            }
            StreamChunk::ReasoningStart => {
                self.start_reasoning().await?;
            }
            StreamChunk::ReasoningDelta(delta) => {
                if self.current_reasoning.is_none() {
                    self.start_reasoning().await?;
                }
                if let Some(t) = self.tracker.as_deref_mut() {
                    t.feed(&delta);
                }
                let (idx, _) = self.current_reasoning.unwrap();
                self.parts[idx].append_content(&delta);
                self.upsert(idx).await?;
                self.publish_part(idx, false).await?;
            }
            StreamChunk::ReasoningEnd => {
                if let Some((idx, started)) = self.current_reasoning.take() {
                    if let PartPayload::Reasoning { duration_ms, .. } =
                        &mut self.parts[idx].payload
                    {
                        *duration_ms = Some(started.elapsed().as_millis() as u64);
                    }
                    self.parts[idx].status = RunStatus::Completed;
                    self.upsert(idx).await?;
                    self.publish_part(idx, true).await?;
                }
            }
            StreamChunk::ToolCall {
                tool_id,
                name,
                input,
            } => {
                self.open_tool(tool_id, name, input).await?;
            }
            StreamChunk::ToolInputStart { tool_id, name } => {
                self.input_buffers.insert(tool_id.clone(), String::new());
                self.tool_names.insert(tool_id, name);
            }
            StreamChunk::ToolInputDelta { tool_id, delta } => {
                self.input_buffers
                    .entry(tool_id)
                    .or_default()
                    .push_str(&delta);
            }
            StreamChunk::ToolInputEnd { tool_id } => {
                let buf = self.input_buffers.remove(&tool_id).unwrap_or_default();
                // Unparseable accumulated input degrades to an empty object.
                let input: Value =
                    serde_json::from_str(&buf).unwrap_or_else(|_| json!({}));
                let name = self
                    .tool_names
                    .get(&tool_id)
                    .cloned()
                    .unwrap_or_default();
                self.open_tool(tool_id, name, input).await?;
            }
            StreamChunk::ToolResult {
                tool_id,
                result,
                duration_ms,
            } => {
                self.close_tool(&tool_id, Some(result), None, duration_ms)
                    .await?;
            }
            StreamChunk::ToolError {
                tool_id,
                error,
                duration_ms,
            } => {
                self.close_tool(&tool_id, None, Some(error), duration_ms)
                    .await?;
            }
            StreamChunk::File { media_type, base64 } => {
                let size = (base64.len() / 4) * 3;
                let mut part = Part::new(
                    &self.step_id,
                    self.next_ordering(),
                    PartPayload::File {
                        relative_path: String::new(),
                        media_type,
                        size: size as u64,
                        body: braid_types::FileBody::Inline { base64 },
                    },
                );
                part.status = RunStatus::Completed;
                self.parts.push(part);
                let idx = self.parts.len() - 1;
                self.upsert(idx).await?;
                self.publish_part(idx, true).await?;
            }
            // Finish / Abort / Error are handled by the loop, not here.
            StreamChunk::Finish { .. } | StreamChunk::Abort | StreamChunk::Error(_) => {}
        }
        Ok(())
    }

    async fn start_text(&mut self) -> anyhow::Result<()> {
        let part = Part::text(&self.step_id, self.next_ordering());
        self.current_text = Some(self.parts.len());
        self.parts.push(part);
        self.upsert(self.parts.len() - 1).await
    }

    async fn start_reasoning(&mut self) -> anyhow::Result<()> {
        let part = Part::reasoning(&self.step_id, self.next_ordering());
        self.current_reasoning = Some((self.parts.len(), std::time::Instant::now()));
        self.parts.push(part);
        self.upsert(self.parts.len() - 1).await
    }

    async fn open_tool(
        &mut self,
        tool_id: String,
        name: String,
        input: Value,
    ) -> anyhow::Result<()> {
        let part = Part::new(
            &self.step_id,
            self.next_ordering(),
            PartPayload::Tool {
                tool_id: tool_id.clone(),
                tool_name: name.clone(),
                input,
                result: None,
                error: None,
                duration_ms: None,
            },
        );
        self.parts.push(part);
        let idx = self.parts.len() - 1;
        self.open_tools.insert(tool_id.clone(), idx);
        self.tool_names.insert(tool_id.clone(), name);
        self.tool_started
            .insert(tool_id, std::time::Instant::now());
        self.upsert(idx).await?;
        self.publish_part(idx, true).await?;
        Ok(())
    }

    async fn close_tool(
        &mut self,
        tool_id: &str,
        result: Option<String>,
        error: Option<String>,
        duration_ms: u64,
    ) -> anyhow::Result<()> {
        let Some(&idx) = self.open_tools.get(tool_id) else {
            warn!(tool_id, "result for unknown tool call");
            return Ok(());
        };
        self.open_tools.remove(tool_id);
        let failed = error.is_some();
        if let PartPayload::Tool {
            result: r,
            error: e,
            duration_ms: d,
            ..
        } = &mut self.parts[idx].payload
        {
            *r = result;
            *e = error;
            *d = Some(duration_ms);
        }
        self.parts[idx].status = if failed {
            RunStatus::Error
        } else {
            RunStatus::Completed
        };
        self.upsert(idx).await?;
        self.publish_part(idx, true).await?;
        Ok(())
    }

    async fn error_part(&mut self, message: &str) -> anyhow::Result<()> {
        let part = Part::error(&self.step_id, self.next_ordering(), message);
        self.parts.push(part);
        let idx = self.parts.len() - 1;
        self.upsert(idx).await?;
        self.publish_part(idx, true).await?;
        Ok(())
    }

    async fn upsert(&self, idx: usize) -> anyhow::Result<()> {
        self.app
            .store
            .messages
            .upsert_part(&self.parts[idx])
            .await?;
        Ok(())
    }

    async fn publish_part(&mut self, idx: usize, force: bool) -> anyhow::Result<()> {
        let count = self.deltas_since_publish.entry(idx).or_insert(0);
        *count += 1;
        if !force && *count < PUBLISH_EVERY {
            return Ok(());
        }
        *count = 0;
        let payload = json!({
            "stepId": self.step_id,
            "partIndex": self.parts[idx].ordering,
            "part": self.parts[idx],
        });
        self.app
            .broker
            .publish(
                &channels::session_stream(&self.session_id),
                "part-updated",
                payload.clone(),
            )
            .await?;
        self.app
            .broker
            .publish(&channels::message(&self.message_id), "part-updated", payload)
            .await?;
        Ok(())
    }

    /// Force-publish any part with unpublished deltas.
    async fn flush(&mut self) -> anyhow::Result<()> {
        let pending: Vec<usize> = self
            .deltas_since_publish
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(i, _)| *i)
            .collect();
        for idx in pending {
            self.publish_part(idx, true).await?;
        }
        Ok(())
    }

    /// Close any still-open text/reasoning part as completed (stream ended
    /// without explicit end chunks).
    async fn complete_active(&mut self) -> anyhow::Result<()> {
        if self.current_text.is_some() {
            self.apply(StreamChunk::TextEnd).await?;
        }
        if self.current_reasoning.is_some() {
            self.apply(StreamChunk::ReasoningEnd).await?;
        }
        Ok(())
    }

    /// Mark every still-active part as aborted.
    async fn abort_active(&mut self) -> anyhow::Result<()> {
        for idx in 0..self.parts.len() {
            if self.parts[idx].status == RunStatus::Active {
                self.parts[idx].status = RunStatus::Abort;
                self.upsert(idx).await?;
                self.publish_part(idx, true).await?;
            }
        }
        self.current_text = None;
        self.current_reasoning = None;
        self.open_tools.clear();
        Ok(())
    }

    /// Tool parts recorded this step that still await execution.
    fn pending_tool_calls(&self) -> Vec<(usize, ToolCall)> {
        let mut out = Vec::new();
        for (tool_id, &idx) in &self.open_tools {
            if let PartPayload::Tool {
                tool_name, input, ..
            } = &self.parts[idx].payload
            {
                out.push((
                    idx,
                    ToolCall {
                        id: tool_id.clone(),
                        name: tool_name.clone(),
                        input: input.clone(),
                    },
                ));
            }
        }
        out.sort_by_key(|(idx, _)| *idx);
        out
    }

    /// Visible text streamed so far in this step.
    fn text_so_far(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match &p.payload {
                PartPayload::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    async fn dispatch_inline(&mut self, action: InlineAction) -> anyhow::Result<()> {
        match action {
            InlineAction::SetTitle(title) => {
                if title.is_empty() {
                    return Ok(());
                }
                if let Some(mut session) = self.app.store.sessions.get(&self.session_id).await? {
                    session.title = Some(title);
                    session.touch();
                    self.app.store.sessions.update(&session).await?;
                    self.app
                        .broker
                        .publish(
                            &channels::session(&self.session_id),
                            "session-updated",
                            json!({ "session": session }),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}
