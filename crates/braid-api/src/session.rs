// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `session.*` procedures.

use futures::StreamExt;
use serde_json::{json, Value};

use braid_core::AppContext;
use braid_events::channels;
use braid_model::ModelStatus;
use braid_rpc::{Procedure, RouterBuilder, RpcError, ValueStream};
use braid_types::Session;

use crate::helpers::{load_session, opt_str, req_str, save_and_publish, store_err, to_value};

fn session_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "sessionId": { "type": "string", "minLength": 1 } },
        "required": ["sessionId"]
    })
}

/// `modelStatus` enrichment: can the session's `(provider, model)` pair be
/// served right now?
async fn model_status(ctx: &AppContext, session: &Session) -> ModelStatus {
    let Some(provider) = ctx.config.registry().get(&session.provider_id) else {
        return ModelStatus::Unavailable;
    };
    let config = ctx.config.resolved_provider_config(&session.provider_id);
    if !provider.is_configured(&config) {
        return ModelStatus::Unavailable;
    }
    match provider.fetch_models(&config).await {
        Ok(models) => {
            if models.iter().any(|m| m.id == session.model_id) {
                ModelStatus::Available
            } else {
                ModelStatus::Unavailable
            }
        }
        Err(_) => ModelStatus::Unknown,
    }
}

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "session.getRecent",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": {
                        "limit": { "type": "integer", "minimum": 1, "maximum": 100 },
                        "cursor": { "type": "string" }
                    }
                }),
                |ctx: AppContext, input| async move {
                    let limit = input
                        .get("limit")
                        .and_then(Value::as_u64)
                        .unwrap_or(20) as usize;
                    let cursor = opt_str(&input, "cursor");
                    let page = ctx
                        .store
                        .sessions
                        .list_recent(limit, cursor.as_deref())
                        .await
                        .map_err(store_err)?;
                    Ok(json!({
                        "sessions": page.sessions,
                        "nextCursor": page.next_cursor,
                    }))
                },
            ),
        )
        .procedure(
            "session.getById",
            Procedure::query(session_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "sessionId")?;
                let session = load_session(&ctx, &id).await?;
                let todos = ctx.store.todos.list(&id).await.map_err(store_err)?;
                let status = model_status(&ctx, &session).await;
                Ok(json!({
                    "session": session,
                    "todos": todos,
                    "modelStatus": status,
                }))
            })
            .with_subscription(|ctx: AppContext, input| async move {
                let id = req_str(&input, "sessionId")?;
                // Validate eagerly so a bogus id fails the subscribe call
                // instead of silently never emitting.
                load_session(&ctx, &id).await?;
                let events = ctx
                    .broker
                    .subscribe(&channels::session(&id), None)
                    .await
                    .map_err(|e| RpcError::storage(e))?;
                let stream: ValueStream = Box::pin(async_stream::stream! {
                    let mut events = events;
                    while let Some(event) = events.next().await {
                        if event.event_type != "session-updated" {
                            continue;
                        }
                        // Re-read so subscribers always get the current
                        // snapshot even when events race.
                        match ctx.store.sessions.get(&id).await {
                            Ok(Some(session)) => {
                                let todos = ctx.store.todos.list(&id).await.unwrap_or_default();
                                yield Ok(json!({ "session": session, "todos": todos }));
                            }
                            Ok(None) => break,
                            Err(e) => {
                                yield Err(RpcError::storage(e));
                                break;
                            }
                        }
                    }
                });
                Ok(stream)
            }),
        )
        .procedure(
            "session.getCount",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                let count = ctx.store.sessions.count().await.map_err(store_err)?;
                Ok(json!({ "count": count }))
            }),
        )
        .procedure(
            "session.getLast",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                let session = ctx.store.sessions.last().await.map_err(store_err)?;
                Ok(json!({ "session": session }))
            }),
        )
        .procedure(
            "session.search",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "minLength": 1 },
                        "limit": { "type": "integer", "minimum": 1, "maximum": 100 }
                    },
                    "required": ["query"]
                }),
                |ctx: AppContext, input| async move {
                    let query = req_str(&input, "query")?;
                    let limit = input.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                    let sessions = ctx
                        .store
                        .sessions
                        .search(&query, limit)
                        .await
                        .map_err(store_err)?;
                    Ok(json!({ "sessions": sessions }))
                },
            ),
        )
        .procedure(
            "session.create",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "providerId": { "type": "string", "minLength": 1 },
                        "modelId": { "type": "string", "minLength": 1 },
                        "agentId": { "type": "string" },
                        "title": { "type": "string" }
                    },
                    "required": ["providerId", "modelId"]
                }),
                |ctx: AppContext, input| async move {
                    let provider_id = req_str(&input, "providerId")?;
                    if ctx.config.registry().get(&provider_id).is_none() {
                        return Err(RpcError::validation(format!(
                            "unknown provider {provider_id:?}"
                        )));
                    }
                    let agent = opt_str(&input, "agentId")
                        .unwrap_or_else(|| ctx.config.defaults().agent);
                    let mut session =
                        Session::new(provider_id, req_str(&input, "modelId")?, agent);
                    session.title = opt_str(&input, "title");
                    ctx.store.sessions.create(&session).await.map_err(store_err)?;
                    ctx.broker
                        .publish(
                            channels::SESSIONS,
                            "session-created",
                            json!({ "session": session }),
                        )
                        .await
                        .map_err(|e| RpcError::storage(e))?;
                    Ok(to_value(&session))
                },
            ),
        )
        .procedure(
            "session.updateTitle",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "title": { "type": "string" }
                    },
                    "required": ["sessionId", "title"]
                }),
                |ctx: AppContext, input| async move {
                    let mut session = load_session(&ctx, &req_str(&input, "sessionId")?).await?;
                    session.title = Some(req_str(&input, "title")?);
                    save_and_publish(&ctx, session).await
                },
            ),
        )
        .procedure(
            "session.updateModel",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "modelId": { "type": "string", "minLength": 1 }
                    },
                    "required": ["sessionId", "modelId"]
                }),
                |ctx: AppContext, input| async move {
                    let mut session = load_session(&ctx, &req_str(&input, "sessionId")?).await?;
                    session.model_id = req_str(&input, "modelId")?;
                    // The cached base-context estimate is keyed on the
                    // model; invalidate it.
                    session.base_context_tokens = None;
                    save_and_publish(&ctx, session).await
                },
            ),
        )
        .procedure(
            "session.updateProvider",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "providerId": { "type": "string", "minLength": 1 },
                        "modelId": { "type": "string" }
                    },
                    "required": ["sessionId", "providerId"]
                }),
                |ctx: AppContext, input| async move {
                    let provider_id = req_str(&input, "providerId")?;
                    if ctx.config.registry().get(&provider_id).is_none() {
                        return Err(RpcError::validation(format!(
                            "unknown provider {provider_id:?}"
                        )));
                    }
                    let mut session = load_session(&ctx, &req_str(&input, "sessionId")?).await?;
                    session.provider_id = provider_id;
                    if let Some(model) = opt_str(&input, "modelId") {
                        session.model_id = model;
                    }
                    session.base_context_tokens = None;
                    save_and_publish(&ctx, session).await
                },
            ),
        )
        .procedure(
            "session.updateRules",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "ruleIds": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["sessionId", "ruleIds"]
                }),
                |ctx: AppContext, input| async move {
                    let mut session = load_session(&ctx, &req_str(&input, "sessionId")?).await?;
                    session.enabled_rule_ids = input["ruleIds"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    session.base_context_tokens = None;
                    save_and_publish(&ctx, session).await
                },
            ),
        )
        .procedure(
            "session.updateAgent",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "agentId": { "type": "string", "minLength": 1 }
                    },
                    "required": ["sessionId", "agentId"]
                }),
                |ctx: AppContext, input| async move {
                    let agent_id = req_str(&input, "agentId")?;
                    if !ctx.agents.contains(&agent_id) {
                        return Err(RpcError::validation(format!("unknown agent {agent_id:?}")));
                    }
                    let mut session = load_session(&ctx, &req_str(&input, "sessionId")?).await?;
                    session.agent_id = agent_id;
                    session.base_context_tokens = None;
                    save_and_publish(&ctx, session).await
                },
            ),
        )
        .procedure(
            "session.delete",
            Procedure::mutation(session_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "sessionId")?;
                let deleted = ctx.store.sessions.delete(&id).await.map_err(store_err)?;
                if deleted {
                    ctx.asks.clear_session(&id);
                    // Exactly one session-deleted on each of the two channels.
                    ctx.broker
                        .publish(
                            &channels::session(&id),
                            "session-deleted",
                            json!({ "sessionId": id }),
                        )
                        .await
                        .map_err(|e| RpcError::storage(e))?;
                    ctx.broker
                        .publish(
                            channels::SESSIONS,
                            "session-deleted",
                            json!({ "sessionId": id }),
                        )
                        .await
                        .map_err(|e| RpcError::storage(e))?;
                }
                Ok(json!({ "deleted": deleted }))
            }),
        )
        .procedure(
            "session.compact",
            Procedure::mutation(session_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "sessionId")?;
                compact_session(&ctx, &id).await
            }),
        )
}

/// Compact: digest the old conversation into one seed message on a fresh
/// session, then delete the old one.  The old session's message queue and
/// ask queue are cleared, not carried over.
async fn compact_session(ctx: &AppContext, id: &str) -> Result<Value, RpcError> {
    let old = load_session(ctx, id).await?;
    let messages = ctx.store.messages.list_messages(id).await.map_err(store_err)?;

    let mut digest = String::from("Summary of the previous conversation:\n");
    for message in &messages {
        let steps = ctx
            .store
            .messages
            .list_steps(&message.id)
            .await
            .map_err(store_err)?;
        for step in steps {
            for part in ctx
                .store
                .messages
                .list_parts(&step.id)
                .await
                .map_err(store_err)?
            {
                match part.payload {
                    braid_types::PartPayload::Text { content } if !content.is_empty() => {
                        let role = match message.role {
                            braid_types::MessageRole::User => "user",
                            braid_types::MessageRole::Assistant => "assistant",
                        };
                        digest.push_str(&format!("[{role}] {content}\n"));
                    }
                    braid_types::PartPayload::Tool { tool_name, .. } => {
                        digest.push_str(&format!("[tool] {tool_name}\n"));
                    }
                    _ => {}
                }
            }
        }
    }

    let mut fresh = Session::new(&old.provider_id, &old.model_id, &old.agent_id);
    fresh.title = old.title.clone();
    fresh.enabled_rule_ids = old.enabled_rule_ids.clone();
    fresh.enabled_tool_ids = old.enabled_tool_ids.clone();
    ctx.store.sessions.create(&fresh).await.map_err(store_err)?;

    // Seed the new session with the digest as its first user turn.
    persist_seed_message(ctx, &fresh, digest).await?;

    // Delete the old session (cascade) and fail its outstanding asks.
    ctx.store.sessions.delete(id).await.map_err(store_err)?;
    ctx.asks.clear_session(id);

    for (channel, event, payload) in [
        (
            channels::session(id),
            "session-deleted",
            json!({ "sessionId": id }),
        ),
        (
            channels::SESSIONS.to_string(),
            "session-deleted",
            json!({ "sessionId": id }),
        ),
        (
            channels::SESSIONS.to_string(),
            "session-created",
            json!({ "session": fresh }),
        ),
        (
            channels::SESSIONS.to_string(),
            "session-compacted",
            json!({ "oldSessionId": id, "newSessionId": fresh.id }),
        ),
    ] {
        ctx.broker
            .publish(&channel, event, payload)
            .await
            .map_err(|e| RpcError::storage(e))?;
    }

    Ok(json!({ "sessionId": fresh.id }))
}

async fn persist_seed_message(
    ctx: &AppContext,
    session: &Session,
    text: String,
) -> Result<(), RpcError> {
    use braid_types::{MessageRecord, MessageRole, Part, PartPayload, RunStatus, Step};
    let ordering = ctx
        .store
        .messages
        .next_ordering(&session.id)
        .await
        .map_err(store_err)?;
    let mut message = MessageRecord::new(&session.id, MessageRole::User, ordering);
    message.status = RunStatus::Completed;
    ctx.store
        .messages
        .create_message(&message)
        .await
        .map_err(store_err)?;
    let mut step = Step::new(&message.id, 0, &session.provider_id, &session.model_id);
    step.finish(RunStatus::Completed, None);
    ctx.store.messages.create_step(&step).await.map_err(store_err)?;
    let mut part = Part::new(&step.id, 0, PartPayload::Text { content: text });
    part.status = RunStatus::Completed;
    ctx.store.messages.upsert_part(&part).await.map_err(store_err)?;
    ctx.broker
        .publish(
            &channels::session_stream(&session.id),
            "user-message-created",
            json!({ "message": message, "parts": [part] }),
        )
        .await
        .map_err(|e| RpcError::storage(e))?;
    Ok(())
}
