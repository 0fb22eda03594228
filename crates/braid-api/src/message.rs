// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `message.*` procedures.
//!
//! `triggerStream` is a thin wrapper over the orchestrator: when the
//! target session is idle it starts the stream as a background task and
//! returns immediately; when the session is already streaming, the
//! orchestrator's enqueue path runs inline (it returns fast) and the
//! caller sees `{queued: true}`.

use serde_json::{json, Value};
use tracing::warn;

use braid_core::{ensure_session, AppContext, StreamInput};
use braid_rpc::{Procedure, RouterBuilder, RpcError};

use crate::helpers::{req_str, store_err, to_value};

fn content_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "type": { "enum": ["text", "file"] },
                "text": { "type": "string" },
                "fileId": { "type": "string" }
            },
            "required": ["type"]
        }
    })
}

fn parse_stream_input(input: &Value) -> Result<StreamInput, RpcError> {
    serde_json::from_value(input.clone())
        .map_err(|e| RpcError::validation(format!("invalid stream input: {e}")))
}

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "message.triggerStream",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string" },
                        "providerId": { "type": "string" },
                        "modelId": { "type": "string" },
                        "agentId": { "type": "string" },
                        "content": content_schema()
                    },
                    "required": ["content"]
                }),
                |ctx: AppContext, input| async move {
                    let mut stream_input = parse_stream_input(&input)?;
                    // Resolve the session up front so the response always
                    // carries its id, even for the background case.
                    let (session, _created) = ensure_session(&ctx, &stream_input)
                        .await
                        .map_err(|e| RpcError::internal(format!("{e:#}")))?;
                    stream_input.session_id = Some(session.id.clone());

                    if ctx.streams.is_streaming(&session.id) {
                        // Enqueue path: returns quickly with {queued: true}.
                        let out = braid_core::stream(&ctx, stream_input)
                            .await
                            .map_err(|e| RpcError::internal(format!("{e:#}")))?;
                        return Ok(to_value(&out));
                    }

                    let session_id = session.id.clone();
                    let bg_ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = braid_core::stream(&bg_ctx, stream_input).await {
                            warn!(session = %session_id, "stream failed: {e:#}");
                        }
                    });
                    Ok(json!({ "success": true, "sessionId": session.id }))
                },
            ),
        )
        .procedure(
            "message.abortStream",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": { "sessionId": { "type": "string", "minLength": 1 } },
                    "required": ["sessionId"]
                }),
                |ctx: AppContext, input| async move {
                    let id = req_str(&input, "sessionId")?;
                    let aborted = ctx.streams.abort(&id);
                    Ok(json!({ "aborted": aborted }))
                },
            ),
        )
        .procedure(
            "message.answerAsk",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "askId": { "type": "string", "minLength": 1 },
                        "answer": { "type": "string" }
                    },
                    "required": ["sessionId", "askId", "answer"]
                }),
                |ctx: AppContext, input| async move {
                    let answered = ctx.asks.answer(
                        &req_str(&input, "sessionId")?,
                        &req_str(&input, "askId")?,
                        req_str(&input, "answer")?,
                    );
                    Ok(json!({ "answered": answered }))
                },
            ),
        )
        .procedure(
            "message.getBySession",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": { "sessionId": { "type": "string", "minLength": 1 } },
                    "required": ["sessionId"]
                }),
                |ctx: AppContext, input| async move {
                    let id = req_str(&input, "sessionId")?;
                    let mut out = Vec::new();
                    for message in ctx
                        .store
                        .messages
                        .list_messages(&id)
                        .await
                        .map_err(store_err)?
                    {
                        let mut steps_out = Vec::new();
                        for step in ctx
                            .store
                            .messages
                            .list_steps(&message.id)
                            .await
                            .map_err(store_err)?
                        {
                            let parts = ctx
                                .store
                                .messages
                                .list_parts(&step.id)
                                .await
                                .map_err(store_err)?;
                            let usage = ctx
                                .store
                                .messages
                                .get_step_usage(&step.id)
                                .await
                                .map_err(store_err)?;
                            steps_out.push(json!({
                                "step": step,
                                "parts": parts,
                                "usage": usage,
                            }));
                        }
                        out.push(json!({ "message": message, "steps": steps_out }));
                    }
                    Ok(json!({ "messages": out }))
                },
            ),
        )
}
