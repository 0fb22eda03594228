// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `events.*` procedures: the broker surface.

use futures::StreamExt;
use serde_json::{json, Value};

use braid_core::AppContext;
use braid_events::channels;
use braid_rpc::{Procedure, RouterBuilder, RpcError, ValueStream};
use braid_types::Cursor;

use crate::helpers::req_str;

/// Event records cross the wire with their cursor halves flattened so a
/// client can resubscribe from where it stopped.  The field names match
/// `fromCursor` exactly — what a client reads here is what it feeds back.
fn event_to_value(e: braid_types::EventRecord) -> Value {
    json!({
        "id": e.id,
        "channel": e.channel,
        "type": e.event_type,
        "timestampMs": e.timestamp_ms,
        "sequence": e.sequence,
        "payload": e.payload,
    })
}

fn parse_cursor(input: &Value) -> Option<Cursor> {
    let c = input.get("fromCursor")?;
    Some(Cursor {
        timestamp_ms: c.get("timestampMs")?.as_i64()?,
        sequence: c.get("sequence")?.as_u64()?,
    })
}

fn events_stream(
    events: braid_events::EventStream,
) -> ValueStream {
    Box::pin(events.map(|e| Ok(event_to_value(e))))
}

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "events.subscribe",
            Procedure::subscription(
                json!({
                    "type": "object",
                    "properties": {
                        "channel": { "type": "string", "minLength": 1 },
                        "fromCursor": {
                            "type": "object",
                            "properties": {
                                "timestampMs": { "type": "integer" },
                                "sequence": { "type": "integer" }
                            },
                            "required": ["timestampMs", "sequence"]
                        }
                    },
                    "required": ["channel"]
                }),
                |ctx: AppContext, input| async move {
                    let channel = req_str(&input, "channel")?;
                    let cursor = parse_cursor(&input);
                    let events = ctx
                        .broker
                        .subscribe(&channel, cursor)
                        .await
                        .map_err(|e| RpcError::storage(e))?;
                    Ok(events_stream(events))
                },
            ),
        )
        .procedure(
            "events.subscribeToSession",
            Procedure::subscription(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "replayLast": { "type": "integer", "minimum": 0, "maximum": 100 }
                    },
                    "required": ["sessionId"]
                }),
                |ctx: AppContext, input| async move {
                    let id = req_str(&input, "sessionId")?;
                    let replay = input
                        .get("replayLast")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    let channel = channels::session_stream(&id);
                    let events = if replay > 0 {
                        ctx.broker.subscribe_with_history(&channel, replay).await
                    } else {
                        ctx.broker.subscribe(&channel, None).await
                    }
                    .map_err(|e| RpcError::storage(e))?;
                    Ok(events_stream(events))
                },
            ),
        )
        .procedure(
            "events.subscribeToAllSessions",
            Procedure::subscription(
                json!({
                    "type": "object",
                    "properties": {
                        "replayLast": { "type": "integer", "minimum": 0, "maximum": 100 }
                    }
                }),
                |ctx: AppContext, input| async move {
                    let replay = input
                        .get("replayLast")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    let events = if replay > 0 {
                        ctx.broker
                            .subscribe_with_history(channels::SESSIONS, replay)
                            .await
                    } else {
                        ctx.broker.subscribe(channels::SESSIONS, None).await
                    }
                    .map_err(|e| RpcError::storage(e))?;
                    Ok(events_stream(events))
                },
            ),
        )
        .procedure(
            "events.getChannelInfo",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": { "channel": { "type": "string", "minLength": 1 } },
                    "required": ["channel"]
                }),
                |ctx: AppContext, input| async move {
                    let channel = req_str(&input, "channel")?;
                    let info = ctx
                        .broker
                        .info(&channel)
                        .await
                        .map_err(|e| RpcError::storage(e))?;
                    Ok(serde_json::to_value(info).unwrap_or(Value::Null))
                },
            ),
        )
        .procedure(
            "events.cleanupChannel",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "channel": { "type": "string", "minLength": 1 },
                        "keepLast": { "type": "integer", "minimum": 0 }
                    },
                    "required": ["channel", "keepLast"]
                }),
                |ctx: AppContext, input| async move {
                    let channel = req_str(&input, "channel")?;
                    let keep = input["keepLast"].as_u64().unwrap_or(0) as usize;
                    let deleted = ctx
                        .broker
                        .cleanup_channel(&channel, keep)
                        .await
                        .map_err(|e| RpcError::storage(e))?;
                    Ok(json!({ "deleted": deleted }))
                },
            ),
        )
}
