// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `todo.*` procedures.

use serde_json::{json, Value};

use braid_core::tools::{replace_todos, ToolContext};
use braid_core::AppContext;
use braid_rpc::{Procedure, RouterBuilder, RpcError};

use crate::helpers::{req_str, store_err};

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "todo.update",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": { "type": "string", "minLength": 1 },
                        "todos": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "id": { "type": "integer" },
                                    "content": { "type": "string", "minLength": 1 },
                                    "activeForm": { "type": "string" },
                                    "status": {
                                        "enum": ["pending", "in_progress", "completed", "removed"]
                                    },
                                    "metadata": { "type": "object" }
                                },
                                "required": ["content"]
                            }
                        }
                    },
                    "required": ["sessionId", "todos"]
                }),
                |ctx: AppContext, input| async move {
                    let session_id = req_str(&input, "sessionId")?;
                    let items: Vec<Value> = input["todos"]
                        .as_array()
                        .cloned()
                        .unwrap_or_default();
                    let tool_ctx = ToolContext {
                        app: ctx,
                        session_id,
                    };
                    // The tool and this mutation share one implementation,
                    // so the atomic-replace semantics are identical.
                    let todos = replace_todos(&tool_ctx, &items)
                        .await
                        .map_err(RpcError::validation)?;
                    Ok(json!({ "todos": todos }))
                },
            ),
        )
        .procedure(
            "todo.get",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": { "sessionId": { "type": "string", "minLength": 1 } },
                    "required": ["sessionId"]
                }),
                |ctx: AppContext, input| async move {
                    let session_id = req_str(&input, "sessionId")?;
                    let todos = ctx.store.todos.list(&session_id).await.map_err(store_err)?;
                    Ok(json!({ "todos": todos }))
                },
            ),
        )
}
