// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use braid_events::channels;
use braid_types::{Todo, TodoStatus};

use super::{Tool, ToolCall, ToolContext, ToolOutput};

/// Replaces the session's entire todo list atomically.
///
/// Shared by the model (as a tool call) and the `todo.update` mutation —
/// both funnel through [`replace_todos`] so the write and the published
/// snapshot are identical.
pub struct TodoWriteTool;

/// Parse a todo item object; `id` is allocated against the session counter
/// when absent.
fn parse_item(
    session_id: &str,
    session_next_id: &mut u64,
    ordering: u64,
    item: &Value,
) -> Result<Todo, String> {
    let content = item
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("todo {ordering}: missing 'content'"))?;
    let active_form = item
        .get("activeForm")
        .and_then(Value::as_str)
        .unwrap_or(content);
    let status = match item.get("status").and_then(Value::as_str) {
        None | Some("pending") => TodoStatus::Pending,
        Some("in_progress") => TodoStatus::InProgress,
        Some("completed") => TodoStatus::Completed,
        Some("removed") => TodoStatus::Removed,
        Some(other) => return Err(format!("todo {ordering}: unknown status {other:?}")),
    };
    let id = match item.get("id").and_then(Value::as_u64) {
        Some(id) => id,
        None => {
            let id = *session_next_id;
            *session_next_id += 1;
            id
        }
    };
    let mut todo = Todo::new(id, session_id, content, active_form, ordering);
    todo.set_status(status);
    todo.metadata = item.get("metadata").cloned().filter(|m| !m.is_null());
    Ok(todo)
}

/// The shared implementation: parse, allocate ids, write the whole list,
/// bump the session counter, publish the updated snapshot.
pub async fn replace_todos(
    ctx: &ToolContext,
    items: &[Value],
) -> Result<Vec<Todo>, String> {
    let mut session = ctx
        .app
        .store
        .sessions
        .get(&ctx.session_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("unknown session {}", ctx.session_id))?;

    let mut next_id = session.next_todo_id;
    let mut todos = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        todos.push(parse_item(&ctx.session_id, &mut next_id, i as u64, item)?);
    }

    ctx.app
        .store
        .todos
        .replace_all(&ctx.session_id, &todos)
        .await
        .map_err(|e| e.to_string())?;

    session.next_todo_id = next_id;
    session.touch();
    ctx.app
        .store
        .sessions
        .update(&session)
        .await
        .map_err(|e| e.to_string())?;

    ctx.app
        .broker
        .publish(
            &channels::session(&ctx.session_id),
            "session-updated",
            json!({ "session": session, "todos": todos }),
        )
        .await
        .map_err(|e| e.to_string())?;

    debug!(session = %ctx.session_id, count = todos.len(), "todo list replaced");
    Ok(todos)
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the session's entire todo list.\n\
         Each item: content (required), activeForm (present-continuous label\n\
         shown while in progress), status (pending|in_progress|completed|removed).\n\
         Keep at most one item in_progress at a time."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "content": { "type": "string" },
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
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    fn status_label(&self) -> &str {
        "Updating the plan…"
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(items) = call.input.get("todos").and_then(Value::as_array) else {
            return ToolOutput::err("missing 'todos' array");
        };
        match replace_todos(ctx, items).await {
            Ok(todos) => {
                let summary = todos
                    .iter()
                    .map(|t| format!("[{:?}] {}", t.status, t.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutput::ok(format!("todo list updated ({} items)\n{summary}", todos.len()))
            }
            Err(e) => ToolOutput::err(e),
        }
    }
}
