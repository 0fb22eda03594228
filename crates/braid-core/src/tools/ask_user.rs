// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use braid_events::channels;

use super::{Tool, ToolCall, ToolContext, ToolOutput};

/// Ask the user a question and block until `message.answerAsk` delivers
/// the answer.
///
/// The question is published on the session channel so every connected
/// client can render it.  If the session is deleted or compacted while the
/// ask is outstanding, the blocked call fails promptly.
pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their answer.\n\
         'question' is required; 'options' is an optional list of choices.\n\
         Use for decisions that need explicit user input; do not ask when\n\
         the task already specifies the answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "minLength": 1 },
                "options": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["question"],
            "additionalProperties": false
        })
    }

    fn status_label(&self) -> &str {
        "Waiting for your answer…"
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(question) = call.input.get("question").and_then(Value::as_str) else {
            return ToolOutput::err("missing required 'question' argument");
        };
        let options: Vec<String> = call
            .input
            .get("options")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let (ask, answer_rx) = ctx.app.asks.ask(&ctx.session_id, question, options);
        debug!(session = %ctx.session_id, ask = %ask.id, "ask_user waiting");

        if let Err(e) = ctx
            .app
            .broker
            .publish(
                &channels::session(&ctx.session_id),
                "ask-created",
                json!({ "ask": ask }),
            )
            .await
        {
            ctx.app.asks.clear_session(&ctx.session_id);
            return ToolOutput::err(format!("could not publish the question: {e}"));
        }

        match answer_rx.await {
            Ok(answer) => ToolOutput::ok(format!("Q: {question}\nA: {answer}")),
            Err(_) => ToolOutput::err("the question was cancelled before it was answered"),
        }
    }
}
