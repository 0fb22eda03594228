// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use braid_types::FinishReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of one provider-neutral model message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelContent {
    Text {
        text: String,
    },
    /// Binary file input for models that accept it.
    File {
        media_type: String,
        base64: String,
    },
    /// The assistant requested a tool invocation.
    ToolCall {
        tool_id: String,
        name: String,
        input: Value,
    },
    /// The result of a tool call.
    ToolResult {
        tool_id: String,
        output: String,
        is_error: bool,
    },
}

/// One message in the provider-neutral conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub content: Vec<ModelContent>,
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::System,
            content: vec![ModelContent::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::User,
            content: vec![ModelContent::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::Assistant,
            content: vec![ModelContent::Text { text: text.into() }],
        }
    }

    pub fn user_with_content(content: Vec<ModelContent>) -> Self {
        Self {
            role: ModelRole::User,
            content,
        }
    }

    pub fn tool_result(tool_id: impl Into<String>, output: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: ModelRole::Tool,
            content: vec![ModelContent::ToolResult {
                tool_id: tool_id.into(),
                output: output.into(),
                is_error,
            }],
        }
    }

    /// Plain text of this message when it is a single text part.
    pub fn as_text(&self) -> Option<&str> {
        match self.content.as_slice() {
            [ModelContent::Text { text }] => Some(text),
            _ => None,
        }
    }
}

/// A tool schema offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// A single-step streaming request: the full history, the system blocks in
/// effect for this turn, and the tool catalog.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// System prompt blocks (agent prompt + enabled rules), in order.
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSchema>,
}

/// Token usage reported at the end of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One tagged chunk of a provider stream.
///
/// Tool input may arrive either as a complete `ToolCall` or progressively
/// via `ToolInputStart`/`Delta`/`End` — providers differ, the orchestrator
/// handles both.  `ToolResult`/`ToolError` are fed through the same chunk
/// path by the orchestrator's own tool executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextStart,
    TextDelta(String),
    TextEnd,
    ReasoningStart,
    ReasoningDelta(String),
    ReasoningEnd,
    ToolCall {
        tool_id: String,
        name: String,
        input: Value,
    },
    ToolInputStart {
        tool_id: String,
        name: String,
    },
    ToolInputDelta {
        tool_id: String,
        delta: String,
    },
    ToolInputEnd {
        tool_id: String,
    },
    ToolResult {
        tool_id: String,
        result: String,
        duration_ms: u64,
    },
    ToolError {
        tool_id: String,
        error: String,
        duration_ms: u64,
    },
    File {
        media_type: String,
        base64: String,
    },
    Error(String),
    Abort,
    Finish {
        usage: Option<Usage>,
        reason: FinishReason,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_role() {
        assert_eq!(ModelMessage::system("s").role, ModelRole::System);
        assert_eq!(ModelMessage::user("u").role, ModelRole::User);
        assert_eq!(ModelMessage::assistant("a").role, ModelRole::Assistant);
        assert_eq!(ModelMessage::tool_result("t", "o", false).role, ModelRole::Tool);
    }

    #[test]
    fn as_text_only_for_single_text_part() {
        assert_eq!(ModelMessage::user("hi").as_text(), Some("hi"));
        let multi = ModelMessage::user_with_content(vec![
            ModelContent::Text { text: "a".into() },
            ModelContent::File {
                media_type: "image/png".into(),
                base64: "AA==".into(),
            },
        ]);
        assert!(multi.as_text().is_none());
    }

    #[test]
    fn usage_total_is_sum() {
        let u = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        assert_eq!(u.total(), 15);
    }

    #[test]
    fn model_content_serialises_with_type_tag() {
        let c = ModelContent::ToolCall {
            tool_id: "t1".into(),
            name: "read_file".into(),
            input: serde_json::json!({"path": "a.rs"}),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["name"], "read_file");
    }
}
