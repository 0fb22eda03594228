// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Lifecycle status shared by messages, steps, and parts.
///
/// `Active` only while the orchestrator is still writing; exactly one of the
/// terminal variants is reached afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Error,
    Abort,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Active)
    }
}

/// Why a provider stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Aborted,
    /// Provider-specific reason forwarded verbatim.
    Other(String),
}

/// One conversation turn.  Assistant messages are `Active` only while the
/// orchestrator streams into them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    /// Monotonic within the session; assigned by the message repository.
    pub ordering: u64,
    pub status: RunStatus,
    pub finish_reason: Option<FinishReason>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(session_id: impl Into<String>, role: MessageRole, ordering: u64) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.into(),
            role,
            ordering,
            status: RunStatus::Active,
            finish_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// One provider request turn nested inside a message.
///
/// A user message has exactly one trivial step.  An assistant message opens a
/// new step each time the previous one finished with `tool-calls` and the
/// orchestrator goes back to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub message_id: String,
    /// Zero-based, strictly increasing within the message.
    pub step_index: u32,
    pub provider_id: String,
    pub model_id: String,
    /// Snapshot of the system prompt blocks (agent + rules) actually sent on
    /// this turn, so a later replay shows what the model saw.
    pub system_snapshot: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: RunStatus,
    pub finish_reason: Option<FinishReason>,
}

impl Step {
    pub fn new(
        message_id: impl Into<String>,
        step_index: u32,
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            message_id: message_id.into(),
            step_index,
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            system_snapshot: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: RunStatus::Active,
            finish_reason: None,
        }
    }

    /// Close the step, recording the end timestamp and derived duration.
    pub fn finish(&mut self, status: RunStatus, finish_reason: Option<FinishReason>) {
        let now = Utc::now();
        self.duration_ms = Some(
            (now - self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.ended_at = Some(now);
        self.status = status;
        self.finish_reason = finish_reason;
    }
}

/// Token usage for one assistant step, one-to-one with the step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Where a file part's bytes live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FileBody {
    /// Base64 blob carried inline with the part.
    Inline { base64: String },
    /// Reference into the file object store.
    Stored { file_id: String },
}

/// The typed payload of a part.  Variant tags stay lowercase type names
/// ("text", "tool", …); field keys follow the camelCase wire convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PartPayload {
    Text {
        content: String,
    },
    Reasoning {
        content: String,
        duration_ms: Option<u64>,
    },
    Tool {
        tool_id: String,
        tool_name: String,
        input: Value,
        result: Option<String>,
        error: Option<String>,
        duration_ms: Option<u64>,
    },
    File {
        relative_path: String,
        media_type: String,
        size: u64,
        body: FileBody,
    },
    Error {
        message: String,
    },
}

/// Ordered content inside a step.  Parts are append-only; `status` makes a
/// single transition out of `Active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub id: String,
    pub step_id: String,
    /// Monotonic within the step.
    pub ordering: u64,
    pub status: RunStatus,
    #[serde(flatten)]
    pub payload: PartPayload,
}

impl Part {
    pub fn new(step_id: impl Into<String>, ordering: u64, payload: PartPayload) -> Self {
        Self {
            id: new_id(),
            step_id: step_id.into(),
            ordering,
            status: RunStatus::Active,
            payload,
        }
    }

    pub fn text(step_id: impl Into<String>, ordering: u64) -> Self {
        Self::new(
            step_id,
            ordering,
            PartPayload::Text {
                content: String::new(),
            },
        )
    }

    pub fn reasoning(step_id: impl Into<String>, ordering: u64) -> Self {
        Self::new(
            step_id,
            ordering,
            PartPayload::Reasoning {
                content: String::new(),
                duration_ms: None,
            },
        )
    }

    pub fn error(step_id: impl Into<String>, ordering: u64, message: impl Into<String>) -> Self {
        let mut p = Self::new(
            step_id,
            ordering,
            PartPayload::Error {
                message: message.into(),
            },
        );
        p.status = RunStatus::Error;
        p
    }

    /// Append a delta to a text or reasoning payload.  No-op for other kinds.
    pub fn append_content(&mut self, delta: &str) {
        match &mut self.payload {
            PartPayload::Text { content } | PartPayload::Reasoning { content, .. } => {
                content.push_str(delta);
            }
            _ => {}
        }
    }

    /// Current content length for text/reasoning parts, 0 otherwise.  Used by
    /// subscribers to check monotonic growth.
    pub fn content_len(&self) -> usize {
        match &self.payload {
            PartPayload::Text { content } | PartPayload::Reasoning { content, .. } => {
                content.len()
            }
            _ => 0,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_active() {
        let m = MessageRecord::new("s1", MessageRole::Assistant, 0);
        assert_eq!(m.status, RunStatus::Active);
        assert!(m.finish_reason.is_none());
    }

    #[test]
    fn run_status_terminal_classification() {
        assert!(!RunStatus::Active.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Abort.is_terminal());
    }

    #[test]
    fn step_finish_records_duration_and_status() {
        let mut step = Step::new("m1", 0, "mock", "mock-model");
        step.finish(RunStatus::Completed, Some(FinishReason::Stop));
        assert_eq!(step.status, RunStatus::Completed);
        assert!(step.ended_at.is_some());
        assert!(step.duration_ms.is_some());
    }

    #[test]
    fn part_append_grows_text_content() {
        let mut p = Part::text("st1", 0);
        p.append_content("hello");
        p.append_content(" world");
        assert_eq!(p.content_len(), 11);
        match &p.payload {
            PartPayload::Text { content } => assert_eq!(content, "hello world"),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn part_append_is_noop_for_tool_payload() {
        let mut p = Part::new(
            "st1",
            0,
            PartPayload::Tool {
                tool_id: "t1".into(),
                tool_name: "read_file".into(),
                input: serde_json::json!({}),
                result: None,
                error: None,
                duration_ms: None,
            },
        );
        p.append_content("ignored");
        assert_eq!(p.content_len(), 0);
    }

    #[test]
    fn error_part_is_born_terminal() {
        let p = Part::error("st1", 3, "boom");
        assert_eq!(p.status, RunStatus::Error);
    }

    #[test]
    fn part_payload_serialises_with_type_tag() {
        let p = Part::text("st1", 0);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["ordering"], 0);
        assert!(json.get("stepId").is_some(), "part fields are camelCase");
    }

    #[test]
    fn tool_part_fields_are_camel_case() {
        let p = Part::new(
            "st1",
            1,
            PartPayload::Tool {
                tool_id: "t1".into(),
                tool_name: "bash".into(),
                input: serde_json::json!({}),
                result: Some("ok".into()),
                error: None,
                duration_ms: Some(12),
            },
        );
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "tool");
        assert_eq!(v["toolId"], "t1");
        assert_eq!(v["toolName"], "bash");
        assert_eq!(v["durationMs"], 12);
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back.ordering, 1);
    }

    #[test]
    fn finish_reason_kebab_case_wire_format() {
        let s = serde_json::to_string(&FinishReason::ToolCalls).unwrap();
        assert_eq!(s, "\"tool-calls\"");
    }

    #[test]
    fn file_body_round_trip() {
        let b = FileBody::Stored {
            file_id: "f1".into(),
        };
        let json = serde_json::to_string(&b).unwrap();
        let back: FileBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
