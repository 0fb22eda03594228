// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion wire client.
//!
//! Most hosted and local providers speak the `/chat/completions` SSE
//! streaming format, so the registry routes every non-mock declaration
//! through this one client.  Provider-specific wire formats beyond this
//! family are out of scope — the registry declares which base URL and auth
//! header a provider needs, nothing else.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use braid_types::FinishReason;

use crate::{
    ChunkStream, ModelClient, ModelContent, ModelMessage, ModelRole, StreamChunk, StreamRequest,
    Usage,
};

/// Timeout for the models-metadata endpoint.
pub(crate) const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    chat_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.to_string(),
        }
    }
}

/// Serialize provider-neutral messages into the OpenAI wire shape.
fn build_messages(req: &StreamRequest) -> Vec<Value> {
    let mut out = Vec::with_capacity(req.messages.len() + 1);
    if !req.system.is_empty() {
        out.push(json!({ "role": "system", "content": req.system.join("\n\n") }));
    }
    for msg in &req.messages {
        match msg.role {
            ModelRole::System => {
                if let Some(text) = msg.as_text() {
                    out.push(json!({ "role": "system", "content": text }));
                }
            }
            ModelRole::User => out.push(user_message(msg)),
            ModelRole::Assistant => assistant_messages(msg, &mut out),
            ModelRole::Tool => {
                for part in &msg.content {
                    if let ModelContent::ToolResult {
                        tool_id, output, ..
                    } = part
                    {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_id,
                            "content": output,
                        }));
                    }
                }
            }
        }
    }
    out
}

fn user_message(msg: &ModelMessage) -> Value {
    if let Some(text) = msg.as_text() {
        return json!({ "role": "user", "content": text });
    }
    let parts: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|p| match p {
            ModelContent::Text { text } => Some(json!({ "type": "text", "text": text })),
            ModelContent::File { media_type, base64 } => Some(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{media_type};base64,{base64}") },
            })),
            _ => None,
        })
        .collect();
    json!({ "role": "user", "content": parts })
}

/// Assistant turns mix text and tool calls.  OpenAI requires the tool calls
/// on the assistant message itself, so text and calls are merged into one
/// wire message.
fn assistant_messages(msg: &ModelMessage, out: &mut Vec<Value>) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in &msg.content {
        match part {
            ModelContent::Text { text: t } => text.push_str(t),
            ModelContent::ToolCall {
                tool_id,
                name,
                input,
            } => tool_calls.push(json!({
                "id": tool_id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() },
            })),
            _ => {}
        }
    }
    let mut m = json!({ "role": "assistant" });
    if !text.is_empty() {
        m["content"] = json!(text);
    }
    if !tool_calls.is_empty() {
        m["tool_calls"] = json!(tool_calls);
    }
    out.push(m);
}

fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "tool_calls" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn stream(&self, req: StreamRequest) -> anyhow::Result<ChunkStream> {
        let messages = build_messages(&req);
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self.http.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req.send().await.context("completion request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("provider error {status}: {text}");
        }

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            // SSE events can be split across TCP packets; keep a line buffer
            // across chunks and only parse complete lines.
            let mut buf = String::new();
            let mut text_open = false;
            let mut reasoning_open = false;
            // Tool ids by the provider's parallel-call index, in open order.
            let mut tools_by_index: HashMap<u64, String> = HashMap::new();
            let mut tool_order: Vec<String> = Vec::new();
            let mut usage: Option<Usage> = None;
            let mut finish: Option<FinishReason> = None;

            'outer: while let Some(chunk) = bytes.next().await {
                let b = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Ok(StreamChunk::Error(format!("stream read failed: {e}")));
                        break 'outer;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&b));
                while let Some(nl) = buf.find('\n') {
                    let line = buf[..nl].trim_end_matches('\r').to_string();
                    buf.replace_range(..nl + 1, "");
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(v) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };

                    if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                        usage = Some(Usage {
                            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
                        });
                    }

                    let delta = &v["choices"][0]["delta"];
                    if let Some(r) = delta["reasoning_content"].as_str() {
                        if !r.is_empty() {
                            if !reasoning_open {
                                reasoning_open = true;
                                yield Ok(StreamChunk::ReasoningStart);
                            }
                            yield Ok(StreamChunk::ReasoningDelta(r.to_string()));
                        }
                    }
                    if let Some(t) = delta["content"].as_str() {
                        if !t.is_empty() {
                            if reasoning_open {
                                reasoning_open = false;
                                yield Ok(StreamChunk::ReasoningEnd);
                            }
                            if !text_open {
                                text_open = true;
                                yield Ok(StreamChunk::TextStart);
                            }
                            yield Ok(StreamChunk::TextDelta(t.to_string()));
                        }
                    }
                    if let Some(calls) = delta["tool_calls"].as_array() {
                        for tc in calls {
                            let index = tc["index"].as_u64().unwrap_or(0);
                            let id = tc["id"].as_str().unwrap_or("");
                            let name = tc["function"]["name"].as_str().unwrap_or("");
                            if !tools_by_index.contains_key(&index) && !id.is_empty() {
                                tools_by_index.insert(index, id.to_string());
                                tool_order.push(id.to_string());
                                yield Ok(StreamChunk::ToolInputStart {
                                    tool_id: id.to_string(),
                                    name: name.to_string(),
                                });
                            }
                            if let Some(args) = tc["function"]["arguments"].as_str() {
                                if !args.is_empty() {
                                    if let Some(tool_id) = tools_by_index.get(&index) {
                                        yield Ok(StreamChunk::ToolInputDelta {
                                            tool_id: tool_id.clone(),
                                            delta: args.to_string(),
                                        });
                                    }
                                }
                            }
                        }
                    }
                    if let Some(reason) = v["choices"][0]["finish_reason"].as_str() {
                        finish = Some(map_finish_reason(reason));
                    }
                }
            }

            if reasoning_open {
                yield Ok(StreamChunk::ReasoningEnd);
            }
            if text_open {
                yield Ok(StreamChunk::TextEnd);
            }
            for tool_id in tool_order {
                yield Ok(StreamChunk::ToolInputEnd { tool_id });
            }
            yield Ok(StreamChunk::Finish {
                usage,
                reason: finish.unwrap_or(FinishReason::Stop),
            });
        };
        Ok(Box::pin(stream))
    }
}

/// `GET /models` for OpenAI-compatible servers.  Returns the raw model ids;
/// the registry enriches them with embedded catalog metadata.
pub(crate) async fn fetch_model_ids(
    base_url: &str,
    api_key: Option<&str>,
) -> anyhow::Result<Vec<String>> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let http = reqwest::Client::new();
    let mut req = http.get(&url).timeout(MODELS_TIMEOUT);
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await.context("models request failed")?;
    if !resp.status().is_success() {
        bail!("models endpoint returned {}", resp.status());
    }
    let v: Value = resp.json().await.context("models response was not JSON")?;
    let ids = v["data"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| m["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(ids)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
