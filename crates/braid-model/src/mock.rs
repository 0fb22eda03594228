// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use braid_types::FinishReason;

use crate::{
    catalog, CapabilitySet, ChunkStream, ModelClient, ModelInfo, ModelRole, Provider,
    ProviderConfig, ProviderConfigField, StreamChunk, StreamRequest, Usage,
};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.  No network, no configuration.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }
    fn name(&self) -> &str {
        "Mock"
    }
    fn description(&self) -> &str {
        "Mock provider for tests (no network, echoes input)"
    }
    fn config_schema(&self) -> Vec<ProviderConfigField> {
        vec![]
    }
    async fn fetch_models(&self, _config: &ProviderConfig) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(catalog::embedded_catalog("mock"))
    }
    fn get_model_details(&self, model: &str) -> Option<ModelInfo> {
        catalog::lookup("mock", model)
    }
    fn get_model_capabilities(&self, model: &str) -> CapabilitySet {
        catalog::lookup("mock", model)
            .map(|m| m.capabilities)
            .unwrap_or_default()
    }
    fn create_client(
        &self,
        _config: &ProviderConfig,
        _model: &str,
    ) -> anyhow::Result<Arc<dyn ModelClient>> {
        Ok(Arc::new(EchoClient))
    }
}

struct EchoClient;

#[async_trait]
impl ModelClient for EchoClient {
    async fn stream(&self, req: StreamRequest) -> anyhow::Result<ChunkStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ModelRole::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        let chunks: Vec<anyhow::Result<StreamChunk>> = vec![
            Ok(StreamChunk::TextStart),
            Ok(StreamChunk::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamChunk::TextEnd),
            Ok(StreamChunk::Finish {
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 10,
                }),
                reason: FinishReason::Stop,
            }),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// A pre-scripted provider.  Each `stream` call pops the next chunk script
/// from the front of the queue, so tests can specify exact sequences —
/// including tool calls and aborts — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamChunk>>>>,
    /// The last [`StreamRequest`] seen by any client of this provider.
    /// Written on each `stream` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<StreamRequest>>>,
}

impl ScriptedProvider {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// chunk sequence emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        })
    }

    /// Convenience: a single text reply streamed as three deltas.
    pub fn always_text(reply: impl Into<String>) -> Arc<Self> {
        let r = reply.into();
        let third = r.len() / 3;
        let (a, rest) = r.split_at(third.max(1).min(r.len()));
        let (b, c) = rest.split_at((third.max(1)).min(rest.len()));
        Self::new(vec![vec![
            StreamChunk::TextStart,
            StreamChunk::TextDelta(a.to_string()),
            StreamChunk::TextDelta(b.to_string()),
            StreamChunk::TextDelta(c.to_string()),
            StreamChunk::TextEnd,
            StreamChunk::Finish {
                usage: Some(Usage {
                    prompt_tokens: 5,
                    completion_tokens: 5,
                }),
                reason: FinishReason::Stop,
            },
        ]])
    }

    /// Convenience: one tool call round followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Arc<Self> {
        Self::new(vec![
            vec![
                StreamChunk::ToolCall {
                    tool_id: tool_id.into(),
                    name: tool_name.into(),
                    input: args,
                },
                StreamChunk::Finish {
                    usage: Some(Usage {
                        prompt_tokens: 5,
                        completion_tokens: 2,
                    }),
                    reason: FinishReason::ToolCalls,
                },
            ],
            vec![
                StreamChunk::TextStart,
                StreamChunk::TextDelta(final_text.into()),
                StreamChunk::TextEnd,
                StreamChunk::Finish {
                    usage: Some(Usage {
                        prompt_tokens: 7,
                        completion_tokens: 3,
                    }),
                    reason: FinishReason::Stop,
                },
            ],
        ])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "mock"
    }
    fn name(&self) -> &str {
        "Scripted mock"
    }
    fn description(&self) -> &str {
        "Pre-scripted mock provider for orchestrator tests"
    }
    fn config_schema(&self) -> Vec<ProviderConfigField> {
        vec![]
    }
    async fn fetch_models(&self, _config: &ProviderConfig) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(catalog::embedded_catalog("mock"))
    }
    fn get_model_details(&self, model: &str) -> Option<ModelInfo> {
        catalog::lookup("mock", model)
    }
    fn get_model_capabilities(&self, model: &str) -> CapabilitySet {
        catalog::lookup("mock", model)
            .map(|m| m.capabilities)
            .unwrap_or_default()
    }
    fn create_client(
        &self,
        _config: &ProviderConfig,
        _model: &str,
    ) -> anyhow::Result<Arc<dyn ModelClient>> {
        Ok(Arc::new(ScriptedClient {
            scripts: self.scripts.clone(),
            last_request: self.last_request.clone(),
        }))
    }
}

pub struct ScriptedClient {
    scripts: Arc<Mutex<Vec<Vec<StreamChunk>>>>,
    last_request: Arc<Mutex<Option<StreamRequest>>>,
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(&self, req: StreamRequest) -> anyhow::Result<ChunkStream> {
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(req);
        let chunks = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                vec![
                    StreamChunk::TextStart,
                    StreamChunk::TextDelta("[no more scripts]".into()),
                    StreamChunk::TextEnd,
                    StreamChunk::Finish {
                        usage: None,
                        reason: FinishReason::Stop,
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamChunk>> = chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    fn req(text: &str) -> StreamRequest {
        StreamRequest {
            system: vec![],
            messages: vec![crate::ModelMessage::user(text)],
            tools: vec![],
        }
    }

    async fn collect(mut s: ChunkStream) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(c) = s.next().await {
            out.push(c.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn echo_client_replies_with_last_user_message() {
        let p = MockProvider;
        let client = p.create_client(&ProviderConfig::new(), "mock-model").unwrap();
        let chunks = collect(client.stream(req("hi")).await.unwrap()).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::TextDelta(t) if t.contains("MOCK: hi"))));
        assert!(matches!(chunks.last(), Some(StreamChunk::Finish { .. })));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedProvider::tool_then_text("t1", "bash", json!({"command": "ls"}), "done");
        let client = p.create_client(&ProviderConfig::new(), "mock-model").unwrap();

        let round1 = collect(client.stream(req("go")).await.unwrap()).await;
        assert!(round1
            .iter()
            .any(|c| matches!(c, StreamChunk::ToolCall { name, .. } if name == "bash")));

        let round2 = collect(client.stream(req("go")).await.unwrap()).await;
        assert!(round2
            .iter()
            .any(|c| matches!(c, StreamChunk::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedProvider::always_text("ok");
        let client = p.create_client(&ProviderConfig::new(), "mock-model").unwrap();
        let _ = client.stream(req("inspect me")).await.unwrap();
        let seen = p.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(seen.messages[0].as_text(), Some("inspect me"));
    }

    #[tokio::test]
    async fn scripted_falls_back_when_exhausted() {
        let p = ScriptedProvider::new(vec![]);
        let client = p.create_client(&ProviderConfig::new(), "mock-model").unwrap();
        let chunks = collect(client.stream(req("x")).await.unwrap()).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::TextDelta(t) if t.contains("no more scripts"))));
    }
}
