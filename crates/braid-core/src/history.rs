// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation history → provider-neutral model messages.
//!
//! The full session history (messages × steps × parts) is rebuilt into the
//! message sequence a provider client consumes.  Binary file parts become
//! typed file entries when the model accepts them, XML-wrapped text
//! otherwise.  The system prompt is assembled from the session's agent and
//! enabled rules; the caller snapshots the blocks onto each step.

use base64::Engine;

use braid_model::{CapabilitySet, ModelContent, ModelMessage};
use braid_store::Store;
use braid_types::{FileBody, MessageRole, PartPayload, RunStatus, Session};

use crate::AppContext;

/// System prompt blocks in effect for a session: agent prompt first, then
/// every enabled rule in the session's order.
pub fn build_system_blocks(app: &AppContext, session: &Session) -> Vec<String> {
    let mut blocks = vec![app.agents.prompt(&session.agent_id).to_string()];
    let rules = app.config.rules();
    for rule_id in &session.enabled_rule_ids {
        if let Some(rule) = rules.iter().find(|r| &r.id == rule_id) {
            blocks.push(rule.content.clone());
        }
    }
    blocks
}

fn xml_wrapped_file(relative_path: &str, media_type: &str, text: Option<&str>) -> String {
    format!(
        "<file path=\"{relative_path}\" media-type=\"{media_type}\">\n{}\n</file>",
        text.unwrap_or("(binary content omitted)")
    )
}

async fn file_base64(app: &AppContext, body: &FileBody) -> Option<String> {
    match body {
        FileBody::Inline { base64 } => Some(base64.clone()),
        FileBody::Stored { file_id } => {
            let record = app.store.files.get(file_id).await.ok().flatten()?;
            let bytes = app.store.files.get_blob(&record.storage_key).await.ok().flatten()?;
            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

/// Rebuild the provider-neutral message sequence for one session.
pub async fn build_model_messages(
    app: &AppContext,
    store: &Store,
    session_id: &str,
    caps: &CapabilitySet,
) -> anyhow::Result<Vec<ModelMessage>> {
    let mut out = Vec::new();
    for message in store.messages.list_messages(session_id).await? {
        let steps = store.messages.list_steps(&message.id).await?;
        match message.role {
            MessageRole::User => {
                let mut content = Vec::new();
                for step in &steps {
                    for part in store.messages.list_parts(&step.id).await? {
                        match &part.payload {
                            PartPayload::Text { content: text } => {
                                content.push(ModelContent::Text { text: text.clone() })
                            }
                            PartPayload::File {
                                relative_path,
                                media_type,
                                body,
                                ..
                            } => {
                                if caps.supports_images() {
                                    if let Some(b64) = file_base64(app, body).await {
                                        content.push(ModelContent::File {
                                            media_type: media_type.clone(),
                                            base64: b64,
                                        });
                                        continue;
                                    }
                                }
                                let record_text = match body {
                                    FileBody::Stored { file_id } => app
                                        .store
                                        .files
                                        .get(file_id)
                                        .await
                                        .ok()
                                        .flatten()
                                        .and_then(|r| r.text_content),
                                    FileBody::Inline { .. } => None,
                                };
                                content.push(ModelContent::Text {
                                    text: xml_wrapped_file(
                                        relative_path,
                                        media_type,
                                        record_text.as_deref(),
                                    ),
                                });
                            }
                            PartPayload::Error { message: m } => content.push(
                                ModelContent::Text {
                                    text: format!("<error>{m}</error>"),
                                },
                            ),
                            _ => {}
                        }
                    }
                }
                if !content.is_empty() {
                    out.push(ModelMessage::user_with_content(content));
                }
            }
            MessageRole::Assistant => {
                for step in &steps {
                    let mut assistant_content = Vec::new();
                    let mut tool_results = Vec::new();
                    for part in store.messages.list_parts(&step.id).await? {
                        match &part.payload {
                            PartPayload::Text { content: text } => {
                                // Parts aborted mid-delta still carry the
                                // streamed prefix; replay it as-is.
                                if !text.is_empty() {
                                    assistant_content
                                        .push(ModelContent::Text { text: text.clone() });
                                }
                            }
                            PartPayload::Tool {
                                tool_id,
                                tool_name,
                                input,
                                result,
                                error,
                                ..
                            } => {
                                assistant_content.push(ModelContent::ToolCall {
                                    tool_id: tool_id.clone(),
                                    name: tool_name.clone(),
                                    input: input.clone(),
                                });
                                let (output, is_error) = match (result, error) {
                                    (_, Some(e)) => (e.clone(), true),
                                    (Some(r), None) => (r.clone(), false),
                                    (None, None) => match part.status {
                                        RunStatus::Abort => ("aborted".to_string(), true),
                                        _ => ("(no result)".to_string(), true),
                                    },
                                };
                                tool_results.push(ModelMessage::tool_result(
                                    tool_id.clone(),
                                    output,
                                    is_error,
                                ));
                            }
                            // Reasoning is never replayed to the provider.
                            _ => {}
                        }
                    }
                    if !assistant_content.is_empty() {
                        out.push(ModelMessage {
                            role: braid_model::ModelRole::Assistant,
                            content: assistant_content,
                        });
                    }
                    out.append(&mut tool_results);
                }
            }
        }
    }
    Ok(out)
}
