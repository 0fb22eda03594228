// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Server-side tools the orchestrator executes between provider steps.

mod ask_user;
mod bash;
mod todo_write;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use braid_model::ToolSchema;

use crate::AppContext;

pub use ask_user::AskUserTool;
pub use bash::BashTool;
pub use todo_write::{replace_todos, TodoWriteTool};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub input: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            is_error: true,
        }
    }
}

/// What a tool sees while executing.
pub struct ToolContext {
    pub app: AppContext,
    pub session_id: String,
}

/// Trait every server-side tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn parameters_schema(&self) -> Value;
    /// Label shown by the session-status manager while this tool runs,
    /// e.g. `"Running a command…"`.
    fn status_label(&self) -> &str {
        "Working…"
    }
    /// Execute the tool.  Failures are wrapped in [`ToolOutput::err`].
    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput;
}

/// Central registry holding all available tools.  Immutable after startup.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// The standard tool set.
    pub fn standard() -> Arc<Self> {
        let mut reg = Self::new();
        reg.register(BashTool::default());
        reg.register(TodoWriteTool);
        reg.register(AskUserTool);
        Arc::new(reg)
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for the model, sorted by name.  `enabled` restricts the set
    /// when the session configures `enabled_tool_ids`.
    pub fn schemas(&self, enabled: Option<&[String]>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| enabled.map_or(true, |ids| ids.iter().any(|id| id == t.name())))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(ctx, call).await,
            None => ToolOutput::err(format!("unknown tool: {}", call.name)),
        }
    }

    pub fn status_label(&self, name: &str) -> Option<String> {
        self.tools.get(name).map(|t| t.status_label().to_string())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
