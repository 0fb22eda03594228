// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use braid_bash::{BashMode, ExecuteOptions};

use super::{Tool, ToolCall, ToolContext, ToolOutput};

/// Byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Runs a shell command through the bash manager and returns its output.
///
/// `background: true` spawns without waiting and returns the bash id so
/// the model can poll it later via the bash queries.
pub struct BashTool {
    pub default_timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required. Set 'background': true for long-running\n\
         processes (servers, watchers); the call returns a bashId immediately.\n\
         Output is capped at ~20 KB. Prefer non-interactive commands."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash one-liner to execute."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional)."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (1-600, default 120)."
                },
                "background": {
                    "type": "boolean",
                    "description": "Spawn without waiting for completion."
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn status_label(&self) -> &str {
        "Running a command…"
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(command) = call.input.get("command").and_then(Value::as_str) else {
            return ToolOutput::err("missing required 'command' argument");
        };
        let cwd = call
            .input
            .get("cwd")
            .and_then(Value::as_str)
            .map(str::to_string);
        let timeout_secs = call
            .input
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout_secs);
        let background = call
            .input
            .get("background")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        debug!(cmd = %command, background, "bash tool");
        // Tool-driven commands always use the background pool; the single
        // active slot belongs to the user's interactive shell.
        let opts = ExecuteOptions {
            mode: BashMode::Background,
            cwd,
            timeout: Some(Duration::from_secs(timeout_secs)),
        };
        let bash_id = match ctx.app.bash.execute(command, opts).await {
            Ok(id) => id,
            Err(e) => return ToolOutput::err(e.to_string()),
        };
        if background {
            return ToolOutput::ok(format!("started background process {bash_id}"));
        }

        // Wait for the process to reach a terminal status.
        loop {
            let Some(p) = ctx.app.bash.get(&bash_id) else {
                return ToolOutput::err("process disappeared");
            };
            if p.status.is_terminal() {
                let mut content = String::new();
                if !p.stdout.is_empty() {
                    content.push_str(&truncate(&p.stdout));
                }
                if !p.stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&truncate(&p.stderr));
                }
                let code = p.exit_code.unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                }
                return match p.status {
                    braid_bash::BashStatus::Completed => ToolOutput::ok(content),
                    braid_bash::BashStatus::Timeout => {
                        ToolOutput::err(format!("timeout after {timeout_secs}s\n{content}"))
                    }
                    _ => ToolOutput::err(format!("[exit {code}]\n{content}")),
                };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }
    let mut end = OUTPUT_LIMIT_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[{} bytes omitted]", &s[..end], s.len() - end)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
