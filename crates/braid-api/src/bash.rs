// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `bash.*` procedures: the process manager surface.

use std::time::Duration;

use serde_json::{json, Value};

use braid_bash::{BashMode, ExecuteOptions};
use braid_core::AppContext;
use braid_rpc::{Procedure, RouterBuilder, RpcError};

use crate::helpers::req_str;

fn bash_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "bashId": { "type": "string", "minLength": 1 } },
        "required": ["bashId"]
    })
}

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "bash.execute",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "minLength": 1 },
                        "mode": { "enum": ["active", "background"] },
                        "cwd": { "type": "string" },
                        "timeoutSecs": { "type": "integer", "minimum": 1, "maximum": 600 }
                    },
                    "required": ["command"]
                }),
                |ctx: AppContext, input| async move {
                    let command = req_str(&input, "command")?;
                    let mode = match input.get("mode").and_then(Value::as_str) {
                        Some("background") => BashMode::Background,
                        _ => BashMode::Active,
                    };
                    let opts = ExecuteOptions {
                        mode,
                        cwd: input.get("cwd").and_then(Value::as_str).map(str::to_string),
                        timeout: input
                            .get("timeoutSecs")
                            .and_then(Value::as_u64)
                            .map(Duration::from_secs),
                    };
                    let bash_id = ctx
                        .bash
                        .execute(&command, opts)
                        .await
                        .map_err(|e| RpcError::internal(e.to_string()))?;
                    Ok(json!({ "bashId": bash_id }))
                },
            ),
        )
        .procedure(
            "bash.list",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                Ok(json!({ "processes": ctx.bash.list() }))
            }),
        )
        .procedure(
            "bash.get",
            Procedure::query(bash_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "bashId")?;
                Ok(json!({ "process": ctx.bash.get(&id) }))
            }),
        )
        .procedure(
            "bash.kill",
            Procedure::mutation(bash_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "bashId")?;
                Ok(json!({ "killed": ctx.bash.kill(&id).await }))
            }),
        )
        .procedure(
            "bash.demote",
            Procedure::mutation(bash_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "bashId")?;
                Ok(json!({ "demoted": ctx.bash.demote(&id).await }))
            }),
        )
        .procedure(
            "bash.promote",
            Procedure::mutation(bash_id_schema(), |ctx: AppContext, input| async move {
                let id = req_str(&input, "bashId")?;
                Ok(json!({ "promoted": ctx.bash.promote(&id).await }))
            }),
        )
        .procedure(
            "bash.getActive",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                Ok(json!({
                    "process": ctx.bash.get_active(),
                    "bashId": ctx.bash.get_active_bash_id(),
                }))
            }),
        )
        .procedure(
            "bash.getActiveQueueLength",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                Ok(json!({ "length": ctx.bash.get_active_queue_length() }))
            }),
        )
}
