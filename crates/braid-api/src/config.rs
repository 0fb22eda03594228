// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `config.*` procedures.
//!
//! Secrets obey the zero-knowledge contract end to end: `load` strips
//! every field the provider schema marks secret, `save` ignores whatever
//! the client submitted for those fields and merges the on-disk values,
//! and `setProviderSecret` is the only write path.

use std::collections::HashMap;

use serde_json::{json, Value};

use braid_core::AppContext;
use braid_events::channels;
use braid_rpc::{Procedure, RouterBuilder, RpcError};

use crate::helpers::{req_str, to_value};

fn config_err(e: anyhow::Error) -> RpcError {
    RpcError::internal(format!("{e:#}"))
}

async fn publish_config_event(ctx: &AppContext, event: &str, payload: Value) {
    let _ = ctx.broker.publish(channels::CONFIG, event, payload).await;
}

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "config.load",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                Ok(to_value(&ctx.config.sanitized()))
            }),
        )
        .procedure(
            "config.save",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": { "config": { "type": "object" } },
                    "required": ["config"]
                }),
                |ctx: AppContext, input| async move {
                    let incoming: braid_config::Config =
                        serde_json::from_value(input["config"].clone())
                            .map_err(|e| RpcError::validation(format!("invalid config: {e}")))?;
                    let saved = ctx.config.save(incoming).map_err(config_err)?;
                    publish_config_event(&ctx, "config-saved", json!({})).await;
                    Ok(to_value(&saved))
                },
            ),
        )
        .procedure(
            "config.setProviderSecret",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "providerId": { "type": "string", "minLength": 1 },
                        "key": { "type": "string", "minLength": 1 },
                        "value": { "type": "string", "minLength": 1 }
                    },
                    "required": ["providerId", "key", "value"]
                }),
                |ctx: AppContext, input| async move {
                    let credential_id = ctx
                        .config
                        .set_provider_secret(
                            &req_str(&input, "providerId")?,
                            &req_str(&input, "key")?,
                            &req_str(&input, "value")?,
                        )
                        .map_err(|e| RpcError::validation(format!("{e:#}")))?;
                    publish_config_event(&ctx, "provider-secret-set", json!({})).await;
                    Ok(json!({ "credentialId": credential_id }))
                },
            ),
        )
        .procedure(
            "config.getProviders",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                let providers: Vec<Value> = ctx
                    .config
                    .registry()
                    .list()
                    .iter()
                    .map(|p| {
                        let resolved = ctx.config.resolved_provider_config(p.id());
                        json!({
                            "id": p.id(),
                            "name": p.name(),
                            "description": p.description(),
                            "configSchema": p.config_schema(),
                            "configured": p.is_configured(&resolved),
                        })
                    })
                    .collect();
                Ok(json!({ "providers": providers }))
            }),
        )
        .procedure(
            "config.updateProviderConfig",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "providerId": { "type": "string", "minLength": 1 },
                        "fields": { "type": "object" }
                    },
                    "required": ["providerId", "fields"]
                }),
                |ctx: AppContext, input| async move {
                    let provider_id = req_str(&input, "providerId")?;
                    let fields: HashMap<String, String> = input["fields"]
                        .as_object()
                        .map(|o| {
                            o.iter()
                                .filter_map(|(k, v)| {
                                    v.as_str().map(|s| (k.clone(), s.to_string()))
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    ctx.config
                        .update_provider_config(&provider_id, fields)
                        .map_err(config_err)?;
                    publish_config_event(
                        &ctx,
                        "provider-config-updated",
                        json!({ "providerId": provider_id }),
                    )
                    .await;
                    Ok(to_value(&ctx.config.sanitized()))
                },
            ),
        )
        .procedure(
            "config.removeProvider",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": { "providerId": { "type": "string", "minLength": 1 } },
                    "required": ["providerId"]
                }),
                |ctx: AppContext, input| async move {
                    let provider_id = req_str(&input, "providerId")?;
                    let removed = ctx
                        .config
                        .remove_provider(&provider_id)
                        .map_err(config_err)?;
                    publish_config_event(
                        &ctx,
                        "provider-removed",
                        json!({ "providerId": provider_id }),
                    )
                    .await;
                    Ok(json!({ "removed": removed }))
                },
            ),
        )
        .procedure(
            "config.updateRules",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "rules": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "id": { "type": "string", "minLength": 1 },
                                    "name": { "type": "string" },
                                    "content": { "type": "string" },
                                    "enabled_by_default": { "type": "boolean" }
                                },
                                "required": ["id", "name", "content"]
                            }
                        }
                    },
                    "required": ["rules"]
                }),
                |ctx: AppContext, input| async move {
                    let rules: Vec<braid_config::RuleConfig> =
                        serde_json::from_value(input["rules"].clone())
                            .map_err(|e| RpcError::validation(format!("invalid rules: {e}")))?;
                    ctx.config.update_rules(rules).map_err(config_err)?;
                    publish_config_event(&ctx, "rules-updated", json!({})).await;
                    Ok(json!({ "rules": ctx.config.rules() }))
                },
            ),
        )
        .procedure(
            "config.getRules",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                Ok(json!({ "rules": ctx.config.rules() }))
            }),
        )
        .procedure(
            "config.getAgents",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                Ok(json!({ "agents": ctx.agents.ids() }))
            }),
        )
}
