// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::procedure::{Procedure, ProcedureKind, ValueStream};
use crate::schema::validate_input;
use crate::select::apply_select;
use crate::RpcError;

/// Builds the immutable path → procedure table.
///
/// Procedures form a tree; the dotted path (`session.updateTitle`) is the
/// dispatch key.  Registration panics on duplicate paths — the catalog is
/// declared once at startup, so a duplicate is a programming error.
pub struct RouterBuilder<C> {
    procedures: HashMap<String, Procedure<C>>,
}

impl<C: Clone + Send + Sync + 'static> RouterBuilder<C> {
    pub fn new() -> Self {
        Self {
            procedures: HashMap::new(),
        }
    }

    pub fn procedure(mut self, path: &str, procedure: Procedure<C>) -> Self {
        let prev = self.procedures.insert(path.to_string(), procedure);
        assert!(prev.is_none(), "duplicate procedure path: {path}");
        self
    }

    /// Bind the context and freeze the table.  Context is injected once
    /// here; resolvers never reach for process-global state.
    pub fn build(self, ctx: C) -> Arc<Router<C>> {
        Arc::new(Router {
            ctx,
            procedures: self.procedures,
        })
    }
}

impl<C: Clone + Send + Sync + 'static> Default for RouterBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-process transport: direct dispatch with zero serialization.
/// Every other transport (HTTP, SSE, WebSocket) funnels into this.
pub struct Router<C> {
    ctx: C,
    procedures: HashMap<String, Procedure<C>>,
}

/// Transports encode "no input" as JSON null; procedures declare object
/// schemas.  Normalize so argument-free calls need no boilerplate.
fn normalize_input(input: Value) -> Value {
    if input.is_null() {
        json!({})
    } else {
        input
    }
}

impl<C: Clone + Send + Sync + 'static> Router<C> {
    fn procedure(&self, path: &str) -> Result<&Procedure<C>, RpcError> {
        self.procedures
            .get(path)
            .ok_or_else(|| RpcError::not_found(format!("unknown procedure: {path}")))
    }

    /// Invoke a query or mutation resolver.
    pub async fn call(&self, path: &str, input: Value) -> Result<Value, RpcError> {
        self.call_selected(path, input, None).await
    }

    /// Invoke a resolver and prune the output to `select`.
    pub async fn call_selected(
        &self,
        path: &str,
        input: Value,
        select: Option<&Value>,
    ) -> Result<Value, RpcError> {
        let proc = self.procedure(path)?;
        let Some(resolver) = &proc.resolver else {
            return Err(RpcError::validation(format!(
                "procedure {path} has no one-shot resolver"
            )));
        };
        let input = normalize_input(input);
        validate_input(&proc.input_schema, &input)?;
        debug!(path, "dispatch");
        let out = resolver(self.ctx.clone(), input).await?;
        Ok(apply_select(out, select))
    }

    /// Open a subscription.  Field selection applies to every update.
    pub async fn subscribe(&self, path: &str, input: Value) -> Result<ValueStream, RpcError> {
        self.subscribe_selected(path, input, None).await
    }

    pub async fn subscribe_selected(
        &self,
        path: &str,
        input: Value,
        select: Option<Value>,
    ) -> Result<ValueStream, RpcError> {
        let proc = self.procedure(path)?;
        let Some(subscription) = &proc.subscription else {
            return Err(RpcError::validation(format!(
                "procedure {path} has no subscription resolver"
            )));
        };
        let input = normalize_input(input);
        validate_input(&proc.input_schema, &input)?;
        debug!(path, "subscribe");
        let stream = subscription(self.ctx.clone(), input).await?;
        match select {
            None => Ok(stream),
            Some(sel) => Ok(Box::pin(stream.map(move |item| {
                item.map(|v| apply_select(v, Some(&sel)))
            }))),
        }
    }

    /// The full procedure inventory: `(path, kind, has_subscription)`.
    pub fn inventory(&self) -> Vec<(String, ProcedureKind, bool)> {
        let mut paths: Vec<_> = self
            .procedures
            .iter()
            .map(|(p, proc)| (p.clone(), proc.kind, proc.has_subscription()))
            .collect();
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        paths
    }

    /// Schema documentation for one procedure.
    pub fn describe(&self, path: &str) -> Option<Value> {
        self.procedures.get(path).map(|p| {
            json!({
                "path": path,
                "kind": p.kind,
                "input": p.input_schema,
                "subscribable": p.has_subscription(),
            })
        })
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn router() -> Arc<Router<u32>> {
        RouterBuilder::new()
            .procedure(
                "math.add",
                Procedure::query(
                    json!({
                        "type": "object",
                        "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                        "required": ["a", "b"]
                    }),
                    |ctx: u32, input| async move {
                        let a = input["a"].as_i64().unwrap_or(0);
                        let b = input["b"].as_i64().unwrap_or(0);
                        Ok(json!({ "sum": a + b, "ctx": ctx, "extra": "noise" }))
                    },
                ),
            )
            .procedure(
                "tick.watch",
                Procedure::subscription(json!({}), |_ctx, _input| async move {
                    let s: ValueStream = Box::pin(futures::stream::iter(
                        (0..3).map(|i| Ok(json!({ "i": i, "noise": true }))),
                    ));
                    Ok(s)
                }),
            )
            .procedure(
                "noop.ping",
                Procedure::query(json!({ "type": "object" }), |_ctx, _input| async move {
                    Ok(json!({ "pong": true }))
                }),
            )
            .build(7)
    }

    #[tokio::test]
    async fn dispatch_resolves_by_dotted_path() {
        let r = router();
        let out = r.call("math.add", json!({ "a": 2, "b": 3 })).await.unwrap();
        assert_eq!(out["sum"], 5);
        assert_eq!(out["ctx"], 7, "bound context reaches the resolver");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let r = router();
        let err = r.call("math.sub", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_resolver() {
        let r = router();
        let err = r.call("math.add", json!({ "a": 2 })).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn select_prunes_call_output() {
        let r = router();
        let out = r
            .call_selected("math.add", json!({ "a": 1, "b": 1 }), Some(&json!({ "sum": true })))
            .await
            .unwrap();
        assert_eq!(out, json!({ "sum": 2 }));
    }

    #[tokio::test]
    async fn select_applies_to_every_subscription_update() {
        let r = router();
        let mut s = r
            .subscribe_selected("tick.watch", json!({}), Some(json!({ "i": true })))
            .await
            .unwrap();
        for i in 0..3 {
            let v = s.next().await.unwrap().unwrap();
            assert_eq!(v, json!({ "i": i }));
        }
    }

    #[tokio::test]
    async fn null_input_is_treated_as_empty_object() {
        let r = router();
        let out = r.call("noop.ping", Value::Null).await.unwrap();
        assert_eq!(out["pong"], true);
    }

    #[tokio::test]
    async fn calling_a_pure_subscription_fails() {
        let r = router();
        let err = r.call("tick.watch", json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn inventory_is_sorted() {
        let r = router();
        let inv = r.inventory();
        assert_eq!(inv[0].0, "math.add");
        assert_eq!(inv[1].0, "noop.ping");
        assert_eq!(inv[2].0, "tick.watch");
        assert!(inv[2].2, "subscription flag");
    }

    #[test]
    fn describe_exposes_schema() {
        let r = router();
        let doc = r.describe("math.add").unwrap();
        assert_eq!(doc["kind"], "query");
        assert!(doc["input"]["required"].is_array());
    }
}
