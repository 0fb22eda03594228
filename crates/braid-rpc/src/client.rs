// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The client half of the framework.
//!
//! A client owns a transport (in-process, HTTP, or WebSocket — anything
//! implementing [`Transport`]) and an entity cache keyed by `(type, id)`.
//! Mutations may carry an [`OptimisticSpec`]: the spec's `apply` runs on a
//! draft immediately, subscribers see the draft, and the server result
//! later confirms (authoritative replace) or reverts it.  Concurrent
//! optimistic updates on one entity stack and unwind in LIFO order.
//!
//! Subscription payloads always arrive whole; the advisory [`UpdateMode`]
//! tells the cache how to reconcile them locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::procedure::{ProcedureKind, ValueStream};
use crate::router::Router;
use crate::RpcError;

/// How the client cache reconciles subscription updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Full replacement per event.
    Value,
    /// Append text-like additions (streaming text parts).
    Delta,
    /// Field-level operations, JSON-Patch shaped.
    Patch,
    /// The server chooses based on payload type.
    Auto,
}

/// A transport the client can speak through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        path: &str,
        kind: ProcedureKind,
        input: Value,
        select: Option<Value>,
    ) -> Result<Value, RpcError>;

    async fn subscribe(
        &self,
        path: &str,
        input: Value,
        select: Option<Value>,
    ) -> Result<ValueStream, RpcError>;
}

/// In-process transport: the router itself.  Zero serialization.
#[async_trait]
impl<C: Clone + Send + Sync + 'static> Transport for Router<C> {
    async fn call(
        &self,
        path: &str,
        _kind: ProcedureKind,
        input: Value,
        select: Option<Value>,
    ) -> Result<Value, RpcError> {
        self.call_selected(path, input, select.as_ref()).await
    }

    async fn subscribe(
        &self,
        path: &str,
        input: Value,
        select: Option<Value>,
    ) -> Result<ValueStream, RpcError> {
        self.subscribe_selected(path, input, select).await
    }
}

type ApplyFn = Arc<dyn Fn(&mut Value, &Value, DateTime<Utc>) + Send + Sync>;
type IdFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Declaration attached to a mutation that lets the client apply it to its
/// cache before the server confirms.
#[derive(Clone)]
pub struct OptimisticSpec {
    /// Entity type, the first half of the cache key.
    pub entity: String,
    /// Extracts the entity id from the mutation input.
    pub id: IdFn,
    /// Pure draft transformation: `(draft, input, now)`.
    pub apply: ApplyFn,
}

impl OptimisticSpec {
    pub fn new(
        entity: &str,
        id: impl Fn(&Value) -> Option<String> + Send + Sync + 'static,
        apply: impl Fn(&mut Value, &Value, DateTime<Utc>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            entity: entity.to_string(),
            id: Arc::new(id),
            apply: Arc::new(apply),
        }
    }
}

struct Layer {
    id: u64,
    input: Value,
    apply: ApplyFn,
    time: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    confirmed: Value,
    layers: Vec<Layer>,
}

impl Slot {
    /// The value subscribers see: confirmed plus every pending layer
    /// applied in stack order.
    fn visible(&self) -> Value {
        let mut v = self.confirmed.clone();
        for layer in &self.layers {
            (layer.apply)(&mut v, &layer.input, layer.time);
        }
        v
    }
}

/// In-memory entity cache keyed by `(type, id)`.
#[derive(Default)]
pub struct EntityCache {
    slots: Mutex<HashMap<(String, String), Slot>>,
}

impl EntityCache {
    /// Install the authoritative value (e.g. from a query result).
    pub fn seed(&self, entity: &str, id: &str, value: Value) {
        let mut slots = self.lock();
        let slot = slots
            .entry((entity.to_string(), id.to_string()))
            .or_default();
        slot.confirmed = value;
    }

    pub fn get(&self, entity: &str, id: &str) -> Option<Value> {
        self.lock()
            .get(&(entity.to_string(), id.to_string()))
            .map(Slot::visible)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_layer(&self, entity: &str, id: &str, layer: Layer) {
        let mut slots = self.lock();
        slots
            .entry((entity.to_string(), id.to_string()))
            .or_default()
            .layers
            .push(layer);
    }

    /// Server success: the authoritative value replaces the draft and the
    /// mutation's layer is retired.  Layers stacked above re-apply on top.
    fn confirm(&self, entity: &str, id: &str, layer_id: u64, authoritative: Value) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&(entity.to_string(), id.to_string())) {
            slot.layers.retain(|l| l.id != layer_id);
            slot.confirmed = authoritative;
        }
    }

    /// Server failure: the layer is discarded and the draft unwinds.
    fn revert(&self, entity: &str, id: &str, layer_id: u64) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&(entity.to_string(), id.to_string())) {
            slot.layers.retain(|l| l.id != layer_id);
        }
    }

    /// Reconcile a subscription payload into the confirmed value.
    pub fn apply_update(&self, entity: &str, id: &str, mode: UpdateMode, payload: Value) {
        let mut slots = self.lock();
        let slot = slots
            .entry((entity.to_string(), id.to_string()))
            .or_default();
        match mode {
            UpdateMode::Value | UpdateMode::Auto => slot.confirmed = payload,
            UpdateMode::Delta => apply_delta(&mut slot.confirmed, &payload),
            UpdateMode::Patch => apply_patch(&mut slot.confirmed, &payload),
        }
    }
}

/// Delta payloads: `{field, delta}` appends to a string field; a bare
/// string appends to a string-valued entity.
fn apply_delta(target: &mut Value, payload: &Value) {
    match (payload.get("field").and_then(Value::as_str), payload.get("delta")) {
        (Some(field), Some(Value::String(delta))) => {
            if let Some(Value::String(s)) = target.get_mut(field) {
                s.push_str(delta);
            } else if let Some(obj) = target.as_object_mut() {
                obj.insert(field.to_string(), Value::String(delta.clone()));
            }
        }
        _ => {
            if let (Value::String(s), Value::String(delta)) = (&mut *target, payload) {
                s.push_str(delta);
            }
        }
    }
}

/// Patch payloads: a list of `{op, path, value}` with `/`-separated paths.
/// Supports `replace`, `add`, and `remove` on object members.
fn apply_patch(target: &mut Value, payload: &Value) {
    let Some(ops) = payload.as_array() else { return };
    for op in ops {
        let (Some(kind), Some(path)) = (op["op"].as_str(), op["path"].as_str()) else {
            continue;
        };
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(last) = segments.pop() else { continue };
        let mut node = &mut *target;
        let mut ok = true;
        for seg in segments {
            match node.get_mut(seg) {
                Some(next) => node = next,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        if let Some(obj) = node.as_object_mut() {
            match kind {
                "replace" | "add" => {
                    obj.insert(last.to_string(), op["value"].clone());
                }
                "remove" => {
                    obj.remove(last);
                }
                _ => {}
            }
        }
    }
}

/// A typed client over any transport.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pub cache: EntityCache,
    next_layer: AtomicU64,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: EntityCache::default(),
            next_layer: AtomicU64::new(1),
        }
    }

    pub async fn query(&self, path: &str, input: Value) -> Result<Value, RpcError> {
        self.transport
            .call(path, ProcedureKind::Query, input, None)
            .await
    }

    pub async fn query_selected(
        &self,
        path: &str,
        input: Value,
        select: Value,
    ) -> Result<Value, RpcError> {
        self.transport
            .call(path, ProcedureKind::Query, input, Some(select))
            .await
    }

    pub async fn mutate(&self, path: &str, input: Value) -> Result<Value, RpcError> {
        self.transport
            .call(path, ProcedureKind::Mutation, input, None)
            .await
    }

    /// Mutation with optimistic cache update.
    ///
    /// The draft is visible through [`EntityCache::get`] while the server
    /// round-trip is in flight.  Success confirms the authoritative value;
    /// failure unwinds the draft.
    pub async fn mutate_optimistic(
        &self,
        path: &str,
        input: Value,
        spec: &OptimisticSpec,
    ) -> Result<Value, RpcError> {
        let Some(id) = (spec.id)(&input) else {
            // No entity id in the input — plain mutation.
            return self.mutate(path, input).await;
        };
        let layer_id = self.next_layer.fetch_add(1, Ordering::Relaxed);
        self.cache.push_layer(
            &spec.entity,
            &id,
            Layer {
                id: layer_id,
                input: input.clone(),
                apply: spec.apply.clone(),
                time: Utc::now(),
            },
        );
        match self
            .transport
            .call(path, ProcedureKind::Mutation, input, None)
            .await
        {
            Ok(value) => {
                self.cache.confirm(&spec.entity, &id, layer_id, value.clone());
                Ok(value)
            }
            Err(e) => {
                self.cache.revert(&spec.entity, &id, layer_id);
                Err(e)
            }
        }
    }

    pub async fn subscribe(&self, path: &str, input: Value) -> Result<ValueStream, RpcError> {
        self.transport.subscribe(path, input, None).await
    }

    pub async fn subscribe_selected(
        &self,
        path: &str,
        input: Value,
        select: Value,
    ) -> Result<ValueStream, RpcError> {
        self.transport.subscribe(path, input, Some(select)).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
