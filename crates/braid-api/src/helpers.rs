// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use braid_rpc::RpcError;
use braid_store::StoreError;
use braid_types::Session;

use braid_core::AppContext;

pub fn store_err(e: StoreError) -> RpcError {
    match e {
        StoreError::NotFound(m) => RpcError::not_found(m),
        other => RpcError::storage(other),
    }
}

pub fn to_value<T: serde::Serialize>(t: &T) -> Value {
    serde_json::to_value(t).unwrap_or(Value::Null)
}

pub fn req_str(input: &Value, key: &str) -> Result<String, RpcError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::validation(format!("missing required field {key:?}")))
}

pub fn opt_str(input: &Value, key: &str) -> Option<String> {
    input.get(key).and_then(Value::as_str).map(str::to_string)
}

pub async fn load_session(ctx: &AppContext, session_id: &str) -> Result<Session, RpcError> {
    ctx.store
        .sessions
        .get(session_id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("session {session_id}")))
}

/// Persist a session mutation and publish `session-updated` on the
/// session's model channel.  Returns the session snapshot.
pub async fn save_and_publish(
    ctx: &AppContext,
    mut session: Session,
) -> Result<Value, RpcError> {
    session.touch();
    ctx.store.sessions.update(&session).await.map_err(store_err)?;
    ctx.broker
        .publish(
            &braid_events::channels::session(&session.id),
            "session-updated",
            serde_json::json!({ "session": session }),
        )
        .await
        .map_err(|e| RpcError::storage(e))?;
    Ok(to_value(&session))
}
