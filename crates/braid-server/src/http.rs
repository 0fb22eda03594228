// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use braid_rpc::{ErrorKind, HttpRequest, ProcedureKind, RpcError};

use crate::ServerState;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ProviderNotConfigured => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: RpcError) -> Response {
    (
        status_for(e.kind),
        Json(json!({ "ok": false, "error": e.to_wire() })),
    )
        .into_response()
}

/// `POST /rpc` — one call per request, body `{path, kind, input, select?}`.
/// Subscriptions are not served here; use SSE or the WebSocket.
pub async fn rpc_handler(
    State(state): State<ServerState>,
    Json(req): Json<HttpRequest>,
) -> Response {
    debug!(path = %req.path, kind = ?req.kind, "http rpc");
    if req.kind == ProcedureKind::Subscription {
        return error_response(RpcError::validation(
            "subscriptions are not served over plain HTTP; use /rpc/subscribe or /ws",
        ));
    }
    match state
        .router
        .call_selected(&req.path, req.input, req.select.as_ref())
        .await
    {
        Ok(data) => Json(json!({ "ok": true, "data": data })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}
