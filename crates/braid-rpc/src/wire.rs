// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire framing shared by the HTTP, SSE, and WebSocket transports.
//!
//! # Typical WebSocket session flow
//!
//! ```text
//! Client                               Server
//!    │                                    │
//!    │── {id:1, type:request, payload} ──►│   payload: {path, kind, input}
//!    │◄─ {id:1, type:response, payload} ──│   (query / mutation)
//!    │                                    │
//!    │── {id:2, type:request, payload} ──►│   kind: subscription
//!    │◄─ {id:2, type:update, payload} ────│   × N
//!    │◄─ {id:2, type:complete} ───────────│   (server end)  — or —
//!    │── {id:2, type:unsubscribe} ───────►│   (client end)
//!    │                                    │
//!    │◄─ {id:3, type:error, payload} ─────│   payload: {kind, message}
//! ```
//!
//! Missed events are not replayed by the transport — a client that wants
//! resumable delivery threads a cursor through its subscription `input`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::procedure::ProcedureKind;
use crate::WireError;

/// Body of a plain HTTP call: `POST /rpc` with `{path, kind, input}`.
/// Queries and mutations only; subscriptions are served by SSE/WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub path: String,
    pub kind: ProcedureKind,
    #[serde(default)]
    pub input: Value,
    /// Optional field-selection specifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsFrameType {
    Request,
    Response,
    Update,
    Error,
    Complete,
    Unsubscribe,
}

/// One WebSocket message.  `id` correlates requests with their responses,
/// updates, and terminal frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    pub id: u64,
    #[serde(rename = "type")]
    pub frame_type: WsFrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl WsFrame {
    pub fn request(id: u64, path: &str, kind: ProcedureKind, input: Value) -> Self {
        Self {
            id,
            frame_type: WsFrameType::Request,
            payload: Some(serde_json::json!({ "path": path, "kind": kind, "input": input })),
        }
    }

    pub fn response(id: u64, payload: Value) -> Self {
        Self {
            id,
            frame_type: WsFrameType::Response,
            payload: Some(payload),
        }
    }

    pub fn update(id: u64, payload: Value) -> Self {
        Self {
            id,
            frame_type: WsFrameType::Update,
            payload: Some(payload),
        }
    }

    pub fn error(id: u64, err: WireError) -> Self {
        Self {
            id,
            frame_type: WsFrameType::Error,
            payload: serde_json::to_value(err).ok(),
        }
    }

    pub fn complete(id: u64) -> Self {
        Self {
            id,
            frame_type: WsFrameType::Complete,
            payload: None,
        }
    }

    pub fn unsubscribe(id: u64) -> Self {
        Self {
            id,
            frame_type: WsFrameType::Unsubscribe,
            payload: None,
        }
    }
}

/// One SSE frame: an event with its channel and cursor halves flattened in,
/// so a client can resume with `fromCursor` after a disconnect.  The cursor
/// halves carry the same names the subscribe parameters expect back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseFrame {
    pub id: String,
    pub channel: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    pub sequence: u64,
    pub payload: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ws_request_round_trip() {
        let f = WsFrame::request(3, "session.create", ProcedureKind::Mutation, json!({"a": 1}));
        let s = serde_json::to_string(&f).unwrap();
        let back: WsFrame = serde_json::from_str(&s).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.frame_type, WsFrameType::Request);
        let payload = back.payload.unwrap();
        assert_eq!(payload["path"], "session.create");
        assert_eq!(payload["kind"], "mutation");
    }

    #[test]
    fn complete_frame_has_no_payload() {
        let s = serde_json::to_string(&WsFrame::complete(9)).unwrap();
        assert!(!s.contains("payload"));
        assert!(s.contains("\"complete\""));
    }

    #[test]
    fn http_request_defaults_empty_input() {
        let r: HttpRequest =
            serde_json::from_str(r#"{"path":"session.getCount","kind":"query"}"#).unwrap();
        assert!(r.input.is_null());
        assert!(r.select.is_none());
    }

    #[test]
    fn error_frame_carries_kind_and_message() {
        let f = WsFrame::error(1, crate::RpcError::not_found("session x").to_wire());
        let payload = f.payload.unwrap();
        assert_eq!(payload["kind"], "not-found");
        assert_eq!(payload["message"], "session x");
    }
}
