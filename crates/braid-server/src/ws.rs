// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket bridge — translates JSON frames to router dispatch.
//!
//! Each connection can run many concurrent subscriptions; the correlation
//! id in every frame pairs updates with the request that opened them.
//! Missed events are not replayed here — a client that wants resumable
//! delivery threads a cursor through its subscription `input`.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use braid_rpc::{ProcedureKind, RpcError, WsFrame, WsFrameType};

use crate::ServerState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    info!("websocket client connected");
    let (mut sink, mut source) = socket.split();

    // All outgoing frames funnel through one writer task so subscription
    // tasks never contend for the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<WsFrame>(64);
    let writer = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<u64, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = source.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsFrame>(&text) {
                Ok(f) => f,
                Err(e) => {
                    warn!("invalid ws frame: {e}");
                    let _ = out_tx
                        .send(WsFrame::error(
                            0,
                            RpcError::validation(format!("invalid frame: {e}")).to_wire(),
                        ))
                        .await;
                    continue;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match frame.frame_type {
            WsFrameType::Request => {
                let Some(payload) = frame.payload else {
                    let _ = out_tx
                        .send(WsFrame::error(
                            frame.id,
                            RpcError::validation("request frame without payload").to_wire(),
                        ))
                        .await;
                    continue;
                };
                handle_request(&state, &out_tx, &mut subscriptions, frame.id, payload).await;
            }
            WsFrameType::Unsubscribe => {
                if let Some(handle) = subscriptions.remove(&frame.id) {
                    handle.abort();
                    let _ = out_tx.send(WsFrame::complete(frame.id)).await;
                }
            }
            // Clients never send these.
            _ => {}
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    writer.abort();
    info!("websocket client disconnected");
}

async fn handle_request(
    state: &ServerState,
    out_tx: &mpsc::Sender<WsFrame>,
    subscriptions: &mut HashMap<u64, JoinHandle<()>>,
    id: u64,
    payload: Value,
) {
    let path = payload["path"].as_str().unwrap_or_default().to_string();
    let kind: ProcedureKind =
        serde_json::from_value(payload["kind"].clone()).unwrap_or(ProcedureKind::Query);
    let input = payload.get("input").cloned().unwrap_or(Value::Null);
    let select = payload.get("select").cloned().filter(|s| !s.is_null());
    debug!(%path, ?kind, id, "ws request");

    match kind {
        ProcedureKind::Subscription => {
            let router = state.router.clone();
            let tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                match router.subscribe_selected(&path, input, select).await {
                    Ok(mut stream) => {
                        while let Some(item) = stream.next().await {
                            let frame = match item {
                                Ok(v) => WsFrame::update(id, v),
                                Err(e) => {
                                    // Subscription errors are terminal.
                                    let _ = tx.send(WsFrame::error(id, e.to_wire())).await;
                                    break;
                                }
                            };
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(WsFrame::complete(id)).await;
                    }
                    Err(e) => {
                        let _ = tx.send(WsFrame::error(id, e.to_wire())).await;
                    }
                }
            });
            subscriptions.insert(id, handle);
        }
        _ => {
            let result = state
                .router
                .call_selected(&path, input, select.as_ref())
                .await;
            let frame = match result {
                Ok(v) => WsFrame::response(id, v),
                Err(e) => WsFrame::error(id, e.to_wire()),
            };
            let _ = out_tx.send(frame).await;
        }
    }
}
