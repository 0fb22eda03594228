// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket client transport.
//!
//! Implements [`braid_rpc::Transport`] over a WebSocket connection with
//! auto-reconnection (exponential backoff with jitter) and automatic
//! resubscription of in-flight subscriptions after a reconnect.  The
//! transport does NOT replay events missed while disconnected — a caller
//! that wants resumable delivery threads a cursor through its
//! subscription `input` and resubscribes from its own watermark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use braid_rpc::{
    Backoff, ProcedureKind, RpcError, Transport, ValueStream, WsFrame, WsFrameType,
};

struct SubEntry {
    path: String,
    kind: ProcedureKind,
    input: Value,
    select: Option<Value>,
    tx: mpsc::Sender<Result<Value, RpcError>>,
}

struct WsState {
    url: String,
    next_id: AtomicU64,
    out_tx: mpsc::Sender<WsFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
    subs: Mutex<HashMap<u64, SubEntry>>,
}

impl WsState {
    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SubEntry>> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A dropped connection fails every in-flight request; subscriptions
    /// stay registered and are re-opened on reconnect.
    fn fail_pending(&self, reason: &str) {
        for (_, tx) in self.lock_pending().drain() {
            let _ = tx.send(Err(RpcError::internal(reason)));
        }
    }

    fn request_payload(entry: &SubEntry) -> Value {
        let mut payload = json!({
            "path": entry.path,
            "kind": entry.kind,
            "input": entry.input,
        });
        if let Some(select) = &entry.select {
            payload["select"] = select.clone();
        }
        payload
    }
}

/// The client half of the WebSocket transport.
pub struct WsTransport {
    state: Arc<WsState>,
}

impl WsTransport {
    /// Connect to `url` (e.g. `ws://127.0.0.1:4180/ws`).  The connection is
    /// established lazily by the background driver; calls made while the
    /// socket is down fail and may be retried by the caller.
    pub fn connect(url: impl Into<String>) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let state = Arc::new(WsState {
            url: url.into(),
            next_id: AtomicU64::new(1),
            out_tx,
            pending: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
        });
        tokio::spawn(drive(state.clone(), out_rx));
        Arc::new(Self { state })
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Own the socket across reconnects.
async fn drive(state: Arc<WsState>, mut out_rx: mpsc::Receiver<WsFrame>) {
    let mut backoff = Backoff::default();
    loop {
        let socket = match tokio_tungstenite::connect_async(&state.url).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                let delay = backoff.next_delay();
                debug!(url = %state.url, "connect failed ({e}); retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        backoff.reset();
        debug!(url = %state.url, "websocket transport connected");
        let (mut sink, mut stream) = socket.split();

        // Re-open every registered subscription with its original id and
        // input.  The server starts live delivery from "now"; any cursor
        // the caller threaded through the input governs replay.
        let reopen: Vec<WsFrame> = state
            .lock_subs()
            .iter()
            .map(|(id, entry)| WsFrame {
                id: *id,
                frame_type: WsFrameType::Request,
                payload: Some(WsState::request_payload(entry)),
            })
            .collect();
        let mut connection_ok = true;
        for frame in reopen {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                connection_ok = false;
                break;
            }
        }

        while connection_ok {
            tokio::select! {
                outgoing = out_rx.recv() => match outgoing {
                    // All transport handles dropped; shut down for good.
                    None => return,
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsFrame>(&text) {
                            Ok(frame) => dispatch(&state, frame).await,
                            Err(e) => warn!("unparseable server frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("websocket read error: {e}");
                        break;
                    }
                },
            }
        }

        state.fail_pending("connection lost");
        let delay = backoff.next_delay();
        debug!("websocket transport disconnected; reconnecting in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

async fn dispatch(state: &Arc<WsState>, frame: WsFrame) {
    match frame.frame_type {
        WsFrameType::Response => {
            if let Some(tx) = state.lock_pending().remove(&frame.id) {
                let _ = tx.send(Ok(frame.payload.unwrap_or(Value::Null)));
            }
        }
        WsFrameType::Update => {
            let tx = state.lock_subs().get(&frame.id).map(|e| e.tx.clone());
            if let Some(tx) = tx {
                if tx
                    .send(Ok(frame.payload.unwrap_or(Value::Null)))
                    .await
                    .is_err()
                {
                    // Consumer dropped the stream; tell the server.
                    state.lock_subs().remove(&frame.id);
                    let _ = state.out_tx.send(WsFrame::unsubscribe(frame.id)).await;
                }
            }
        }
        WsFrameType::Error => {
            let error: RpcError = frame
                .payload
                .and_then(|p| serde_json::from_value::<braid_rpc::WireError>(p).ok())
                .map(Into::into)
                .unwrap_or_else(|| RpcError::internal("unknown server error"));
            if let Some(tx) = state.lock_pending().remove(&frame.id) {
                let _ = tx.send(Err(error));
                return;
            }
            // Subscription errors are terminal: deliver, then close.
            if let Some(entry) = state.lock_subs().remove(&frame.id) {
                let _ = entry.tx.send(Err(error)).await;
            }
        }
        WsFrameType::Complete => {
            // Dropping the sender ends the consumer's stream.
            state.lock_subs().remove(&frame.id);
        }
        // Server-side frame types; never received here.
        WsFrameType::Request | WsFrameType::Unsubscribe => {}
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn call(
        &self,
        path: &str,
        kind: ProcedureKind,
        input: Value,
        select: Option<Value>,
    ) -> Result<Value, RpcError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.state.lock_pending().insert(id, tx);

        let mut payload = json!({ "path": path, "kind": kind, "input": input });
        if let Some(select) = select {
            payload["select"] = select;
        }
        let frame = WsFrame {
            id,
            frame_type: WsFrameType::Request,
            payload: Some(payload),
        };
        if self.state.out_tx.send(frame).await.is_err() {
            self.state.lock_pending().remove(&id);
            return Err(RpcError::internal("transport closed"));
        }
        rx.await
            .unwrap_or_else(|_| Err(RpcError::internal("connection lost")))
    }

    async fn subscribe(
        &self,
        path: &str,
        input: Value,
        select: Option<Value>,
    ) -> Result<ValueStream, RpcError> {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel(64);
        let entry = SubEntry {
            path: path.to_string(),
            kind: ProcedureKind::Subscription,
            input,
            select,
            tx,
        };
        let frame = WsFrame {
            id,
            frame_type: WsFrameType::Request,
            payload: Some(WsState::request_payload(&entry)),
        };
        self.state.lock_subs().insert(id, entry);
        if self.state.out_tx.send(frame).await.is_err() {
            self.state.lock_subs().remove(&id);
            return Err(RpcError::internal("transport closed"));
        }
        Ok(Box::pin(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        ))
    }
}
