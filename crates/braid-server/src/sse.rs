// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use braid_rpc::SseFrame;
use braid_types::Cursor;

use crate::ServerState;

#[derive(Debug, Deserialize)]
pub struct SseParams {
    pub channel: String,
    /// Cursor halves for resumable delivery.  Both or neither.
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: Option<i64>,
    pub sequence: Option<u64>,
}

/// `GET /rpc/subscribe?channel=…&timestampMs=…&sequence=…` — one event per
/// SSE message.  Supplying the cursor pair replays everything after it
/// before switching to live delivery.
pub async fn sse_handler(
    State(state): State<ServerState>,
    Query(params): Query<SseParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(channel = %params.channel, "sse subscribe");
    let cursor = match (params.timestamp_ms, params.sequence) {
        (Some(timestamp_ms), Some(sequence)) => Some(Cursor {
            timestamp_ms,
            sequence,
        }),
        _ => None,
    };
    let broker = state.router.context().broker.clone();
    let channel = params.channel;

    let stream = async_stream::stream! {
        let events = match broker.subscribe(&channel, cursor).await {
            Ok(s) => s,
            Err(e) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(format!("{{\"message\":\"{e}\"}}")));
                return;
            }
        };
        let mut events = events;
        while let Some(record) = events.next().await {
            let frame = SseFrame {
                id: record.id,
                channel: record.channel,
                event_type: record.event_type,
                timestamp_ms: record.timestamp_ms,
                sequence: record.sequence,
                payload: record.payload,
            };
            match serde_json::to_string(&frame) {
                Ok(body) => yield Ok(Event::default().event("message").data(body)),
                Err(_) => continue,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
