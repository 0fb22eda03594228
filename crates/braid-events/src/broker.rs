// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use braid_store::{EventRepo, StoreError};
use braid_types::{Cursor, EventRecord};

/// Bounded per-subscriber buffer.  A subscriber whose buffer overflows is
/// dropped — it must resubscribe with its last seen cursor.
pub const SUBSCRIBER_BUFFER: usize = 50;

/// How many events a single replay query pulls from storage at once.
const REPLAY_BATCH: usize = 256;

pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Channel statistics returned by [`Broker::info`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel: String,
    pub subscriber_count: usize,
    pub persisted_count: u64,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<EventRecord>,
}

#[derive(Default)]
struct ChannelState {
    /// Per-channel monotonic counter; never reset, gaps allowed.
    next_sequence: u64,
    /// Highest cursor ever published; `None` until seeded from storage.
    last_cursor: Option<Cursor>,
    seeded: bool,
    subscribers: Vec<Subscriber>,
}

/// The event stream broker.
///
/// Publication is serialized per channel: the channel lock is held across
/// cursor allocation, persistence, and fan-out so that live delivery order
/// equals publication order equals cursor order.  Fan-out itself never
/// blocks — `try_send` into each subscriber's bounded buffer.
pub struct Broker {
    repo: Arc<dyn EventRepo>,
    channels: Mutex<HashMap<String, Arc<Mutex<ChannelState>>>>,
    next_subscriber_id: std::sync::atomic::AtomicU64,
}

impl Broker {
    pub fn new(repo: Arc<dyn EventRepo>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            channels: Mutex::new(HashMap::new()),
            next_subscriber_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    async fn channel(&self, name: &str) -> Arc<Mutex<ChannelState>> {
        let mut map = self.channels.lock().await;
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelState::default())))
            .clone()
    }

    /// Seed sequence counters from the durable log the first time a channel
    /// is touched after startup, so cursors keep increasing across restarts.
    async fn ensure_seeded(&self, name: &str, state: &mut ChannelState) -> Result<(), BrokerError> {
        if state.seeded {
            return Ok(());
        }
        if let Some(cursor) = self.repo.last_cursor(name).await? {
            state.last_cursor = Some(cursor);
            state.next_sequence = cursor.sequence + 1;
        }
        state.seeded = true;
        Ok(())
    }

    /// Append one event: assign the cursor, persist, then fan out.
    ///
    /// Persistence errors propagate to the caller; fan-out is best-effort
    /// and never blocks on a slow subscriber.
    pub async fn publish(
        &self,
        channel: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<EventRecord, BrokerError> {
        let chan = self.channel(channel).await;
        let mut state = chan.lock().await;
        self.ensure_seeded(channel, &mut state).await?;

        // Timestamp may repeat within a millisecond; the sequence half keeps
        // the cursor strictly increasing.  Clamp against the previous
        // timestamp so a backwards wall-clock step cannot break ordering.
        let now_ms = Utc::now().timestamp_millis();
        let timestamp_ms = match state.last_cursor {
            Some(c) => now_ms.max(c.timestamp_ms),
            None => now_ms,
        };
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let event = EventRecord::new(channel, event_type, timestamp_ms, sequence, payload);
        self.repo.append(&event).await?;
        state.last_cursor = Some(event.cursor());

        // Fan out.  Subscribers whose buffer is full are dropped here;
        // closing the sender ends their stream.
        state.subscribers.retain(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        channel,
                        subscriber = sub.id,
                        "subscriber overflowed its buffer; dropping"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Ok(event)
    }

    async fn attach(&self, channel: &str) -> mpsc::Receiver<EventRecord> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self
            .next_subscriber_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let chan = self.channel(channel).await;
        chan.lock().await.subscribers.push(Subscriber { id, tx });
        debug!(channel, subscriber = id, "subscriber attached");
        rx
    }

    /// Subscribe to a channel.
    ///
    /// With `from` set, every persisted event strictly after the cursor is
    /// replayed first, then the stream switches to live delivery with no gap
    /// and no duplicate.  Without a cursor only live events are delivered.
    pub async fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        from: Option<Cursor>,
    ) -> Result<EventStream, BrokerError> {
        // Attach the live buffer before reading storage so nothing published
        // between the replay read and the live switch is lost.  Duplicates
        // across the boundary are filtered by cursor below.
        let mut live = self.attach(channel).await;

        let repo = self.repo.clone();
        let channel = channel.to_string();
        let stream = async_stream::stream! {
            let mut watermark = from;
            if from.is_some() {
                loop {
                    let batch = match repo.list_after(&channel, watermark, REPLAY_BATCH).await {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(%channel, "replay read failed: {e}");
                            return;
                        }
                    };
                    if batch.is_empty() {
                        break;
                    }
                    for event in batch {
                        watermark = Some(event.cursor());
                        yield event;
                    }
                }
            }
            while let Some(event) = live.recv().await {
                // Skip live events already covered by the replay.
                if let Some(mark) = watermark {
                    if event.cursor() <= mark {
                        continue;
                    }
                }
                watermark = Some(event.cursor());
                yield event;
            }
        };
        Ok(Box::pin(stream))
    }

    /// Fetch the most recent `n` persisted events, yield them in order, then
    /// continue live.
    pub async fn subscribe_with_history(
        self: &Arc<Self>,
        channel: &str,
        n: usize,
    ) -> Result<EventStream, BrokerError> {
        let history = self.repo.last_n(channel, n).await?;
        match history.first() {
            // Replaying "after the cursor just before the history window"
            // reuses the gap-free replay path.
            Some(first) => {
                let before = Cursor {
                    timestamp_ms: first.timestamp_ms,
                    sequence: first.sequence.wrapping_sub(1),
                };
                // sequence 0 has nothing before it — replay from the start.
                let from = if first.sequence == 0 { None } else { Some(before) };
                match from {
                    Some(c) => self.subscribe(channel, Some(c)).await,
                    None => {
                        let mut live = self.attach(channel).await;
                        let repo = self.repo.clone();
                        let channel = channel.to_string();
                        let stream = async_stream::stream! {
                            let mut watermark = None;
                            match repo.list_after(&channel, None, usize::MAX).await {
                                Ok(all) => {
                                    for event in all {
                                        watermark = Some(event.cursor());
                                        yield event;
                                    }
                                }
                                Err(e) => {
                                    warn!(%channel, "history read failed: {e}");
                                    return;
                                }
                            }
                            while let Some(event) = live.recv().await {
                                if let Some(mark) = watermark {
                                    if event.cursor() <= mark {
                                        continue;
                                    }
                                }
                                watermark = Some(event.cursor());
                                yield event;
                            }
                        };
                        Ok(Box::pin(stream))
                    }
                }
            }
            None => self.subscribe(channel, None).await,
        }
    }

    /// Subscriber count, persisted count, and first/last persisted ids.
    pub async fn info(&self, channel: &str) -> Result<ChannelInfo, BrokerError> {
        let chan = self.channel(channel).await;
        let subscriber_count = {
            let mut state = chan.lock().await;
            // Prune closed subscribers so the count reflects live receivers.
            state.subscribers.retain(|s| !s.tx.is_closed());
            state.subscribers.len()
        };
        let persisted_count = self.repo.count(channel).await?;
        let ids = self.repo.first_last_ids(channel).await?;
        let (first_id, last_id) = match ids {
            Some((f, l)) => (Some(f), Some(l)),
            None => (None, None),
        };
        Ok(ChannelInfo {
            channel: channel.to_string(),
            subscriber_count,
            persisted_count,
            first_id,
            last_id,
        })
    }

    /// Delete all but the most recent `keep_last` persisted events.  Live
    /// buffers are untouched.  Returns the number of deleted events.
    pub async fn cleanup_channel(
        &self,
        channel: &str,
        keep_last: usize,
    ) -> Result<u64, BrokerError> {
        Ok(self.repo.trim(channel, keep_last).await?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use braid_store::MemoryStore;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    fn broker() -> Arc<Broker> {
        let store = MemoryStore::new();
        Broker::new(store)
    }

    #[tokio::test]
    async fn publish_assigns_strictly_increasing_cursors() {
        let b = broker();
        let mut prev: Option<Cursor> = None;
        for i in 0..100 {
            let e = b.publish("sessions", "tick", json!({"i": i})).await.unwrap();
            if let Some(p) = prev {
                assert!(e.cursor() > p, "cursor must strictly increase");
            }
            prev = Some(e.cursor());
        }
    }

    #[tokio::test]
    async fn live_subscriber_receives_in_publication_order() {
        let b = broker();
        let mut sub = b.subscribe("c", None).await.unwrap();
        for i in 0..5 {
            b.publish("c", "tick", json!({"i": i})).await.unwrap();
        }
        for i in 0..5 {
            let e = sub.next().await.unwrap();
            assert_eq!(e.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn subscriber_without_cursor_sees_only_live_events() {
        let b = broker();
        b.publish("c", "old", json!({})).await.unwrap();
        let mut sub = b.subscribe("c", None).await.unwrap();
        b.publish("c", "new", json!({})).await.unwrap();
        let e = sub.next().await.unwrap();
        assert_eq!(e.event_type, "new");
    }

    #[tokio::test]
    async fn cursor_replay_is_complete_and_gap_free() {
        let b = broker();
        let mut cursors = Vec::new();
        for i in 0..200 {
            let e = b.publish("sessions", "tick", json!({"i": i})).await.unwrap();
            cursors.push(e.cursor());
        }
        // Subscribe from event #100 (0-based index 99): expect 100..199.
        let mut sub = b.subscribe("sessions", Some(cursors[99])).await.unwrap();
        for i in 100..200 {
            let e = sub.next().await.unwrap();
            assert_eq!(e.payload["i"], i);
        }
        // And then continue with new publishes.
        b.publish("sessions", "tick", json!({"i": 200})).await.unwrap();
        let e = sub.next().await.unwrap();
        assert_eq!(e.payload["i"], 200);
    }

    #[tokio::test]
    async fn replay_boundary_has_no_duplicates() {
        let b = broker();
        let first = b.publish("c", "a", json!({"n": 0})).await.unwrap();
        b.publish("c", "b", json!({"n": 1})).await.unwrap();

        let mut sub = b.subscribe("c", Some(first.cursor())).await.unwrap();
        b.publish("c", "d", json!({"n": 2})).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(sub.next().await.unwrap().payload["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn subscribe_with_history_yields_last_n_then_live() {
        let b = broker();
        for i in 0..10 {
            b.publish("c", "tick", json!({"i": i})).await.unwrap();
        }
        let mut sub = b.subscribe_with_history("c", 3).await.unwrap();
        for i in 7..10 {
            assert_eq!(sub.next().await.unwrap().payload["i"], i);
        }
        b.publish("c", "tick", json!({"i": 10})).await.unwrap();
        assert_eq!(sub.next().await.unwrap().payload["i"], 10);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_on_overflow() {
        let b = broker();
        let mut sub = b.subscribe("c", None).await.unwrap();
        // Fill the buffer past its bound without draining.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            b.publish("c", "tick", json!({"i": i})).await.unwrap();
        }
        // The buffered events are still delivered, then the stream ends
        // because the broker closed the sender on overflow.
        let mut received = 0;
        while sub.next().await.is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let b = broker();
        let mut sub = b.subscribe("a", None).await.unwrap();
        b.publish("b", "noise", json!({})).await.unwrap();
        b.publish("a", "signal", json!({})).await.unwrap();
        assert_eq!(sub.next().await.unwrap().event_type, "signal");
    }

    #[tokio::test]
    async fn info_reports_counts_and_edges() {
        let b = broker();
        let first = b.publish("c", "t", json!({})).await.unwrap();
        let last = b.publish("c", "t", json!({})).await.unwrap();
        let _sub = b.subscribe("c", None).await.unwrap();
        let info = b.info("c").await.unwrap();
        assert_eq!(info.subscriber_count, 1);
        assert_eq!(info.persisted_count, 2);
        assert_eq!(info.first_id, Some(first.id));
        assert_eq!(info.last_id, Some(last.id));
    }

    #[tokio::test]
    async fn cleanup_trims_persisted_history_only() {
        let b = broker();
        for _ in 0..10 {
            b.publish("c", "t", json!({})).await.unwrap();
        }
        let deleted = b.cleanup_channel("c", 4).await.unwrap();
        assert_eq!(deleted, 6);
        assert_eq!(b.info("c").await.unwrap().persisted_count, 4);
    }

    #[tokio::test]
    async fn sequences_continue_after_restart() {
        let store = MemoryStore::new();
        let b1 = Broker::new(store.clone());
        let last_before = b1.publish("c", "t", json!({})).await.unwrap().cursor();

        // A new broker over the same repository must not reuse cursors.
        let b2 = Broker::new(store);
        let first_after = b2.publish("c", "t", json!({})).await.unwrap().cursor();
        assert!(first_after > last_before);
    }
}
