// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::new_id;

/// Position in a channel: `(timestamp_ms, sequence)`, strictly increasing
/// per channel in publication order.
///
/// The derived `Ord` is lexicographic over the field order, which is exactly
/// the cursor comparison the broker relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub timestamp_ms: i64,
    pub sequence: u64,
}

/// The broker's unit of record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub channel: String,
    /// Event type tag, e.g. `"part-updated"` or `"session-created"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Millisecond epoch; one half of the cursor.
    pub timestamp_ms: i64,
    /// Per-channel monotonic counter; the other half of the cursor.
    pub sequence: u64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        timestamp_ms: i64,
        sequence: u64,
        payload: Value,
    ) -> Self {
        Self {
            id: new_id(),
            channel: channel.into(),
            event_type: event_type.into(),
            timestamp_ms,
            sequence,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            timestamp_ms: self.timestamp_ms,
            sequence: self.sequence,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_orders_by_timestamp_first() {
        let a = Cursor { timestamp_ms: 1, sequence: 100 };
        let b = Cursor { timestamp_ms: 2, sequence: 0 };
        assert!(a < b);
    }

    #[test]
    fn cursor_breaks_ties_by_sequence() {
        let a = Cursor { timestamp_ms: 5, sequence: 1 };
        let b = Cursor { timestamp_ms: 5, sequence: 2 };
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn event_exposes_its_cursor() {
        let e = EventRecord::new("sessions", "session-created", 42, 7, json!({}));
        assert_eq!(e.cursor(), Cursor { timestamp_ms: 42, sequence: 7 });
    }

    #[test]
    fn event_type_serialises_as_type_field() {
        let e = EventRecord::new("sessions", "session-created", 1, 0, json!({"a": 1}));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "session-created");
        assert_eq!(v["payload"]["a"], 1);
    }

    #[test]
    fn cursor_halves_serialise_with_the_names_subscribe_accepts() {
        let e = EventRecord::new("sessions", "t", 42, 7, json!({}));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["timestampMs"], 42);
        assert_eq!(v["sequence"], 7);
        let c = serde_json::to_value(e.cursor()).unwrap();
        assert_eq!(c["timestampMs"], 42);
        assert_eq!(c["sequence"], 7);
    }
}
