// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use braid_types::{
    Cursor, EventRecord, FileContent, MessageRecord, Part, Session, Step, StepUsage, Todo,
};

use crate::StoreResult;

/// One page of session metadata, newest first.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    /// Pass back as `cursor` to fetch the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// Session persistence.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create(&self, session: &Session) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<Option<Session>>;
    /// Full-row update keyed by `session.id`.  Errors with `NotFound` when
    /// the session was deleted concurrently.
    async fn update(&self, session: &Session) -> StoreResult<()>;
    /// Delete the session.  The message/todo/file sub-trees cascade.
    /// Returns `false` when the id was unknown.
    async fn delete(&self, id: &str) -> StoreResult<bool>;
    /// Newest first by `updated_at`; `cursor` is the id of the last session
    /// of the previous page.
    async fn list_recent(&self, limit: usize, cursor: Option<&str>) -> StoreResult<SessionPage>;
    async fn count(&self) -> StoreResult<u64>;
    async fn last(&self) -> StoreResult<Option<Session>>;
    /// Case-insensitive title substring match, newest first.
    async fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<Session>>;
}

/// Message / step / part persistence.  The orchestrator that owns an
/// assistant message is the only writer of that message's sub-tree.
#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Next free ordering slot within the session (monotonic).
    async fn next_ordering(&self, session_id: &str) -> StoreResult<u64>;
    async fn create_message(&self, message: &MessageRecord) -> StoreResult<()>;
    async fn update_message(&self, message: &MessageRecord) -> StoreResult<()>;
    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>>;
    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<MessageRecord>>;

    async fn create_step(&self, step: &Step) -> StoreResult<()>;
    async fn update_step(&self, step: &Step) -> StoreResult<()>;
    async fn list_steps(&self, message_id: &str) -> StoreResult<Vec<Step>>;

    /// Insert-or-replace keyed by `part.id`.  Called once per debounce
    /// window during streaming, so it must be a single-row operation.
    async fn upsert_part(&self, part: &Part) -> StoreResult<()>;
    async fn list_parts(&self, step_id: &str) -> StoreResult<Vec<Part>>;

    async fn set_step_usage(&self, step_id: &str, usage: StepUsage) -> StoreResult<()>;
    async fn get_step_usage(&self, step_id: &str) -> StoreResult<Option<StepUsage>>;
}

/// Todo persistence.  The only mutation is an atomic whole-list replace.
#[async_trait]
pub trait TodoRepo: Send + Sync {
    async fn replace_all(&self, session_id: &str, todos: &[Todo]) -> StoreResult<()>;
    async fn list(&self, session_id: &str) -> StoreResult<Vec<Todo>>;
}

/// Durable event log backing the broker.
#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn append(&self, event: &EventRecord) -> StoreResult<()>;
    /// Events on `channel` strictly after `after`, oldest first.  `None`
    /// replays from the beginning.
    async fn list_after(
        &self,
        channel: &str,
        after: Option<Cursor>,
        limit: usize,
    ) -> StoreResult<Vec<EventRecord>>;
    /// The most recent `n` events on `channel`, oldest first.
    async fn last_n(&self, channel: &str, n: usize) -> StoreResult<Vec<EventRecord>>;
    async fn count(&self, channel: &str) -> StoreResult<u64>;
    /// `(first, last)` persisted event ids on the channel.
    async fn first_last_ids(&self, channel: &str) -> StoreResult<Option<(String, String)>>;
    /// Highest cursor ever persisted on the channel.  Used by the broker to
    /// seed its sequence counters after a restart.
    async fn last_cursor(&self, channel: &str) -> StoreResult<Option<Cursor>>;
    /// Delete all but the most recent `keep_last` events.  Returns the
    /// number of deleted rows.
    async fn trim(&self, channel: &str, keep_last: usize) -> StoreResult<u64>;
}

/// File object store: metadata rows plus a blob namespace.
#[async_trait]
pub trait FileRepo: Send + Sync {
    async fn insert(&self, record: &FileContent) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<Option<FileContent>>;
    /// Content-addressed lookup for deduplication.
    async fn find_by_sha256(&self, sha256: &str) -> StoreResult<Option<FileContent>>;
    async fn set_step_ref(&self, id: &str, step_id: &str) -> StoreResult<()>;
    /// Orphans (`step_id IS NULL`) created before `older_than`.
    async fn find_orphans(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<FileContent>>;
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn put_blob(&self, storage_key: &str, bytes: &[u8]) -> StoreResult<()>;
    async fn get_blob(&self, storage_key: &str) -> StoreResult<Option<Vec<u8>>>;
}

/// Bundle of repository handles injected into the RPC context.
///
/// Cloning is cheap (Arc per field).  Both backends implement every trait on
/// one struct, so constructing a bundle is a matter of cloning one Arc five
/// times — see [`MemoryStore::into_store`] / [`SqliteStore::into_store`].
#[derive(Clone)]
pub struct Store {
    pub sessions: Arc<dyn SessionRepo>,
    pub messages: Arc<dyn MessageRepo>,
    pub todos: Arc<dyn TodoRepo>,
    pub events: Arc<dyn EventRepo>,
    pub files: Arc<dyn FileRepo>,
}
