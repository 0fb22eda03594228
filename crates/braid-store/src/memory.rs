// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory storage backend.
//!
//! Keeps everything in plain maps behind one `RwLock`.  Used by the test
//! suite and by ephemeral (`--no-persist`) server runs.  The lock is never
//! held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use braid_types::{
    Cursor, EventRecord, FileContent, MessageRecord, Part, Session, Step, StepUsage, Todo,
};

use crate::repo::{EventRepo, FileRepo, MessageRepo, SessionPage, SessionRepo, Store, TodoRepo};
use crate::{StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, MessageRecord>,
    steps: HashMap<String, Step>,
    parts: HashMap<String, Part>,
    usages: HashMap<String, StepUsage>,
    todos: HashMap<String, Vec<Todo>>,
    events: HashMap<String, Vec<EventRecord>>,
    files: HashMap<String, FileContent>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a repository bundle backed by this store.
    pub fn into_store(self: Arc<Self>) -> Store {
        Store {
            sessions: self.clone(),
            messages: self.clone(),
            todos: self.clone(),
            events: self.clone(),
            files: self,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn recent_order(sessions: &HashMap<String, Session>) -> Vec<Session> {
    let mut all: Vec<Session> = sessions.values().cloned().collect();
    // Newest first; id as a deterministic tie-breaker.
    all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
    all
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        self.write()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self.read().sessions.get(id).cloned())
    }

    async fn update(&self, session: &Session) -> StoreResult<()> {
        let mut inner = self.write();
        if !inner.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.write();
        if inner.sessions.remove(id).is_none() {
            return Ok(false);
        }
        // Cascade: messages → steps → parts/usage, plus todos and file refs.
        let message_ids: Vec<String> = inner
            .messages
            .values()
            .filter(|m| m.session_id == id)
            .map(|m| m.id.clone())
            .collect();
        let step_ids: Vec<String> = inner
            .steps
            .values()
            .filter(|s| message_ids.contains(&s.message_id))
            .map(|s| s.id.clone())
            .collect();
        inner.messages.retain(|_, m| m.session_id != id);
        inner.steps.retain(|_, s| !message_ids.contains(&s.message_id));
        inner.parts.retain(|_, p| !step_ids.contains(&p.step_id));
        inner.usages.retain(|sid, _| !step_ids.contains(sid));
        inner.todos.remove(id);
        for f in inner.files.values_mut() {
            if let Some(step) = &f.step_id {
                if step_ids.contains(step) {
                    f.step_id = None;
                }
            }
        }
        Ok(true)
    }

    async fn list_recent(&self, limit: usize, cursor: Option<&str>) -> StoreResult<SessionPage> {
        let all = recent_order(&self.read().sessions);
        let start = match cursor {
            Some(c) => match all.iter().position(|s| s.id == c) {
                Some(i) => i + 1,
                None => return Err(StoreError::NotFound(format!("cursor {c}"))),
            },
            None => 0,
        };
        let page: Vec<Session> = all.iter().skip(start).take(limit).cloned().collect();
        let next_cursor = if start + page.len() < all.len() {
            page.last().map(|s| s.id.clone())
        } else {
            None
        };
        Ok(SessionPage {
            sessions: page,
            next_cursor,
        })
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.read().sessions.len() as u64)
    }

    async fn last(&self) -> StoreResult<Option<Session>> {
        Ok(recent_order(&self.read().sessions).into_iter().next())
    }

    async fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<Session>> {
        let needle = query.to_lowercase();
        Ok(recent_order(&self.read().sessions)
            .into_iter()
            .filter(|s| {
                s.title
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(&needle))
            })
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl MessageRepo for MemoryStore {
    async fn next_ordering(&self, session_id: &str) -> StoreResult<u64> {
        Ok(self
            .read()
            .messages
            .values()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.ordering + 1)
            .max()
            .unwrap_or(0))
    }

    async fn create_message(&self, message: &MessageRecord) -> StoreResult<()> {
        self.write()
            .messages
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn update_message(&self, message: &MessageRecord) -> StoreResult<()> {
        let mut inner = self.write();
        if !inner.messages.contains_key(&message.id) {
            return Err(StoreError::NotFound(format!("message {}", message.id)));
        }
        inner.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        Ok(self.read().messages.get(id).cloned())
    }

    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let mut msgs: Vec<MessageRecord> = self
            .read()
            .messages
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.ordering);
        Ok(msgs)
    }

    async fn create_step(&self, step: &Step) -> StoreResult<()> {
        self.write().steps.insert(step.id.clone(), step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &Step) -> StoreResult<()> {
        let mut inner = self.write();
        if !inner.steps.contains_key(&step.id) {
            return Err(StoreError::NotFound(format!("step {}", step.id)));
        }
        inner.steps.insert(step.id.clone(), step.clone());
        Ok(())
    }

    async fn list_steps(&self, message_id: &str) -> StoreResult<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .read()
            .steps
            .values()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn upsert_part(&self, part: &Part) -> StoreResult<()> {
        self.write().parts.insert(part.id.clone(), part.clone());
        Ok(())
    }

    async fn list_parts(&self, step_id: &str) -> StoreResult<Vec<Part>> {
        let mut parts: Vec<Part> = self
            .read()
            .parts
            .values()
            .filter(|p| p.step_id == step_id)
            .cloned()
            .collect();
        parts.sort_by_key(|p| p.ordering);
        Ok(parts)
    }

    async fn set_step_usage(&self, step_id: &str, usage: StepUsage) -> StoreResult<()> {
        self.write().usages.insert(step_id.to_string(), usage);
        Ok(())
    }

    async fn get_step_usage(&self, step_id: &str) -> StoreResult<Option<StepUsage>> {
        Ok(self.read().usages.get(step_id).copied())
    }
}

#[async_trait]
impl TodoRepo for MemoryStore {
    async fn replace_all(&self, session_id: &str, todos: &[Todo]) -> StoreResult<()> {
        self.write()
            .todos
            .insert(session_id.to_string(), todos.to_vec());
        Ok(())
    }

    async fn list(&self, session_id: &str) -> StoreResult<Vec<Todo>> {
        let mut todos = self
            .read()
            .todos
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        todos.sort_by_key(|t| t.ordering);
        Ok(todos)
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn append(&self, event: &EventRecord) -> StoreResult<()> {
        self.write()
            .events
            .entry(event.channel.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_after(
        &self,
        channel: &str,
        after: Option<Cursor>,
        limit: usize,
    ) -> StoreResult<Vec<EventRecord>> {
        let inner = self.read();
        let Some(log) = inner.events.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|e| after.map_or(true, |c| e.cursor() > c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_n(&self, channel: &str, n: usize) -> StoreResult<Vec<EventRecord>> {
        let inner = self.read();
        let Some(log) = inner.events.get(channel) else {
            return Ok(Vec::new());
        };
        let start = log.len().saturating_sub(n);
        Ok(log[start..].to_vec())
    }

    async fn count(&self, channel: &str) -> StoreResult<u64> {
        Ok(self
            .read()
            .events
            .get(channel)
            .map(|l| l.len() as u64)
            .unwrap_or(0))
    }

    async fn first_last_ids(&self, channel: &str) -> StoreResult<Option<(String, String)>> {
        let inner = self.read();
        let Some(log) = inner.events.get(channel) else {
            return Ok(None);
        };
        match (log.first(), log.last()) {
            (Some(f), Some(l)) => Ok(Some((f.id.clone(), l.id.clone()))),
            _ => Ok(None),
        }
    }

    async fn last_cursor(&self, channel: &str) -> StoreResult<Option<Cursor>> {
        Ok(self
            .read()
            .events
            .get(channel)
            .and_then(|l| l.last())
            .map(|e| e.cursor()))
    }

    async fn trim(&self, channel: &str, keep_last: usize) -> StoreResult<u64> {
        let mut inner = self.write();
        let Some(log) = inner.events.get_mut(channel) else {
            return Ok(0);
        };
        let drop = log.len().saturating_sub(keep_last);
        log.drain(..drop);
        Ok(drop as u64)
    }
}

#[async_trait]
impl FileRepo for MemoryStore {
    async fn insert(&self, record: &FileContent) -> StoreResult<()> {
        self.write().files.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<FileContent>> {
        Ok(self.read().files.get(id).cloned())
    }

    async fn find_by_sha256(&self, sha256: &str) -> StoreResult<Option<FileContent>> {
        Ok(self
            .read()
            .files
            .values()
            .find(|f| f.sha256 == sha256)
            .cloned())
    }

    async fn set_step_ref(&self, id: &str, step_id: &str) -> StoreResult<()> {
        let mut inner = self.write();
        match inner.files.get_mut(id) {
            Some(f) => {
                f.step_id = Some(step_id.to_string());
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("file {id}"))),
        }
    }

    async fn find_orphans(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<FileContent>> {
        Ok(self
            .read()
            .files
            .values()
            .filter(|f| f.is_orphan() && f.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.write();
        let removed = inner.files.remove(id);
        if let Some(f) = &removed {
            inner.blobs.remove(&f.storage_key);
        }
        Ok(removed.is_some())
    }

    async fn put_blob(&self, storage_key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.write()
            .blobs
            .insert(storage_key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_blob(&self, storage_key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.read().blobs.get(storage_key).cloned())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use braid_types::{MessageRole, PartPayload};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn session_round_trip() {
        let store = MemoryStore::new();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();
        let back = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(back.provider_id, "mock");
    }

    #[tokio::test]
    async fn update_unknown_session_is_not_found() {
        let store = MemoryStore::new();
        let s = Session::new("mock", "mock-model", "coder");
        assert!(matches!(
            store.update(&s).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_cascades_to_message_tree_and_todos() {
        let store = MemoryStore::new();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();

        let msg = MessageRecord::new(&s.id, MessageRole::Assistant, 0);
        store.create_message(&msg).await.unwrap();
        let step = Step::new(&msg.id, 0, "mock", "mock-model");
        store.create_step(&step).await.unwrap();
        let part = Part::text(&step.id, 0);
        store.upsert_part(&part).await.unwrap();
        store
            .replace_all(&s.id, &[Todo::new(1, &s.id, "x", "Doing x", 0)])
            .await
            .unwrap();

        assert!(store.delete(&s.id).await.unwrap());
        assert!(store.get_message(&msg.id).await.unwrap().is_none());
        assert!(store.list_steps(&msg.id).await.unwrap().is_empty());
        assert!(store.list_parts(&step.id).await.unwrap().is_empty());
        assert!(TodoRepo::list(&*store, &s.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn next_ordering_is_monotonic() {
        let store = MemoryStore::new();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();
        assert_eq!(store.next_ordering(&s.id).await.unwrap(), 0);
        let m = MessageRecord::new(&s.id, MessageRole::User, 0);
        store.create_message(&m).await.unwrap();
        assert_eq!(store.next_ordering(&s.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_recent_paginates_with_cursor() {
        let store = MemoryStore::new();
        for _ in 0..5 {
            let s = Session::new("mock", "mock-model", "coder");
            store.create(&s).await.unwrap();
        }
        let page1 = store.list_recent(2, None).await.unwrap();
        assert_eq!(page1.sessions.len(), 2);
        let cursor = page1.next_cursor.unwrap();
        let page2 = store.list_recent(2, Some(&cursor)).await.unwrap();
        assert_eq!(page2.sessions.len(), 2);
        // No overlap between pages.
        for s in &page2.sessions {
            assert!(!page1.sessions.iter().any(|p| p.id == s.id));
        }
        let cursor2 = page2.next_cursor.unwrap();
        let page3 = store.list_recent(2, Some(&cursor2)).await.unwrap();
        assert_eq!(page3.sessions.len(), 1);
        assert!(page3.next_cursor.is_none());
    }

    #[tokio::test]
    async fn search_matches_title_case_insensitively() {
        let store = MemoryStore::new();
        let mut s = Session::new("mock", "mock-model", "coder");
        s.title = Some("Fix the Parser".into());
        store.create(&s).await.unwrap();
        let hits = store.search("parser", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.search("compiler", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_replay_after_cursor() {
        let store = MemoryStore::new();
        for i in 0..10 {
            let e = EventRecord::new("sessions", "t", 100, i, json!({"i": i}));
            EventRepo::append(&*store, &e).await.unwrap();
        }
        let after = Cursor {
            timestamp_ms: 100,
            sequence: 4,
        };
        let tail = store
            .list_after("sessions", Some(after), usize::MAX)
            .await
            .unwrap();
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0].sequence, 5);
    }

    #[tokio::test]
    async fn event_trim_keeps_most_recent() {
        let store = MemoryStore::new();
        for i in 0..10 {
            let e = EventRecord::new("c", "t", 100, i, json!({}));
            EventRepo::append(&*store, &e).await.unwrap();
        }
        let dropped = store.trim("c", 3).await.unwrap();
        assert_eq!(dropped, 7);
        let rest = store.last_n("c", 100).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].sequence, 7);
    }

    #[tokio::test]
    async fn file_dedup_by_sha() {
        let store = MemoryStore::new();
        let f = FileContent::new("a.txt", "text/plain", 3, "blobs/a", "sha-a");
        FileRepo::insert(&*store, &f).await.unwrap();
        assert!(store.find_by_sha256("sha-a").await.unwrap().is_some());
        assert!(store.find_by_sha256("sha-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blob_round_trip_and_delete() {
        let store = MemoryStore::new();
        let f = FileContent::new("a.txt", "text/plain", 3, "blobs/a", "sha-a");
        FileRepo::insert(&*store, &f).await.unwrap();
        store.put_blob("blobs/a", b"abc").await.unwrap();
        assert_eq!(store.get_blob("blobs/a").await.unwrap().unwrap(), b"abc");
        assert!(FileRepo::delete(&*store, &f.id).await.unwrap());
        assert!(store.get_blob("blobs/a").await.unwrap().is_none());
    }
}
