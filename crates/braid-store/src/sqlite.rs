// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite storage backend.
//!
//! One file, strict foreign-key cascade from sessions down to parts and
//! usage rows.  Complex fields (rule lists, flags, part payloads) are stored
//! as JSON text columns.  All calls go through `spawn_blocking` so rusqlite
//! never blocks the async executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use braid_types::{
    Cursor, EventRecord, FileContent, FinishReason, MessageRecord, MessageRole, Part,
    PartPayload, QueuedMessage, RunStatus, Session, Step, StepUsage, Todo, TodoStatus,
};

use crate::repo::{EventRepo, FileRepo, MessageRepo, SessionPage, SessionRepo, Store, TodoRepo};
use crate::{StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                  TEXT PRIMARY KEY,
    title               TEXT,
    provider_id         TEXT NOT NULL,
    model_id            TEXT NOT NULL,
    agent_id            TEXT NOT NULL,
    enabled_rule_ids    TEXT NOT NULL,
    enabled_tool_ids    TEXT,
    next_todo_id        INTEGER NOT NULL,
    flags               TEXT NOT NULL,
    base_context_tokens INTEGER,
    total_tokens        INTEGER NOT NULL,
    message_queue       TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role          TEXT NOT NULL,
    ordering      INTEGER NOT NULL,
    status        TEXT NOT NULL,
    finish_reason TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, ordering);
CREATE TABLE IF NOT EXISTS message_steps (
    id              TEXT PRIMARY KEY,
    message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    step_index      INTEGER NOT NULL,
    provider_id     TEXT NOT NULL,
    model_id        TEXT NOT NULL,
    system_snapshot TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    duration_ms     INTEGER,
    status          TEXT NOT NULL,
    finish_reason   TEXT
);
CREATE INDEX IF NOT EXISTS idx_steps_message ON message_steps(message_id, step_index);
CREATE TABLE IF NOT EXISTS step_usage (
    step_id           TEXT PRIMARY KEY REFERENCES message_steps(id) ON DELETE CASCADE,
    prompt_tokens     INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens      INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS step_parts (
    id       TEXT PRIMARY KEY,
    step_id  TEXT NOT NULL REFERENCES message_steps(id) ON DELETE CASCADE,
    ordering INTEGER NOT NULL,
    status   TEXT NOT NULL,
    payload  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_parts_step ON step_parts(step_id, ordering);
CREATE TABLE IF NOT EXISTS todos (
    session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    id           INTEGER NOT NULL,
    content      TEXT NOT NULL,
    active_form  TEXT NOT NULL,
    status       TEXT NOT NULL,
    ordering     INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    completed_at TEXT,
    metadata     TEXT,
    PRIMARY KEY (session_id, id)
);
CREATE TABLE IF NOT EXISTS events (
    id           TEXT PRIMARY KEY,
    channel      TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    sequence     INTEGER NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_channel ON events(channel, timestamp_ms, sequence);
CREATE TABLE IF NOT EXISTS file_contents (
    id            TEXT PRIMARY KEY,
    relative_path TEXT NOT NULL,
    media_type    TEXT NOT NULL,
    size          INTEGER NOT NULL,
    storage_key   TEXT NOT NULL,
    text_content  TEXT,
    sha256        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    step_id       TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_sha ON file_contents(sha256);
CREATE TABLE IF NOT EXISTS file_blobs (
    storage_key TEXT PRIMARY KEY,
    bytes       BLOB NOT NULL
);
"#;

/// SQLite-backed store.  Opens a fresh connection per operation (the loom
/// store pattern) so no connection state is shared between tasks.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Arc<Self>> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path).map_err(StoreError::storage)?;
        conn.execute_batch(SCHEMA).map_err(StoreError::storage)?;
        Ok(Arc::new(Self { db_path }))
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

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(StoreError::storage)?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(StoreError::storage)?;
            f(&conn)
        })
        .await
        .map_err(StoreError::storage)?
    }
}

// ─── Column codecs ───────────────────────────────────────────────────────────

fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(StoreError::corrupt)
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => serde_json::from_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
    }
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn status_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Active => "active",
        RunStatus::Completed => "completed",
        RunStatus::Error => "error",
        RunStatus::Abort => "abort",
    }
}

fn parse_status(s: &str, idx: usize) -> rusqlite::Result<RunStatus> {
    match s {
        "active" => Ok(RunStatus::Active),
        "completed" => Ok(RunStatus::Completed),
        "error" => Ok(RunStatus::Error),
        "abort" => Ok(RunStatus::Abort),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown status {other:?}").into(),
        )),
    }
}

fn role_str(r: MessageRole) -> &'static str {
    match r {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn todo_status_str(s: TodoStatus) -> &'static str {
    match s {
        TodoStatus::Pending => "pending",
        TodoStatus::InProgress => "in_progress",
        TodoStatus::Completed => "completed",
        TodoStatus::Removed => "removed",
    }
}

fn parse_todo_status(s: &str, idx: usize) -> rusqlite::Result<TodoStatus> {
    match s {
        "pending" => Ok(TodoStatus::Pending),
        "in_progress" => Ok(TodoStatus::InProgress),
        "completed" => Ok(TodoStatus::Completed),
        "removed" => Ok(TodoStatus::Removed),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown todo status {other:?}").into(),
        )),
    }
}

// ─── Row mappers ─────────────────────────────────────────────────────────────

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        provider_id: row.get(2)?,
        model_id: row.get(3)?,
        agent_id: row.get(4)?,
        enabled_rule_ids: json_col(row, 5)?,
        enabled_tool_ids: opt_json_col(row, 6)?,
        next_todo_id: row.get::<_, i64>(7)? as u64,
        flags: json_col(row, 8)?,
        base_context_tokens: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        total_tokens: row.get::<_, i64>(10)? as u64,
        message_queue: json_col::<Vec<QueuedMessage>>(row, 11)?,
        created_at: time_col(row, 12)?,
        updated_at: time_col(row, 13)?,
    })
}

const SESSION_COLS: &str = "id, title, provider_id, model_id, agent_id, enabled_rule_ids, \
     enabled_tool_ids, next_todo_id, flags, base_context_tokens, total_tokens, \
     message_queue, created_at, updated_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: match role.as_str() {
            "user" => MessageRole::User,
            _ => MessageRole::Assistant,
        },
        ordering: row.get::<_, i64>(3)? as u64,
        status: parse_status(&status, 4)?,
        finish_reason: opt_json_col::<FinishReason>(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let status: String = row.get(9)?;
    Ok(Step {
        id: row.get(0)?,
        message_id: row.get(1)?,
        step_index: row.get::<_, i64>(2)? as u32,
        provider_id: row.get(3)?,
        model_id: row.get(4)?,
        system_snapshot: json_col(row, 5)?,
        started_at: time_col(row, 6)?,
        ended_at: opt_time_col(row, 7)?,
        duration_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        status: parse_status(&status, 9)?,
        finish_reason: opt_json_col::<FinishReason>(row, 10)?,
    })
}

fn part_from_row(row: &Row<'_>) -> rusqlite::Result<Part> {
    let status: String = row.get(3)?;
    Ok(Part {
        id: row.get(0)?,
        step_id: row.get(1)?,
        ordering: row.get::<_, i64>(2)? as u64,
        status: parse_status(&status, 3)?,
        payload: json_col::<PartPayload>(row, 4)?,
    })
}

fn todo_from_row(row: &Row<'_>) -> rusqlite::Result<Todo> {
    let status: String = row.get(4)?;
    Ok(Todo {
        session_id: row.get(0)?,
        id: row.get::<_, i64>(1)? as u64,
        content: row.get(2)?,
        active_form: row.get(3)?,
        status: parse_todo_status(&status, 4)?,
        ordering: row.get::<_, i64>(5)? as u64,
        created_at: time_col(row, 6)?,
        completed_at: opt_time_col(row, 7)?,
        metadata: opt_json_col(row, 8)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        channel: row.get(1)?,
        event_type: row.get(2)?,
        timestamp_ms: row.get(3)?,
        sequence: row.get::<_, i64>(4)? as u64,
        payload: json_col(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileContent> {
    Ok(FileContent {
        id: row.get(0)?,
        relative_path: row.get(1)?,
        media_type: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        storage_key: row.get(4)?,
        text_content: row.get(5)?,
        sha256: row.get(6)?,
        created_at: time_col(row, 7)?,
        step_id: row.get(8)?,
    })
}

const FILE_COLS: &str = "id, relative_path, media_type, size, storage_key, text_content, \
     sha256, created_at, step_id";

fn insert_session(conn: &Connection, s: &Session, replace: bool) -> StoreResult<usize> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    conn.execute(
        &format!(
            "{verb} INTO sessions ({SESSION_COLS}) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
        ),
        params![
            s.id,
            s.title,
            s.provider_id,
            s.model_id,
            s.agent_id,
            to_json(&s.enabled_rule_ids)?,
            s.enabled_tool_ids.as_ref().map(to_json).transpose()?,
            s.next_todo_id as i64,
            to_json(&s.flags)?,
            s.base_context_tokens.map(|v| v as i64),
            s.total_tokens as i64,
            to_json(&s.message_queue)?,
            s.created_at.to_rfc3339(),
            s.updated_at.to_rfc3339(),
        ],
    )
    .map_err(StoreError::storage)
}

// ─── Trait implementations ───────────────────────────────────────────────────

#[async_trait]
impl SessionRepo for SqliteStore {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        let s = session.clone();
        self.with_conn(move |conn| insert_session(conn, &s, false).map(|_| ()))
            .await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Session>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn update(&self, session: &Session) -> StoreResult<()> {
        let s = session.clone();
        self.with_conn(move |conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![s.id],
                    |_| Ok(true),
                )
                .optional()
                .map_err(StoreError::storage)?
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::NotFound(format!("session {}", s.id)));
            }
            insert_session(conn, &s, true).map(|_| ())
        })
        .await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            // FK cascade removes messages, steps, parts, usage, todos.
            let n = conn
                .execute("DELETE FROM sessions WHERE id = ?1", params![id])
                .map_err(StoreError::storage)?;
            conn.execute(
                "UPDATE file_contents SET step_id = NULL WHERE step_id NOT IN \
                 (SELECT id FROM message_steps)",
                [],
            )
            .map_err(StoreError::storage)?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_recent(&self, limit: usize, cursor: Option<&str>) -> StoreResult<SessionPage> {
        let cursor = cursor.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLS} FROM sessions ORDER BY updated_at DESC, id DESC"
                ))
                .map_err(StoreError::storage)?;
            let all: Vec<Session> = stmt
                .query_map([], session_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage)?;
            let start = match &cursor {
                Some(c) => match all.iter().position(|s| &s.id == c) {
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
        })
        .await
    }

    async fn count(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(StoreError::storage)
        })
        .await
    }

    async fn last(&self) -> StoreResult<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLS} FROM sessions \
                     ORDER BY updated_at DESC, id DESC LIMIT 1"
                ),
                [],
                session_from_row,
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<Session>> {
        let pattern = format!("%{}%", query.to_lowercase());
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLS} FROM sessions \
                     WHERE title IS NOT NULL AND LOWER(title) LIKE ?1 \
                     ORDER BY updated_at DESC LIMIT ?2"
                ))
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(params![pattern, limit as i64], session_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }
}

#[async_trait]
impl MessageRepo for SqliteStore {
    async fn next_ordering(&self, session_id: &str) -> StoreResult<u64> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(ordering) + 1, 0) FROM messages WHERE session_id = ?1",
                params![sid],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn create_message(&self, message: &MessageRecord) -> StoreResult<()> {
        let m = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, ordering, status, finish_reason, created_at) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    m.id,
                    m.session_id,
                    role_str(m.role),
                    m.ordering as i64,
                    status_str(m.status),
                    m.finish_reason.as_ref().map(to_json).transpose()?,
                    m.created_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn update_message(&self, message: &MessageRecord) -> StoreResult<()> {
        let m = message.clone();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE messages SET status = ?2, finish_reason = ?3 WHERE id = ?1",
                    params![
                        m.id,
                        status_str(m.status),
                        m.finish_reason.as_ref().map(to_json).transpose()?,
                    ],
                )
                .map_err(StoreError::storage)?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("message {}", m.id)));
            }
            Ok(())
        })
        .await
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<MessageRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, session_id, role, ordering, status, finish_reason, created_at \
                 FROM messages WHERE id = ?1",
                params![id],
                message_from_row,
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, session_id, role, ordering, status, finish_reason, created_at \
                     FROM messages WHERE session_id = ?1 ORDER BY ordering",
                )
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(params![sid], message_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }

    async fn create_step(&self, step: &Step) -> StoreResult<()> {
        let s = step.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO message_steps \
                 (id, message_id, step_index, provider_id, model_id, system_snapshot, \
                  started_at, ended_at, duration_ms, status, finish_reason) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    s.id,
                    s.message_id,
                    s.step_index as i64,
                    s.provider_id,
                    s.model_id,
                    to_json(&s.system_snapshot)?,
                    s.started_at.to_rfc3339(),
                    s.ended_at.map(|t| t.to_rfc3339()),
                    s.duration_ms.map(|v| v as i64),
                    status_str(s.status),
                    s.finish_reason.as_ref().map(to_json).transpose()?,
                ],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn update_step(&self, step: &Step) -> StoreResult<()> {
        let s = step.clone();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE message_steps SET ended_at = ?2, duration_ms = ?3, status = ?4, \
                     finish_reason = ?5, system_snapshot = ?6 WHERE id = ?1",
                    params![
                        s.id,
                        s.ended_at.map(|t| t.to_rfc3339()),
                        s.duration_ms.map(|v| v as i64),
                        status_str(s.status),
                        s.finish_reason.as_ref().map(to_json).transpose()?,
                        to_json(&s.system_snapshot)?,
                    ],
                )
                .map_err(StoreError::storage)?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("step {}", s.id)));
            }
            Ok(())
        })
        .await
    }

    async fn list_steps(&self, message_id: &str) -> StoreResult<Vec<Step>> {
        let mid = message_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, message_id, step_index, provider_id, model_id, system_snapshot, \
                     started_at, ended_at, duration_ms, status, finish_reason \
                     FROM message_steps WHERE message_id = ?1 ORDER BY step_index",
                )
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(params![mid], step_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }

    async fn upsert_part(&self, part: &Part) -> StoreResult<()> {
        let p = part.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO step_parts (id, step_id, ordering, status, payload) \
                 VALUES (?1,?2,?3,?4,?5)",
                params![
                    p.id,
                    p.step_id,
                    p.ordering as i64,
                    status_str(p.status),
                    to_json(&p.payload)?,
                ],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn list_parts(&self, step_id: &str) -> StoreResult<Vec<Part>> {
        let sid = step_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, step_id, ordering, status, payload FROM step_parts \
                     WHERE step_id = ?1 ORDER BY ordering",
                )
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(params![sid], part_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }

    async fn set_step_usage(&self, step_id: &str, usage: StepUsage) -> StoreResult<()> {
        let sid = step_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO step_usage \
                 (step_id, prompt_tokens, completion_tokens, total_tokens) \
                 VALUES (?1,?2,?3,?4)",
                params![
                    sid,
                    usage.prompt_tokens as i64,
                    usage.completion_tokens as i64,
                    usage.total_tokens as i64,
                ],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn get_step_usage(&self, step_id: &str) -> StoreResult<Option<StepUsage>> {
        let sid = step_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT prompt_tokens, completion_tokens, total_tokens \
                 FROM step_usage WHERE step_id = ?1",
                params![sid],
                |row| {
                    Ok(StepUsage {
                        prompt_tokens: row.get::<_, i64>(0)? as u64,
                        completion_tokens: row.get::<_, i64>(1)? as u64,
                        total_tokens: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }
}

#[async_trait]
impl TodoRepo for SqliteStore {
    async fn replace_all(&self, session_id: &str, todos: &[Todo]) -> StoreResult<()> {
        let sid = session_id.to_string();
        let todos = todos.to_vec();
        self.with_conn(move |conn| {
            // Whole-list replace must be atomic: a reader either sees the old
            // list or the new one, never a partial mix.
            conn.execute_batch("BEGIN").map_err(StoreError::storage)?;
            let result = (|| -> StoreResult<()> {
                conn.execute("DELETE FROM todos WHERE session_id = ?1", params![sid])
                    .map_err(StoreError::storage)?;
                for t in &todos {
                    conn.execute(
                        "INSERT INTO todos (session_id, id, content, active_form, status, \
                         ordering, created_at, completed_at, metadata) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                        params![
                            sid,
                            t.id as i64,
                            t.content,
                            t.active_form,
                            todo_status_str(t.status),
                            t.ordering as i64,
                            t.created_at.to_rfc3339(),
                            t.completed_at.map(|x| x.to_rfc3339()),
                            t.metadata.as_ref().map(to_json).transpose()?,
                        ],
                    )
                    .map_err(StoreError::storage)?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT").map_err(StoreError::storage),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .await
    }

    async fn list(&self, session_id: &str) -> StoreResult<Vec<Todo>> {
        let sid = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, id, content, active_form, status, ordering, \
                     created_at, completed_at, metadata \
                     FROM todos WHERE session_id = ?1 ORDER BY ordering",
                )
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(params![sid], todo_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }
}

const EVENT_COLS: &str = "id, channel, event_type, timestamp_ms, sequence, payload, created_at";

#[async_trait]
impl EventRepo for SqliteStore {
    async fn append(&self, event: &EventRecord) -> StoreResult<()> {
        let e = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO events ({EVENT_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
                params![
                    e.id,
                    e.channel,
                    e.event_type,
                    e.timestamp_ms,
                    e.sequence as i64,
                    to_json(&e.payload)?,
                    e.created_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn list_after(
        &self,
        channel: &str,
        after: Option<Cursor>,
        limit: usize,
    ) -> StoreResult<Vec<EventRecord>> {
        let ch = channel.to_string();
        self.with_conn(move |conn| {
            let (ts, seq) = after
                .map(|c| (c.timestamp_ms, c.sequence as i64))
                .unwrap_or((i64::MIN, i64::MIN));
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLS} FROM events WHERE channel = ?1 \
                     AND (timestamp_ms > ?2 OR (timestamp_ms = ?2 AND sequence > ?3)) \
                     ORDER BY timestamp_ms, sequence LIMIT ?4"
                ))
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(
                    params![ch, ts, seq, limit.min(i64::MAX as usize) as i64],
                    event_from_row,
                )
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }

    async fn last_n(&self, channel: &str, n: usize) -> StoreResult<Vec<EventRecord>> {
        let ch = channel.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLS} FROM events WHERE channel = ?1 \
                     ORDER BY timestamp_ms DESC, sequence DESC LIMIT ?2"
                ))
                .map_err(StoreError::storage)?;
            let mut rows: Vec<EventRecord> = stmt
                .query_map(params![ch, n as i64], event_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage)?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn count(&self, channel: &str) -> StoreResult<u64> {
        let ch = channel.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM events WHERE channel = ?1",
                params![ch],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn first_last_ids(&self, channel: &str) -> StoreResult<Option<(String, String)>> {
        let ch = channel.to_string();
        self.with_conn(move |conn| {
            let first: Option<String> = conn
                .query_row(
                    "SELECT id FROM events WHERE channel = ?1 \
                     ORDER BY timestamp_ms, sequence LIMIT 1",
                    params![ch],
                    |r| r.get(0),
                )
                .optional()
                .map_err(StoreError::storage)?;
            let last: Option<String> = conn
                .query_row(
                    "SELECT id FROM events WHERE channel = ?1 \
                     ORDER BY timestamp_ms DESC, sequence DESC LIMIT 1",
                    params![ch],
                    |r| r.get(0),
                )
                .optional()
                .map_err(StoreError::storage)?;
            Ok(first.zip(last))
        })
        .await
    }

    async fn last_cursor(&self, channel: &str) -> StoreResult<Option<Cursor>> {
        let ch = channel.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT timestamp_ms, sequence FROM events WHERE channel = ?1 \
                 ORDER BY timestamp_ms DESC, sequence DESC LIMIT 1",
                params![ch],
                |r| {
                    Ok(Cursor {
                        timestamp_ms: r.get(0)?,
                        sequence: r.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn trim(&self, channel: &str, keep_last: usize) -> StoreResult<u64> {
        let ch = channel.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM events WHERE channel = ?1 AND id NOT IN \
                     (SELECT id FROM events WHERE channel = ?1 \
                      ORDER BY timestamp_ms DESC, sequence DESC LIMIT ?2)",
                    params![ch, keep_last as i64],
                )
                .map_err(StoreError::storage)?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl FileRepo for SqliteStore {
    async fn insert(&self, record: &FileContent) -> StoreResult<()> {
        let f = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO file_contents ({FILE_COLS}) \
                          VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
                params![
                    f.id,
                    f.relative_path,
                    f.media_type,
                    f.size as i64,
                    f.storage_key,
                    f.text_content,
                    f.sha256,
                    f.created_at.to_rfc3339(),
                    f.step_id,
                ],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<FileContent>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLS} FROM file_contents WHERE id = ?1"),
                params![id],
                file_from_row,
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn find_by_sha256(&self, sha256: &str) -> StoreResult<Option<FileContent>> {
        let sha = sha256.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLS} FROM file_contents WHERE sha256 = ?1 LIMIT 1"),
                params![sha],
                file_from_row,
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }

    async fn set_step_ref(&self, id: &str, step_id: &str) -> StoreResult<()> {
        let id = id.to_string();
        let step = step_id.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE file_contents SET step_id = ?2 WHERE id = ?1",
                    params![id, step],
                )
                .map_err(StoreError::storage)?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("file {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn find_orphans(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<FileContent>> {
        let cutoff = older_than.to_rfc3339();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {FILE_COLS} FROM file_contents \
                     WHERE step_id IS NULL AND created_at < ?1"
                ))
                .map_err(StoreError::storage)?;
            let rows = stmt
                .query_map(params![cutoff], file_from_row)
                .map_err(StoreError::storage)?
                .collect::<Result<_, _>>()
                .map_err(StoreError::storage);
            rows
        })
        .await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let key: Option<String> = conn
                .query_row(
                    "SELECT storage_key FROM file_contents WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(StoreError::storage)?;
            let Some(key) = key else { return Ok(false) };
            conn.execute("DELETE FROM file_contents WHERE id = ?1", params![id])
                .map_err(StoreError::storage)?;
            conn.execute("DELETE FROM file_blobs WHERE storage_key = ?1", params![key])
                .map_err(StoreError::storage)?;
            Ok(true)
        })
        .await
    }

    async fn put_blob(&self, storage_key: &str, bytes: &[u8]) -> StoreResult<()> {
        let key = storage_key.to_string();
        let bytes = bytes.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO file_blobs (storage_key, bytes) VALUES (?1,?2)",
                params![key, bytes],
            )
            .map_err(StoreError::storage)?;
            Ok(())
        })
        .await
    }

    async fn get_blob(&self, storage_key: &str) -> StoreResult<Option<Vec<u8>>> {
        let key = storage_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT bytes FROM file_blobs WHERE storage_key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(StoreError::storage)
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use braid_types::{MessageRole, PartPayload};
    use serde_json::json;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("braid.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn session_round_trip_preserves_json_fields() {
        let (_dir, store) = temp_store();
        let mut s = Session::new("anthropic", "claude-3-5-sonnet", "coder");
        s.enabled_rule_ids = vec!["r1".into(), "r2".into()];
        s.flags.insert("beta".into(), true);
        s.enqueue_message("pending");
        store.create(&s).await.unwrap();
        let back = SessionRepo::get(&*store, &s.id).await.unwrap().unwrap();
        assert_eq!(back.enabled_rule_ids, vec!["r1", "r2"]);
        assert_eq!(back.flags.get("beta"), Some(&true));
        assert_eq!(back.message_queue.len(), 1);
    }

    #[tokio::test]
    async fn foreign_key_cascade_removes_subtree() {
        let (_dir, store) = temp_store();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();
        let m = MessageRecord::new(&s.id, MessageRole::Assistant, 0);
        store.create_message(&m).await.unwrap();
        let step = Step::new(&m.id, 0, "mock", "mock-model");
        store.create_step(&step).await.unwrap();
        store.upsert_part(&Part::text(&step.id, 0)).await.unwrap();
        store
            .set_step_usage(&step.id, StepUsage {
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            })
            .await
            .unwrap();

        assert!(SessionRepo::delete(&*store, &s.id).await.unwrap());
        assert!(store.get_message(&m.id).await.unwrap().is_none());
        assert!(store.list_parts(&step.id).await.unwrap().is_empty());
        assert!(store.get_step_usage(&step.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn part_upsert_replaces_in_place() {
        let (_dir, store) = temp_store();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();
        let m = MessageRecord::new(&s.id, MessageRole::Assistant, 0);
        store.create_message(&m).await.unwrap();
        let step = Step::new(&m.id, 0, "mock", "mock-model");
        store.create_step(&step).await.unwrap();

        let mut part = Part::text(&step.id, 0);
        part.append_content("hel");
        store.upsert_part(&part).await.unwrap();
        part.append_content("lo");
        part.status = RunStatus::Completed;
        store.upsert_part(&part).await.unwrap();

        let parts = store.list_parts(&step.id).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].status, RunStatus::Completed);
        match &parts[0].payload {
            PartPayload::Text { content } => assert_eq!(content, "hello"),
            _ => panic!("wrong payload"),
        }
    }

    #[tokio::test]
    async fn event_cursor_replay_and_trim() {
        let (_dir, store) = temp_store();
        for i in 0..20u64 {
            let e = EventRecord::new("sessions", "tick", 1000 + i as i64, i, json!({"i": i}));
            EventRepo::append(&*store, &e).await.unwrap();
        }
        let mid = Cursor {
            timestamp_ms: 1009,
            sequence: 9,
        };
        let tail = store
            .list_after("sessions", Some(mid), usize::MAX)
            .await
            .unwrap();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].sequence, 10);

        let last = store.last_n("sessions", 3).await.unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[2].sequence, 19);

        let dropped = store.trim("sessions", 5).await.unwrap();
        assert_eq!(dropped, 15);
        assert_eq!(EventRepo::count(&*store, "sessions").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn todo_replace_is_atomic_whole_list() {
        let (_dir, store) = temp_store();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();
        let first = vec![
            Todo::new(1, &s.id, "a", "Doing a", 0),
            Todo::new(2, &s.id, "b", "Doing b", 1),
        ];
        store.replace_all(&s.id, &first).await.unwrap();
        let second = vec![Todo::new(3, &s.id, "c", "Doing c", 0)];
        store.replace_all(&s.id, &second).await.unwrap();
        let listed = TodoRepo::list(&*store, &s.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 3);
    }

    #[tokio::test]
    async fn orphan_files_detach_on_session_delete() {
        let (_dir, store) = temp_store();
        let s = Session::new("mock", "mock-model", "coder");
        store.create(&s).await.unwrap();
        let m = MessageRecord::new(&s.id, MessageRole::User, 0);
        store.create_message(&m).await.unwrap();
        let step = Step::new(&m.id, 0, "mock", "mock-model");
        store.create_step(&step).await.unwrap();

        let f = FileContent::new("a.txt", "text/plain", 1, "blobs/a", "sha-a");
        FileRepo::insert(&*store, &f).await.unwrap();
        store.set_step_ref(&f.id, &step.id).await.unwrap();

        SessionRepo::delete(&*store, &s.id).await.unwrap();
        let back = FileRepo::get(&*store, &f.id).await.unwrap().unwrap();
        assert!(back.is_orphan());
    }
}
