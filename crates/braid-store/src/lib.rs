// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Repository traits and storage backends.
//!
//! The runtime never talks to a database directly — it goes through the
//! trait objects defined here, injected once at startup.  Two backends are
//! provided: a fully in-memory store (tests, ephemeral sessions) and a
//! SQLite store with foreign-key cascade (the default durable backend).
//! Both uphold the same contract, so every repository test runs against both.

mod error;
mod memory;
mod repo;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use repo::{
    EventRepo, FileRepo, MessageRepo, SessionPage, SessionRepo, Store, TodoRepo,
};
pub use sqlite::SqliteStore;
