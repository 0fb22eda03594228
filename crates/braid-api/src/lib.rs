// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The complete procedure catalog.
//!
//! Every public query, mutation, and subscription is declared here, grouped
//! by namespace (`session`, `message`, `todo`, `file`, `bash`, `admin`,
//! `events`, `config`) and wired onto the braid-rpc router with the
//! [`braid_core::AppContext`] as the bound context.  Side-effecting
//! procedures publish through the broker; the orchestrator and the bash
//! manager are invoked from here and nowhere else.

mod admin;
mod bash;
mod config;
mod events;
mod file;
mod helpers;
mod message;
pub mod optimistic;
mod session;
mod todo;

use std::sync::Arc;

use braid_core::AppContext;
use braid_rpc::{Router, RouterBuilder};

/// Build the full router.  The path → procedure table is immutable after
/// this returns.
pub fn build_router(ctx: AppContext) -> Arc<Router<AppContext>> {
    let inventory = admin::InventoryCell::default();
    let builder = RouterBuilder::new();
    let builder = session::register(builder);
    let builder = message::register(builder);
    let builder = todo::register(builder);
    let builder = file::register(builder);
    let builder = bash::register(builder);
    let builder = events::register(builder);
    let builder = config::register(builder);
    let builder = admin::register(builder, inventory.clone());
    let router = builder.build(ctx);
    inventory.fill(&router);
    router
}
