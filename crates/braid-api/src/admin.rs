// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `admin.*` procedures.

use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use braid_core::AppContext;
use braid_events::channels;
use braid_rpc::{Procedure, Router, RouterBuilder, RpcError};

use crate::helpers::{req_str, store_err};

/// Files orphaned longer than this are removed by `admin.forceGC`.
const ORPHAN_GRACE_HOURS: i64 = 24;

/// The API inventory is derived from the finished router, which does not
/// exist yet while its own procedures are being declared.  The cell is
/// filled right after `build` and read by the resolvers.
#[derive(Clone, Default)]
pub struct InventoryCell {
    cell: Arc<OnceLock<Vec<(String, braid_rpc::ProcedureKind, bool)>>>,
    docs: Arc<OnceLock<std::collections::HashMap<String, Value>>>,
}

impl InventoryCell {
    pub fn fill(&self, router: &Router<AppContext>) {
        let inventory = router.inventory();
        let docs = inventory
            .iter()
            .filter_map(|(path, _, _)| router.describe(path).map(|d| (path.clone(), d)))
            .collect();
        let _ = self.cell.set(inventory);
        let _ = self.docs.set(docs);
    }
}

pub fn register(
    builder: RouterBuilder<AppContext>,
    inventory: InventoryCell,
) -> RouterBuilder<AppContext> {
    let inv_for_list = inventory.clone();
    let inv_for_docs = inventory;
    builder
        .procedure(
            "admin.deleteAllSessions",
            Procedure::mutation(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                let mut deleted = 0u64;
                loop {
                    let page = ctx
                        .store
                        .sessions
                        .list_recent(100, None)
                        .await
                        .map_err(store_err)?;
                    if page.sessions.is_empty() {
                        break;
                    }
                    for session in page.sessions {
                        if ctx
                            .store
                            .sessions
                            .delete(&session.id)
                            .await
                            .map_err(store_err)?
                        {
                            deleted += 1;
                            ctx.asks.clear_session(&session.id);
                            let _ = ctx
                                .broker
                                .publish(
                                    &channels::session(&session.id),
                                    "session-deleted",
                                    json!({ "sessionId": session.id }),
                                )
                                .await;
                            let _ = ctx
                                .broker
                                .publish(
                                    channels::SESSIONS,
                                    "session-deleted",
                                    json!({ "sessionId": session.id }),
                                )
                                .await;
                        }
                    }
                }
                Ok(json!({ "deleted": deleted }))
            }),
        )
        .procedure(
            "admin.getSystemStats",
            Procedure::query(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                let sessions = ctx.store.sessions.count().await.map_err(store_err)?;
                let processes = ctx.bash.list();
                Ok(json!({
                    "sessions": sessions,
                    "bashProcesses": processes.len(),
                    "activeBash": ctx.bash.get_active_bash_id(),
                    "bashQueueLength": ctx.bash.get_active_queue_length(),
                }))
            }),
        )
        .procedure(
            "admin.getHealth",
            Procedure::query(json!({ "type": "object" }), |_ctx: AppContext, _input| async move {
                Ok(json!({ "status": "ok", "timestamp": Utc::now().timestamp_millis() }))
            }),
        )
        .procedure(
            "admin.forceGC",
            Procedure::mutation(json!({ "type": "object" }), |ctx: AppContext, _input| async move {
                // Orphan file cleanup past the grace window.
                let cutoff = Utc::now() - Duration::hours(ORPHAN_GRACE_HOURS);
                let orphans = ctx
                    .store
                    .files
                    .find_orphans(cutoff)
                    .await
                    .map_err(store_err)?;
                let mut removed = 0u64;
                for orphan in orphans {
                    if ctx.store.files.delete(&orphan.id).await.map_err(store_err)? {
                        removed += 1;
                    }
                }
                Ok(json!({ "orphanFilesRemoved": removed }))
            }),
        )
        .procedure(
            "admin.getAPIInventory",
            Procedure::query(json!({ "type": "object" }), move |_ctx: AppContext, _input| {
                let inv = inv_for_list.clone();
                async move {
                    let list: Vec<Value> = inv
                        .cell
                        .get()
                        .map(|entries| {
                            entries
                                .iter()
                                .map(|(path, kind, subscribable)| {
                                    json!({
                                        "path": path,
                                        "kind": kind,
                                        "subscribable": subscribable,
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok(json!({ "procedures": list }))
                }
            }),
        )
        .procedure(
            "admin.getAPIDocs",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string", "minLength": 1 } },
                    "required": ["path"]
                }),
                move |_ctx: AppContext, input| {
                    let inv = inv_for_docs.clone();
                    async move {
                        let path = req_str(&input, "path")?;
                        inv.docs
                            .get()
                            .and_then(|docs| docs.get(&path).cloned())
                            .ok_or_else(|| {
                                RpcError::not_found(format!("unknown procedure {path}"))
                            })
                    }
                },
            ),
        )
}
