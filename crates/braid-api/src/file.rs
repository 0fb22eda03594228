// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `file.*` procedures: the object store surface.

use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use braid_core::AppContext;
use braid_rpc::{Procedure, RouterBuilder, RpcError};
use braid_types::FileContent;

use crate::helpers::{req_str, store_err};

fn decode_base64(b64: &str) -> Result<Vec<u8>, RpcError> {
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| RpcError::validation(format!("content is not valid base64: {e}")))
}

pub fn register(builder: RouterBuilder<AppContext>) -> RouterBuilder<AppContext> {
    builder
        .procedure(
            "file.upload",
            Procedure::mutation(
                json!({
                    "type": "object",
                    "properties": {
                        "relativePath": { "type": "string", "minLength": 1 },
                        "mediaType": { "type": "string", "minLength": 1 },
                        "base64": { "type": "string" },
                        "textContent": { "type": "string" }
                    },
                    "required": ["relativePath", "mediaType", "base64"]
                }),
                |ctx: AppContext, input| async move {
                    let bytes = decode_base64(&req_str(&input, "base64")?)?;
                    let sha256 = hex::encode(Sha256::digest(&bytes));

                    // Content-addressed dedup: identical bytes return the
                    // existing record.
                    if let Some(existing) = ctx
                        .store
                        .files
                        .find_by_sha256(&sha256)
                        .await
                        .map_err(store_err)?
                    {
                        return Ok(json!({
                            "fileId": existing.id,
                            "sha256": existing.sha256,
                            "url": format!("/files/{}", existing.id),
                            "deduplicated": true,
                        }));
                    }

                    let storage_key = format!("blobs/{}", &sha256[..16]);
                    let mut record = FileContent::new(
                        req_str(&input, "relativePath")?,
                        req_str(&input, "mediaType")?,
                        bytes.len() as u64,
                        &storage_key,
                        &sha256,
                    );
                    record.text_content =
                        input.get("textContent").and_then(Value::as_str).map(str::to_string);
                    ctx.store
                        .files
                        .put_blob(&storage_key, &bytes)
                        .await
                        .map_err(store_err)?;
                    ctx.store.files.insert(&record).await.map_err(store_err)?;
                    Ok(json!({
                        "fileId": record.id,
                        "sha256": record.sha256,
                        "url": format!("/files/{}", record.id),
                        "deduplicated": false,
                    }))
                },
            ),
        )
        .procedure(
            "file.download",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": { "fileId": { "type": "string", "minLength": 1 } },
                    "required": ["fileId"]
                }),
                |ctx: AppContext, input| async move {
                    let id = req_str(&input, "fileId")?;
                    let record = ctx
                        .store
                        .files
                        .get(&id)
                        .await
                        .map_err(store_err)?
                        .ok_or_else(|| RpcError::not_found(format!("file {id}")))?;
                    let bytes = ctx
                        .store
                        .files
                        .get_blob(&record.storage_key)
                        .await
                        .map_err(store_err)?
                        .ok_or_else(|| RpcError::not_found(format!("blob for file {id}")))?;
                    Ok(json!({
                        "fileId": record.id,
                        "mediaType": record.media_type,
                        "base64": base64::engine::general_purpose::STANDARD.encode(bytes),
                    }))
                },
            ),
        )
        .procedure(
            "file.getMetadata",
            Procedure::query(
                json!({
                    "type": "object",
                    "properties": { "fileId": { "type": "string", "minLength": 1 } },
                    "required": ["fileId"]
                }),
                |ctx: AppContext, input| async move {
                    let id = req_str(&input, "fileId")?;
                    let record = ctx
                        .store
                        .files
                        .get(&id)
                        .await
                        .map_err(store_err)?
                        .ok_or_else(|| RpcError::not_found(format!("file {id}")))?;
                    Ok(json!({ "file": record }))
                },
            ),
        )
}
