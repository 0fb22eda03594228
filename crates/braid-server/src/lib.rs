// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Over-the-wire transports for the procedure catalog.
//!
//! Three ways in, one dispatch path: everything funnels into the same
//! in-process router the terminal UI uses directly.
//!
//! - `POST /rpc` — request/response for queries and mutations.
//! - `GET /rpc/subscribe` — SSE, one-directional subscription delivery
//!   with cursor resumption via query parameters.
//! - `GET /ws` — bidirectional frames with correlation ids; many
//!   subscriptions per connection, client-initiated unsubscribe.

mod client;
mod http;
mod sse;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use braid_core::AppContext;
use braid_rpc::Router;

pub use client::WsTransport;
pub use http::rpc_handler;
pub use sse::sse_handler;
pub use ws::ws_handler;

/// Shared state for every transport handler.
#[derive(Clone)]
pub struct ServerState {
    pub router: Arc<Router<AppContext>>,
}

/// Assemble the axum application.
pub fn build_app(router: Arc<Router<AppContext>>) -> axum::Router {
    let state = ServerState { router };
    axum::Router::new()
        .route("/rpc", post(http::rpc_handler))
        .route("/rpc/subscribe", get(sse::sse_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(http::health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(addr: std::net::SocketAddr, router: Arc<Router<AppContext>>) -> anyhow::Result<()> {
    let app = build_app(router);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "braid server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
