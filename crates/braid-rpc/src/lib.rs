// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Typed query/mutation/subscription dispatcher.
//!
//! Procedures are declared once — an input schema, a kind, and one or both
//! of a one-shot resolver and a subscription resolver — and exposed over
//! any transport: in-process dispatch, HTTP, SSE, WebSocket.  The router is
//! generic over the context type so this crate stays free of runtime
//! dependencies; the API surface instantiates it with its own context.
//!
//! The client half ([`client`]) keeps an entity cache with stacked
//! optimistic updates and interprets the advisory update strategies.

mod client;
mod error;
mod procedure;
mod retry;
mod router;
mod schema;
mod select;
mod wire;

pub use client::{EntityCache, OptimisticSpec, RpcClient, Transport, UpdateMode};
pub use error::{ErrorKind, RpcError, WireError};
pub use procedure::{Procedure, ProcedureKind, ValueStream};
pub use retry::Backoff;
pub use router::{Router, RouterBuilder};
pub use schema::validate_input;
pub use select::apply_select;
pub use wire::{HttpRequest, SseFrame, WsFrame, WsFrameType};
