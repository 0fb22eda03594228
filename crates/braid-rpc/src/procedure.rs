// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Future, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RpcError;

pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Value, RpcError>> + Send>>;

type ResolverFn<C> =
    Arc<dyn Fn(C, Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;
type SubscribeFn<C> =
    Arc<dyn Fn(C, Value) -> BoxFuture<'static, Result<ValueStream, RpcError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

/// One declared procedure: an input schema, a kind, and one or both of a
/// one-shot resolver and a subscription resolver.
///
/// A procedure may carry both resolvers at once, letting clients choose
/// between `fetch` and `subscribe` on the same endpoint (e.g.
/// `session.getById`).
pub struct Procedure<C> {
    pub kind: ProcedureKind,
    pub input_schema: Value,
    pub(crate) resolver: Option<ResolverFn<C>>,
    pub(crate) subscription: Option<SubscribeFn<C>>,
}

impl<C: Send + 'static> Procedure<C> {
    pub fn query<F, Fut>(input_schema: Value, f: F) -> Self
    where
        F: Fn(C, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            kind: ProcedureKind::Query,
            input_schema,
            resolver: Some(Arc::new(move |ctx, input| Box::pin(f(ctx, input)))),
            subscription: None,
        }
    }

    pub fn mutation<F, Fut>(input_schema: Value, f: F) -> Self
    where
        F: Fn(C, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            kind: ProcedureKind::Mutation,
            input_schema,
            resolver: Some(Arc::new(move |ctx, input| Box::pin(f(ctx, input)))),
            subscription: None,
        }
    }

    pub fn subscription<F, Fut>(input_schema: Value, f: F) -> Self
    where
        F: Fn(C, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, RpcError>> + Send + 'static,
    {
        Self {
            kind: ProcedureKind::Subscription,
            input_schema,
            resolver: None,
            subscription: Some(Arc::new(move |ctx, input| Box::pin(f(ctx, input)))),
        }
    }

    /// Attach a subscription resolver to a query/mutation, making the
    /// procedure dual-nature.
    pub fn with_subscription<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(C, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueStream, RpcError>> + Send + 'static,
    {
        self.subscription = Some(Arc::new(move |ctx, input| Box::pin(f(ctx, input))));
        self
    }

    pub fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }
}
