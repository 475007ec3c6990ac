/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::api::output::CachedResult;
use crate::api::output::Output;
use crate::api::output::SharedOutput;
use crate::api::vertex::Edge;
use crate::api::vertex::Vertex;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;
use crate::error::SolverResult;

/// Computes a content-addressed cache key from an input's concrete result.
/// Expensive; the shared operation memoizes it per input slot.
pub type ResultBasedCacheFn =
    Arc<dyn Fn(BuildContext, SharedOutput) -> BoxFuture<'static, anyhow::Result<ContentDigest>> + Send + Sync>;

/// Description of a vertex's cache-key inputs, computed by its op.
pub struct CacheMap {
    pub digest: ContentDigest,
    /// One entry per input slot, in input order.
    pub deps: Vec<CacheMapDep>,
}

#[derive(Default)]
pub struct CacheMapDep {
    /// Narrows the input before keying.
    pub selector: Option<ContentDigest>,
    pub computed_digest: Option<ResultBasedCacheFn>,
}

/// The operation behind a vertex. Produced by the resolver handed to the
/// registry; invoked through the per-node shared operation so each method
/// runs at most once concurrently per node.
#[async_trait]
pub trait Op: Send + Sync {
    async fn cache_map(&self, ctx: &BuildContext) -> anyhow::Result<CacheMap>;

    /// Run the operation over materialized inputs, one result per output
    /// index.
    async fn exec(
        &self,
        ctx: &BuildContext,
        inputs: Vec<SharedOutput>,
    ) -> anyhow::Result<Vec<Box<dyn Output>>>;
}

pub type CallFn = Box<dyn FnOnce(BuildContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Capability handed to a resolver-produced [`Op`] so that builds requested
/// from inside an op are attributed to the owning node.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, ctx: &BuildContext, edge: Edge) -> SolverResult<CachedResult>;

    /// Runs `f` inside a synthetic vertex context so ad-hoc work shows up
    /// in the progress stream like any graph node.
    async fn call(&self, ctx: &BuildContext, name: &str, f: CallFn) -> SolverResult<()>;
}

/// Finds an [`Op`] implementation for a vertex. Invoked at most once per
/// shared node; both the op and a failure are sticky for the node's life.
pub type ResolveOpFn = Arc<
    dyn Fn(&Arc<dyn Vertex>, &Arc<dyn Builder>) -> anyhow::Result<Box<dyn Op>> + Send + Sync,
>;
