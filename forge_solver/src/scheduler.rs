/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use std::sync::atomic::AtomicIsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;

use crate::api::output::CachedResult;
use crate::api::vertex::Edge;
use crate::ctx::BuildContext;
use crate::error::SolverResult;
use crate::jobs::Solver;
use crate::shared_op::SharedOp;

/// Traverses the loaded graph and drives node operations to a cached
/// result. Provided by the embedder; the registry only hands it loaded
/// edges and forwards its `stop` on close.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// `edge.vertex` must already be loaded into the registry.
    async fn build(&self, ctx: &BuildContext, edge: Edge) -> SolverResult<CachedResult>;

    fn stop(&self);
}

/// Constructs the scheduler during registry construction, receiving a weak
/// back-reference to it.
pub type SchedulerFactory = Box<dyn FnOnce(Weak<Solver>) -> Arc<dyn Scheduler> + Send>;

/// Scheduler-visible edge: one output index of a shared node, bound to the
/// node's shared operation.
///
/// Reference counts are owned by the collaborating scheduler; the registry
/// only moves them when an edge is installed, replaced or released with
/// its state.
pub struct SolverEdge {
    edge: Edge,
    op: Arc<SharedOp>,
    refcount: AtomicIsize,
}

impl SolverEdge {
    pub(crate) fn new(edge: Edge, op: Arc<SharedOp>) -> Arc<Self> {
        Arc::new(Self {
            edge,
            op,
            refcount: AtomicIsize::new(1),
        })
    }

    pub fn edge(&self) -> &Edge {
        &self.edge
    }

    pub fn op(&self) -> &Arc<SharedOp> {
        &self.op
    }

    pub fn increment_reference_count(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "edge {:?} released below zero", self.edge);
    }

    pub fn reference_count(&self) -> isize {
        self.refcount.load(Ordering::Acquire)
    }
}
