/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The per-node single-flight executor.
//!
//! Each node's op is invoked through one of these. The four operations
//! (cache map, cache load, per-slot slow cache, exec) run at most once
//! concurrently per node no matter how many callers demand them; success
//! and deterministic failure are memoized, while outcomes whose root cause
//! is cancellation are discarded so the next caller retries.

use std::sync::Arc;
use std::sync::Weak;

use dupe::Dupe;
use forge_futures::CancellableResult;
use forge_futures::CancellationContext;
use forge_futures::FlightGroup;
use forge_progress::Writer;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::Instrument;

use crate::api::cache::CacheKey;
use crate::api::cache::CacheManager;
use crate::api::cache::CacheRecord;
use crate::api::op::Builder;
use crate::api::op::CacheMap;
use crate::api::op::Op;
use crate::api::op::ResolveOpFn;
use crate::api::op::ResultBasedCacheFn;
use crate::api::output::SharedOutput;
use crate::api::vertex::Index;
use crate::api::vertex::Vertex;
use crate::ctx::BuildContext;
use crate::digest::ContentDigest;
use crate::error::SolverError;
use crate::error::SolverResult;
use crate::progress::ClientVertex;
use crate::state::NodeState;
use crate::state::SubBuilder;
use crate::HashMap;

pub struct SharedOp {
    vertex: Arc<dyn Vertex>,
    /// The owning state; ownership stays with the registry's actives table.
    state: Weak<NodeState>,
    resolve_op: ResolveOpFn,
    resolved: OnceCell<ResolvedOp>,

    flight_cache_map: FlightGroup<SolverResult<Arc<CacheMap>>>,
    flight_exec: FlightGroup<SolverResult<ExecRes>>,
    flight_slow_cache: FlightGroup<SolverResult<ContentDigest>>,

    memo: Mutex<OpMemo>,
    slow_cache: Mutex<SlowCacheMemo>,
}

struct ResolvedOp {
    /// The resolver outcome, sticky for the life of the state.
    op: SolverResult<Arc<dyn Op>>,
    sub_builder: Arc<SubBuilder>,
}

#[derive(Default)]
struct OpMemo {
    cache_res: Option<Arc<CacheMap>>,
    cache_err: Option<SolverError>,
    exec_res: Option<ExecRes>,
    exec_err: Option<SolverError>,
}

#[derive(Default)]
struct SlowCacheMemo {
    res: HashMap<Index, ContentDigest>,
    err: HashMap<Index, SolverError>,
}

/// Completed exec outcome shared by every caller: one shared handle per
/// output, plus the cache keys accumulated from recursive sub-builds.
#[derive(Clone)]
struct ExecRes {
    outputs: Vec<SharedOutput>,
    exporters: Vec<CacheKey>,
}

impl SharedOp {
    pub(crate) fn new(state: &Arc<NodeState>, resolve_op: ResolveOpFn) -> Arc<Self> {
        Arc::new(Self {
            vertex: state.vertex().dupe(),
            state: Arc::downgrade(state),
            resolve_op,
            resolved: OnceCell::new(),
            flight_cache_map: FlightGroup::new(),
            flight_exec: FlightGroup::new(),
            flight_slow_cache: FlightGroup::new(),
            memo: Mutex::new(OpMemo::default()),
            slow_cache: Mutex::new(SlowCacheMemo::default()),
        })
    }

    pub fn ignore_cache(&self) -> bool {
        self.vertex.options().ignore_cache
    }

    /// Live combination of the node's main cache with inherited extras.
    pub fn cache(&self) -> SolverResult<Arc<dyn CacheManager>> {
        Ok(self.state()?.combined_cache_manager())
    }

    fn state(&self) -> SolverResult<Arc<NodeState>> {
        self.state.upgrade().ok_or_else(SolverError::shut_down)
    }

    fn resolved(&self) -> SolverResult<&ResolvedOp> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(resolved);
        }
        let state = self.state()?;
        Ok(self.resolved.get_or_init(|| {
            let sub_builder = state.builder();
            let builder = sub_builder.dupe() as Arc<dyn Builder>;
            let op = (self.resolve_op)(state.vertex(), &builder)
                .map(Arc::from)
                .map_err(|err| SolverError::resolve_op(state.digest(), err));
            ResolvedOp { op, sub_builder }
        }))
    }

    /// Context for the underlying op: the flight's own cancellation, the
    /// node's progress fan-out, and the best-effort session id.
    fn op_ctx(&self, state: &NodeState, worker_ctx: CancellationContext) -> BuildContext {
        let ctx = BuildContext::new(worker_ctx)
            .with_progress(state.mpw.dupe() as Arc<dyn Writer<ClientVertex>>);
        match state.get_session_id() {
            Some(session_id) => ctx.with_session_id(&session_id),
            None => ctx,
        }
    }

    pub async fn cache_map(self: &Arc<Self>, ctx: &BuildContext) -> SolverResult<Arc<CacheMap>> {
        let op = self.resolved()?.op.clone()?;
        let this = self.dupe();
        let res = self
            .flight_cache_map
            .run(ctx.cancellation(), "cachemap", move |worker_ctx| async move {
                this.cache_map_worker(worker_ctx, op).await
            })
            .await;
        flatten_flight(res)
    }

    async fn cache_map_worker(
        self: Arc<Self>,
        worker_ctx: CancellationContext,
        op: Arc<dyn Op>,
    ) -> SolverResult<Arc<CacheMap>> {
        {
            let memo = self.memo.lock();
            if let Some(res) = &memo.cache_res {
                return Ok(res.dupe());
            }
            if let Some(err) = &memo.cache_err {
                return Err(err.dupe());
            }
        }

        let state = self.state()?;
        let ctx = self.op_ctx(&state, worker_ctx.dupe());

        let res = if self.vertex.inputs().is_empty() {
            // no inputs means no cache-key negotiation upstream: this is an
            // actual start of evaluation, surface it like exec
            let span =
                tracing::info_span!("cache_request", vertex = %self.vertex.name());
            state.notify_started(false);
            let res = op.cache_map(&ctx).instrument(span.clone()).await;
            if let Err(err) = &res {
                span.in_scope(|| tracing::debug!(error = %err, "cache request failed"));
            }
            state.notify_completed(res.as_ref().err().map(|err| format!("{:#}", err)), false);
            res
        } else {
            op.cache_map(&ctx).await
        };

        let res = res.map(Arc::new).map_err(SolverError::op);
        match res {
            Ok(cache_map) => {
                self.memo.lock().cache_res = Some(cache_map.dupe());
                Ok(cache_map)
            }
            Err(err) => {
                if !(err.is_cancelled() && worker_ctx.is_cancelled()) {
                    self.memo.lock().cache_err = Some(err.dupe());
                }
                Err(err)
            }
        }
    }

    pub async fn load_cache(
        &self,
        ctx: &BuildContext,
        record: &CacheRecord,
    ) -> SolverResult<SharedOutput> {
        let state = self.state()?;
        let cache = state.combined_cache_manager();
        let ctx = ctx.with_progress(state.mpw.dupe() as Arc<dyn Writer<ClientVertex>>);

        let span = tracing::info_span!("load_cache", vertex = %self.vertex.name());
        state.notify_started(true);
        let res = cache.load(&ctx, record).instrument(span.clone()).await;
        if let Err(err) = &res {
            span.in_scope(|| tracing::debug!(error = %err, "cache load failed"));
        }
        state.notify_completed(res.as_ref().err().map(|err| format!("{:#}", err)), true);
        res.map_err(SolverError::op)
    }

    pub async fn exec(
        self: &Arc<Self>,
        ctx: &BuildContext,
        inputs: Vec<SharedOutput>,
    ) -> SolverResult<(Vec<SharedOutput>, Vec<CacheKey>)> {
        let (op, sub_builder) = {
            let resolved = self.resolved()?;
            (resolved.op.clone()?, resolved.sub_builder.dupe())
        };
        let this = self.dupe();
        let res = self
            .flight_exec
            .run(ctx.cancellation(), "exec", move |worker_ctx| async move {
                this.exec_worker(worker_ctx, op, sub_builder, inputs).await
            })
            .await;
        let exec_res = flatten_flight(res)?;
        // every caller gets its own clones of the shared handles
        Ok((
            exec_res.outputs.iter().map(Dupe::dupe).collect(),
            exec_res.exporters,
        ))
    }

    async fn exec_worker(
        self: Arc<Self>,
        worker_ctx: CancellationContext,
        op: Arc<dyn Op>,
        sub_builder: Arc<SubBuilder>,
        inputs: Vec<SharedOutput>,
    ) -> SolverResult<ExecRes> {
        {
            let memo = self.memo.lock();
            if let Some(res) = &memo.exec_res {
                return Ok(res.clone());
            }
            if let Some(err) = &memo.exec_err {
                return Err(err.dupe());
            }
        }

        let state = self.state()?;
        let ctx = self.op_ctx(&state, worker_ctx.dupe());

        let span = tracing::info_span!("exec", vertex = %self.vertex.name());
        state.notify_started(false);
        let res = op.exec(&ctx, inputs).instrument(span.clone()).await;
        if let Err(err) = &res {
            span.in_scope(|| tracing::debug!(error = %err, "exec failed"));
        }
        state.notify_completed(res.as_ref().err().map(|err| format!("{:#}", err)), false);

        match res.map_err(SolverError::op) {
            Ok(outputs) => {
                let res = ExecRes {
                    outputs: outputs.into_iter().map(SharedOutput::new).collect(),
                    exporters: sub_builder.exporters_snapshot(),
                };
                self.memo.lock().exec_res = Some(res.clone());
                Ok(res)
            }
            Err(err) => {
                if !(err.is_cancelled() && worker_ctx.is_cancelled()) {
                    self.memo.lock().exec_err = Some(err.dupe());
                }
                Err(err)
            }
        }
    }

    /// Result-based cache key for one input slot, memoized per index.
    pub async fn calc_slow_cache(
        self: &Arc<Self>,
        ctx: &BuildContext,
        index: Index,
        f: ResultBasedCacheFn,
        result: SharedOutput,
    ) -> SolverResult<ContentDigest> {
        let key = format!("slow-compute-{}", index);
        let this = self.dupe();
        let res = self
            .flight_slow_cache
            .run(ctx.cancellation(), &key, move |worker_ctx| async move {
                this.slow_cache_worker(worker_ctx, index, f, result).await
            })
            .await;
        flatten_flight(res)
    }

    async fn slow_cache_worker(
        self: Arc<Self>,
        worker_ctx: CancellationContext,
        index: Index,
        f: ResultBasedCacheFn,
        result: SharedOutput,
    ) -> SolverResult<ContentDigest> {
        {
            let memo = self.slow_cache.lock();
            if let Some(res) = memo.res.get(&index) {
                return Ok(res.dupe());
            }
            if let Some(err) = memo.err.get(&index) {
                return Err(err.dupe());
            }
        }

        let state = self.state()?;
        let ctx = BuildContext::new(worker_ctx.dupe())
            .with_progress(state.mpw.dupe() as Arc<dyn Writer<ClientVertex>>);

        let res = f(ctx, result).await.map_err(SolverError::op);
        match res {
            Ok(digest) => {
                self.slow_cache.lock().res.insert(index, digest);
                Ok(digest)
            }
            Err(err) => {
                if !(err.is_cancelled() && worker_ctx.is_cancelled()) {
                    self.slow_cache.lock().err.insert(index, err.dupe());
                }
                Err(err)
            }
        }
    }

    /// Drops the cached execution outputs. Called when the owning state is
    /// released.
    pub(crate) fn release(&self) {
        self.memo.lock().exec_res = None;
    }
}

fn flatten_flight<T>(res: CancellableResult<SolverResult<T>>) -> SolverResult<T> {
    res.map_err(SolverError::cancelled)?
}
